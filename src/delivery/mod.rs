pub mod controller;
pub mod http;
pub mod sink;

pub use controller::{ControllerSettings, DeliveryController, DestinationState, SetupError};
pub use http::HttpLogSink;
pub use sink::{InputLogEvent, LogSink, LogTarget, SinkError};
