pub mod accumulator;
pub mod engine;

pub use accumulator::{epoch, new_batch_id, BatchAccumulator, BatchLimits, BatchState, ReadyBatch};
pub use engine::{BatchEngine, BatchEvent, ClaimedBatch, EngineSettings};
