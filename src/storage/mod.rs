pub mod duckdb;
pub mod record;
pub mod traits;

pub use self::duckdb::DuckDbLogStore;
pub use record::{InsertedLog, LogRecord, PendingLog, RecordError, EXTRA_MSG_PAYLOAD_SIZE};
pub use traits::{LogStore, StorageError};
