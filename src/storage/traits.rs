use super::record::{InsertedLog, LogRecord, PendingLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable queue of log records waiting for delivery.
///
/// Implementations serialize conflicting writes themselves; callers may share
/// one store between the batching engine and the delivery controller of a
/// single destination, but never across destinations.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Append a record, stamping its insertion time.
    async fn insert(&self, log: &PendingLog) -> Result<InsertedLog, StorageError>;

    async fn get(&self, id: i64) -> Result<Option<LogRecord>, StorageError>;

    /// Claim the oldest unclaimed records created in `[from, to]` for
    /// `batch_id`, at most `max_count` of them and no more than `max_size`
    /// bytes (a single oversized record is still claimed on its own). Returns
    /// the claimed records oldest first.
    async fn select_for_delivery(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_id: i64,
        max_count: usize,
        max_size: i64,
    ) -> Result<Vec<LogRecord>, StorageError>;

    /// Records currently claimed by `batch_id`, oldest first.
    async fn select_batch(&self, batch_id: i64) -> Result<Vec<LogRecord>, StorageError>;

    /// Delete every record claimed by `batch_id`. Unknown ids delete nothing.
    async fn delete_batch(&self, batch_id: i64) -> Result<usize, StorageError>;

    /// Delete records created before `cutoff`, claimed or not.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;

    /// Return every claimed record to the pending state.
    async fn reset_all_claims(&self) -> Result<usize, StorageError>;

    /// Number of stored records and the sum of their sizes.
    async fn count_and_size(&self) -> Result<(usize, i64), StorageError>;

    /// Same as [`LogStore::count_and_size`] for unclaimed records only.
    async fn count_pending(&self) -> Result<(usize, i64), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}
