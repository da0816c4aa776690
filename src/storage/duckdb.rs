use super::record::{InsertedLog, LogRecord, PendingLog};
use super::traits::{LogStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SELECT_COLUMNS: &str =
    "SELECT id, message, timestamp, size, created_at, send_index FROM log";

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // Without a process table, treat the lock as live.
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    // Error format: "... (PID 12345) ..."
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the WAL and lock files a crashed process left next to the database.
fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    let wal_path = PathBuf::from(format!("{}.wal", db_path.display()));
    let lock_path = PathBuf::from(format!("{}.lock", db_path.display()));

    if wal_path.exists() {
        std::fs::remove_file(&wal_path)?;
        tracing::info!(path = %wal_path.display(), "Removed stale WAL file");
    }

    if lock_path.exists() {
        std::fs::remove_file(&lock_path)?;
        tracing::info!(path = %lock_path.display(), "Removed stale lock file");
    }

    Ok(())
}

fn micros_to_datetime(micros: i64, column: usize) -> duckdb::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            column,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid timestamp",
            )),
        )
    })
}

fn row_to_record(row: &duckdb::Row<'_>) -> duckdb::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        message: row.get(1)?,
        timestamp: micros_to_datetime(row.get(2)?, 2)?,
        size: row.get(3)?,
        created_at: micros_to_datetime(row.get(4)?, 4)?,
        batch_id: row.get(5)?,
    })
}

struct Connected {
    conn: Connection,
    /// Highest `created_at` handed out, in microseconds. Keeps insertion
    /// times non-decreasing when the wall clock steps backwards.
    last_created_micros: i64,
}

fn lock(inner: &Mutex<Connected>) -> Result<MutexGuard<'_, Connected>, StorageError> {
    inner
        .lock()
        .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
}

/// DuckDB implementation of [`LogStore`].
///
/// One connection guarded by a mutex; every operation runs on the blocking
/// pool and holds the lock for its whole duration, so claims, deletes and
/// inserts never interleave.
pub struct DuckDbLogStore {
    inner: Arc<Mutex<Connected>>,
}

impl DuckDbLogStore {
    /// Open (or create) a store at `path`.
    ///
    /// A lock left behind by a crashed process is cleared once before giving
    /// up.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();

                if error_msg.contains("Could not set lock") {
                    tracing::warn!(error = %error_msg, "Database lock detected");

                    if let Some(pid) = extract_pid_from_lock_error(&error_msg) {
                        if !is_process_running(pid) {
                            tracing::warn!(pid, "Lock holder is gone, removing stale lock files");

                            if let Err(io_err) = remove_lock_files(path) {
                                tracing::error!(error = %io_err, "Failed to remove lock files");
                                return Err(e.into());
                            }

                            let conn = Connection::open(path)?;
                            return Ok(Self::from_connection(conn));
                        }

                        tracing::error!(pid, "Lock holder is still running");
                    }
                }

                Err(e.into())
            }
        }
    }

    /// In-memory store, lost on drop.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Connected {
                conn,
                last_created_micros: i64::MIN,
            })),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connected) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&inner)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("task join error: {}", e)))?
    }
}

#[async_trait]
impl LogStore for DuckDbLogStore {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.blocking(|db| {
            db.conn.execute_batch(
                "CREATE SEQUENCE IF NOT EXISTS log_id_seq START 1;
                 CREATE TABLE IF NOT EXISTS log (
                     id BIGINT PRIMARY KEY DEFAULT nextval('log_id_seq'),
                     message VARCHAR NOT NULL,
                     timestamp BIGINT NOT NULL,
                     size BIGINT NOT NULL,
                     created_at BIGINT NOT NULL,
                     send_index BIGINT NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_log_created_at ON log(created_at);",
            )?;

            let last: Option<i64> =
                db.conn
                    .query_row("SELECT MAX(created_at) FROM log", [], |row| row.get(0))?;
            if let Some(last) = last {
                db.last_created_micros = db.last_created_micros.max(last);
            }

            Ok(())
        })
        .await
    }

    async fn insert(&self, log: &PendingLog) -> Result<InsertedLog, StorageError> {
        let log = log.clone();

        self.blocking(move |db| {
            let created_micros = Utc::now().timestamp_micros().max(db.last_created_micros);

            let id: i64 = db.conn.query_row(
                "INSERT INTO log (message, timestamp, size, created_at, send_index)
                 VALUES (?, ?, ?, ?, 0)
                 RETURNING id",
                duckdb::params![
                    log.message,
                    log.timestamp.timestamp_micros(),
                    log.size,
                    created_micros,
                ],
                |row| row.get(0),
            )?;

            db.last_created_micros = created_micros;

            Ok(InsertedLog {
                id,
                created_at: micros_to_datetime(created_micros, 4)?,
            })
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<LogRecord>, StorageError> {
        self.blocking(move |db| {
            let mut stmt = db.conn.prepare(&format!("{} WHERE id = ?", SELECT_COLUMNS))?;
            let mut rows = stmt.query(duckdb::params![id])?;

            let record = match rows.next()? {
                Some(row) => Some(row_to_record(row)?),
                None => None,
            };
            Ok(record)
        })
        .await
    }

    async fn select_for_delivery(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_id: i64,
        max_count: usize,
        max_size: i64,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let from_micros = from.timestamp_micros();
        let to_micros = to.timestamp_micros();
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);

        self.blocking(move |db| {
            let tx = db.conn.transaction()?;

            let candidates: Vec<(i64, i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, created_at, size FROM log
                     WHERE send_index = 0 AND created_at >= ? AND created_at <= ?
                     ORDER BY created_at, id
                     LIMIT ?",
                )?;
                let rows = stmt.query_map(duckdb::params![from_micros, to_micros, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            // Last (created_at, id) that still fits the size budget.
            let mut total_size = 0i64;
            let mut last = None;
            for (id, created_at, size) in candidates {
                if last.is_some() && total_size + size > max_size {
                    break;
                }
                total_size += size;
                last = Some((created_at, id));
            }

            if let Some((last_created, last_id)) = last {
                tx.execute(
                    "UPDATE log SET send_index = ?
                     WHERE send_index = 0 AND created_at >= ?
                       AND (created_at < ? OR (created_at = ? AND id <= ?))",
                    duckdb::params![batch_id, from_micros, last_created, last_created, last_id],
                )?;
            }

            let records = {
                let mut stmt = tx.prepare(&format!(
                    "{} WHERE send_index = ? ORDER BY created_at, id",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map(duckdb::params![batch_id], row_to_record)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            tx.commit()?;
            Ok(records)
        })
        .await
    }

    async fn select_batch(&self, batch_id: i64) -> Result<Vec<LogRecord>, StorageError> {
        self.blocking(move |db| {
            let mut stmt = db.conn.prepare(&format!(
                "{} WHERE send_index = ? ORDER BY created_at, id",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(duckdb::params![batch_id], row_to_record)?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn delete_batch(&self, batch_id: i64) -> Result<usize, StorageError> {
        if batch_id == 0 {
            // 0 marks pending rows, never a batch.
            return Ok(0);
        }

        self.blocking(move |db| {
            Ok(db
                .conn
                .execute("DELETE FROM log WHERE send_index = ?", duckdb::params![batch_id])?)
        })
        .await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff_micros = cutoff.timestamp_micros();

        self.blocking(move |db| {
            Ok(db.conn.execute(
                "DELETE FROM log WHERE created_at < ?",
                duckdb::params![cutoff_micros],
            )?)
        })
        .await
    }

    async fn reset_all_claims(&self) -> Result<usize, StorageError> {
        self.blocking(|db| {
            Ok(db
                .conn
                .execute("UPDATE log SET send_index = 0 WHERE send_index <> 0", [])?)
        })
        .await
    }

    async fn count_and_size(&self) -> Result<(usize, i64), StorageError> {
        self.blocking(|db| {
            let (count, size): (i64, i64) = db.conn.query_row(
                "SELECT COUNT(*), CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((count as usize, size))
        })
        .await
    }

    async fn count_pending(&self) -> Result<(usize, i64), StorageError> {
        self.blocking(|db| {
            let (count, size): (i64, i64) = db.conn.query_row(
                "SELECT COUNT(*), CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM log
                 WHERE send_index = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((count as usize, size))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_store() -> DuckDbLogStore {
        let store = DuckDbLogStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    const UNBOUNDED: usize = usize::MAX;

    fn pending(message: &str) -> PendingLog {
        PendingLog::new(message, Utc::now(), 1024).unwrap()
    }

    #[tokio::test]
    async fn test_schema_initialization_is_idempotent() {
        let store = DuckDbLogStore::in_memory().unwrap();
        assert!(store.init_schema().await.is_ok());
        assert!(store.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = setup_store().await;
        let log = pending("first line");

        let inserted = store.insert(&log).await.unwrap();
        let record = store.get(inserted.id).await.unwrap().unwrap();

        assert_eq!(record.message, "first line");
        assert_eq!(record.size, log.size);
        assert_eq!(record.created_at, inserted.created_at);
        assert_eq!(record.batch_id, 0);
        assert_eq!(
            record.timestamp.timestamp_micros(),
            log.timestamp.timestamp_micros()
        );

        assert!(store.get(inserted.id + 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_increase_and_created_at_never_decreases() {
        let store = setup_store().await;

        let mut previous: Option<InsertedLog> = None;
        for i in 0..20 {
            let inserted = store.insert(&pending(&format!("line {}", i))).await.unwrap();
            if let Some(prev) = previous {
                assert!(inserted.id > prev.id);
                assert!(inserted.created_at >= prev.created_at);
            }
            previous = Some(inserted);
        }
    }

    #[tokio::test]
    async fn test_select_for_delivery_claims_window_in_order() {
        let store = setup_store().await;

        let a = store.insert(&pending("a")).await.unwrap();
        let b = store.insert(&pending("b")).await.unwrap();
        let c = store.insert(&pending("c")).await.unwrap();

        let claimed = store
            .select_for_delivery(a.created_at, b.created_at, 42, UNBOUNDED, i64::MAX)
            .await
            .unwrap();

        let ids: Vec<i64> = claimed.iter().map(|r| r.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert!(claimed.iter().all(|r| r.batch_id == 42));
        assert!(claimed.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        // c may share b's microsecond; if not it must still be pending
        let c_record = store.get(c.id).await.unwrap().unwrap();
        if c.created_at > b.created_at {
            assert_eq!(c_record.batch_id, 0);
        }
    }

    #[tokio::test]
    async fn test_claims_are_disjoint() {
        let store = setup_store().await;
        for i in 0..5 {
            store.insert(&pending(&format!("line {}", i))).await.unwrap();
        }

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);

        let first = store.select_for_delivery(epoch, now, 1, UNBOUNDED, i64::MAX).await.unwrap();
        let second = store.select_for_delivery(epoch, now, 2, UNBOUNDED, i64::MAX).await.unwrap();

        assert_eq!(first.len(), 5);
        assert!(second.is_empty());
        assert_eq!(store.select_batch(1).await.unwrap().len(), 5);
        assert!(store.select_batch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_stops_at_max_count() {
        let store = setup_store().await;
        let mut ids = Vec::new();
        for i in 0..25 {
            ids.push(store.insert(&pending(&format!("line {}", i))).await.unwrap().id);
        }

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);

        let first = store.select_for_delivery(epoch, now, 1, 10, i64::MAX).await.unwrap();
        let second = store.select_for_delivery(epoch, now, 2, 10, i64::MAX).await.unwrap();
        let third = store.select_for_delivery(epoch, now, 3, 10, i64::MAX).await.unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_eq!(third.len(), 5);

        // Oldest rows go first and nothing is claimed twice.
        let claimed: Vec<i64> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|r| r.id)
            .collect();
        assert_eq!(claimed, ids);
        assert_eq!(store.count_pending().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_claim_stops_at_max_size() {
        let store = setup_store().await;
        // 4 + 26 = 30 bytes each
        for _ in 0..5 {
            store.insert(&pending("abcd")).await.unwrap();
        }

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);

        let claimed = store.select_for_delivery(epoch, now, 1, 100, 75).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(store.count_pending().await.unwrap(), (3, 90));

        // A record larger than the budget still goes out alone.
        let alone = store.select_for_delivery(epoch, now, 2, 100, 10).await.unwrap();
        assert_eq!(alone.len(), 1);
        assert_eq!(store.count_pending().await.unwrap(), (2, 60));
    }

    #[tokio::test]
    async fn test_delete_batch_is_idempotent() {
        let store = setup_store().await;
        store.insert(&pending("a")).await.unwrap();
        store.insert(&pending("b")).await.unwrap();

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);
        store.select_for_delivery(epoch, now, 7, UNBOUNDED, i64::MAX).await.unwrap();

        assert_eq!(store.delete_batch(7).await.unwrap(), 2);
        assert_eq!(store.delete_batch(7).await.unwrap(), 0);
        assert_eq!(store.delete_batch(12345).await.unwrap(), 0);
        assert_eq!(store.count_and_size().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_delete_batch_zero_keeps_pending_rows() {
        let store = setup_store().await;
        store.insert(&pending("a")).await.unwrap();

        assert_eq!(store.delete_batch(0).await.unwrap(), 0);
        assert_eq!(store.count_and_size().await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_purge_older_than_ignores_claims() {
        let store = setup_store().await;
        store.insert(&pending("old")).await.unwrap();
        store.insert(&pending("older")).await.unwrap();

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);
        store.select_for_delivery(epoch, now, 9, UNBOUNDED, i64::MAX).await.unwrap();

        assert_eq!(store.purge_older_than(epoch).await.unwrap(), 0);
        assert_eq!(store.purge_older_than(now).await.unwrap(), 2);
        assert!(store.select_batch(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_all_claims_makes_rows_claimable_again() {
        let store = setup_store().await;
        store.insert(&pending("a")).await.unwrap();
        store.insert(&pending("b")).await.unwrap();

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);
        store.select_for_delivery(epoch, now, 5, UNBOUNDED, i64::MAX).await.unwrap();

        assert_eq!(store.reset_all_claims().await.unwrap(), 2);
        let reclaimed = store
            .select_for_delivery(epoch, now, 6, UNBOUNDED, i64::MAX)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 2);
    }

    #[tokio::test]
    async fn test_count_and_size() {
        let store = setup_store().await;
        let a = pending("abc");
        let b = pending("defgh");
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        assert_eq!(store.count_and_size().await.unwrap(), (2, a.size + b.size));
    }

    #[tokio::test]
    async fn test_sizes_are_conserved_across_claims_and_deletes() {
        let store = setup_store().await;
        let mut expected_total = 0;
        for i in 0..10 {
            let log = pending(&"x".repeat(i + 1));
            expected_total += log.size;
            store.insert(&log).await.unwrap();
        }

        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = Utc::now() + Duration::seconds(1);
        let claimed = store.select_for_delivery(epoch, now, 3, UNBOUNDED, i64::MAX).await.unwrap();
        let delivered: i64 = claimed.iter().map(|r| r.size).sum();
        store.delete_batch(3).await.unwrap();

        let (count, remaining) = store.count_and_size().await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(delivered + remaining, expected_total);
    }

    #[tokio::test]
    async fn test_claims_survive_reopen_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.duckdb");

        {
            let store = DuckDbLogStore::new(&path).unwrap();
            store.init_schema().await.unwrap();
            store.insert(&pending("in flight")).await.unwrap();
            let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
            let now = Utc::now() + Duration::seconds(1);
            let claimed = store
                .select_for_delivery(epoch, now, 77, UNBOUNDED, i64::MAX)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1);
        }

        let store = DuckDbLogStore::new(&path).unwrap();
        store.init_schema().await.unwrap();
        assert_eq!(store.select_batch(77).await.unwrap().len(), 1);
        assert_eq!(store.reset_all_claims().await.unwrap(), 1);
        assert!(store.select_batch(77).await.unwrap().is_empty());

        let next = store.insert(&pending("after restart")).await.unwrap();
        assert!(next.id > 1);
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let msg = "IO Error: Could not set lock on file \"x.duckdb\": Conflicting lock is held in /usr/bin/logship (PID 4242) by user me";
        assert_eq!(extract_pid_from_lock_error(msg), Some(4242));
        assert_eq!(extract_pid_from_lock_error("no pid here"), None);
        assert_eq!(extract_pid_from_lock_error("(PID abc)"), None);
    }
}
