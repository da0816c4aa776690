//! Handles that own the tasks behind one configured output.

use crate::archive::{
    ArchiveError, ArchiveFeed, ArchiveUploader, BlobStore, KeyFormatter, KeyNamer, RotatingFile,
    RotationPolicy,
};
use crate::batcher::{BatchEngine, BatchEvent, BatchLimits, EngineSettings};
use crate::config::{ArchiveConfig, LogDestinationConfig};
use crate::delivery::{
    ControllerSettings, DeliveryController, DestinationState, LogSink, LogTarget, SinkError,
};
use crate::storage::{LogStore, PendingLog, RecordError, StorageError};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const UPLOAD_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("record rejected: {0}")]
    Record(#[from] RecordError),

    #[error("sink client error: {0}")]
    Sink(#[from] SinkError),

    #[error("destination '{0}' is stopped")]
    Stopped(String),
}

#[derive(Debug, Clone)]
pub struct LogDestinationSettings {
    pub engine: EngineSettings,
    pub controller: ControllerSettings,
    pub max_message_bytes: usize,
}

impl LogDestinationSettings {
    pub fn from_config(config: &LogDestinationConfig) -> Self {
        let target = LogTarget {
            group: config.group.clone(),
            stream: config.stream_name(),
        };
        let days = config.retention_days.days();

        let mut controller = ControllerSettings::new(target, days);
        controller.create_group_if_missing = config.create_group_if_missing;
        controller.create_stream_if_missing = config.create_stream_if_missing;

        Self {
            engine: EngineSettings {
                limits: BatchLimits {
                    max_count: config.max_batch_count,
                    max_size: config.max_batch_size_bytes,
                },
                send_interval: Duration::from_secs(config.effective_send_interval_seconds()),
                retention: chrono::Duration::days(days as i64),
                retention_sweep_interval: RETENTION_SWEEP_INTERVAL,
            },
            controller,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// One remote log target: its batching engine and delivery controller,
/// joined on shutdown.
pub struct LogDestination {
    name: String,
    events: mpsc::UnboundedSender<BatchEvent>,
    state: watch::Receiver<DestinationState>,
    max_message_bytes: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LogDestination {
    /// Recover the store and spawn the engine and controller tasks.
    pub async fn start(
        name: &str,
        settings: LogDestinationSettings,
        store: Arc<dyn LogStore>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, DestinationError> {
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DestinationState::Initializing);

        let engine = BatchEngine::recover(store.clone(), settings.engine, batch_tx).await?;
        let controller = DeliveryController::new(
            sink,
            store,
            settings.controller,
            event_tx.clone(),
            state_tx,
            cancel.clone(),
        );

        info!(
            destination = %name,
            group = %controller.target().group,
            stream = %controller.target().stream,
            "Starting log destination"
        );

        let tasks = vec![
            tokio::spawn(engine.run(event_rx, cancel.clone())),
            tokio::spawn(controller.run(batch_rx)),
        ];

        Ok(Self {
            name: name.to_string(),
            events: event_tx,
            state: state_rx,
            max_message_bytes: settings.max_message_bytes,
            cancel,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message for delivery. Never blocks. An insert the store
    /// rejects is retried by the engine until it succeeds or the destination
    /// stops.
    pub fn write(&self, message: &str, timestamp: DateTime<Utc>) -> Result<(), DestinationError> {
        let log = PendingLog::new(message, timestamp, self.max_message_bytes)?;
        self.append(log)
    }

    /// Like [`LogDestination::write`] for producers handing in raw bytes.
    pub fn write_bytes(&self, bytes: &[u8], timestamp: DateTime<Utc>) -> Result<(), DestinationError> {
        let log = PendingLog::from_bytes(bytes, timestamp, self.max_message_bytes)?;
        self.append(log)
    }

    fn append(&self, log: PendingLog) -> Result<(), DestinationError> {
        if self.cancel.is_cancelled() {
            return Err(DestinationError::Stopped(self.name.clone()));
        }
        self.events
            .send(BatchEvent::Append(log))
            .map_err(|_| DestinationError::Stopped(self.name.clone()))
    }

    pub fn state(&self) -> DestinationState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DestinationState> {
        self.state.clone()
    }

    /// Cancel both tasks and wait for them. Records not yet delivered stay
    /// in the store for the next start.
    pub async fn shutdown(self) {
        info!(destination = %self.name, "Stopping log destination");
        self.cancel.cancel();

        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                error!(destination = %self.name, error = %e, "Destination task failed");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub path: PathBuf,
    pub policy: RotationPolicy,
    pub retry_backoff: Duration,
}

impl ArchiveSettings {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            path: config.path.clone(),
            policy: RotationPolicy {
                max_file_size_bytes: config.max_file_size_bytes,
                rotation_check_interval: Duration::from_secs(config.rotation_check_interval_seconds),
                max_file_age: Duration::from_secs(config.max_file_age_seconds),
            },
            retry_backoff: UPLOAD_RETRY_BACKOFF,
        }
    }
}

/// A rotating local file plus the uploader that ships its archives.
pub struct ArchiveDestination {
    name: String,
    file: Arc<Mutex<RotatingFile>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ArchiveDestination {
    pub fn start(
        name: &str,
        settings: ArchiveSettings,
        store: Arc<dyn BlobStore>,
        namer: KeyNamer,
    ) -> Result<Self, DestinationError> {
        let cancel = CancellationToken::new();
        let file = RotatingFile::open(&settings.path, settings.policy)?;

        // Subscribe before the feed scans the directory.
        let feed = ArchiveFeed::new(file.layout().clone(), file.subscribe());
        let uploader = ArchiveUploader::new(store, namer, settings.retry_backoff, cancel.clone());
        let file = Arc::new(Mutex::new(file));

        let mut tasks = vec![tokio::spawn(uploader.run(feed))];
        if let Some(period) = age_check_period(&settings.policy) {
            tasks.push(tokio::spawn(watch_age(
                name.to_string(),
                file.clone(),
                period,
                cancel.clone(),
            )));
        }

        info!(archive = %name, path = %settings.path.display(), "Starting archive");

        Ok(Self {
            name: name.to_string(),
            file,
            cancel,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn live_path(&self) -> Result<PathBuf, DestinationError> {
        Ok(self.lock()?.layout().live_path())
    }

    /// Append a line, rotating afterwards if the policy asks for it.
    pub fn write_line(&self, line: &str) -> Result<Option<PathBuf>, DestinationError> {
        Ok(self.lock()?.write_line(line)?)
    }

    /// Archive the live file now.
    pub fn rotate(&self) -> Result<Option<PathBuf>, DestinationError> {
        Ok(self.lock()?.rotate()?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RotatingFile>, DestinationError> {
        if self.cancel.is_cancelled() {
            return Err(DestinationError::Stopped(self.name.clone()));
        }
        self.file
            .lock()
            .map_err(|_| DestinationError::Stopped(self.name.clone()))
    }

    pub async fn shutdown(self) {
        info!(archive = %self.name, "Stopping archive");
        self.cancel.cancel();

        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                error!(archive = %self.name, error = %e, "Archive task failed");
            }
        }
    }
}

/// Age-based rotation needs a clock even when nothing is written.
fn age_check_period(policy: &RotationPolicy) -> Option<Duration> {
    if policy.max_file_age.is_zero() {
        return None;
    }
    Some(
        policy
            .max_file_age
            .min(policy.rotation_check_interval)
            .max(Duration::from_secs(1)),
    )
}

async fn watch_age(
    name: String,
    file: Arc<Mutex<RotatingFile>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut file = match file.lock() {
                    Ok(file) => file,
                    Err(_) => break,
                };
                if file.should_rotate(Utc::now()) {
                    if let Err(e) = file.rotate() {
                        warn!(archive = %name, error = %e, "Failed to rotate aged file");
                    }
                }
            }
        }
    }
    debug!(archive = %name, "Age watcher stopped");
}

/// Key for an archive: rendered from the key pattern at its rotation time.
pub fn key_namer(formatter: KeyFormatter) -> KeyNamer {
    Arc::new(move |file| formatter.format(file.rotated_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveFile, BlobError};
    use crate::delivery::InputLogEvent;
    use crate::storage::DuckDbLogStore;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingSink {
        submitted: Mutex<Vec<Vec<InputLogEvent>>>,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
            Ok(vec![prefix.to_string()])
        }

        async fn create_group(&self, _group: &str) -> Result<(), SinkError> {
            Ok(())
        }

        async fn put_retention_policy(&self, _group: &str, _days: u32) -> Result<(), SinkError> {
            Ok(())
        }

        async fn describe_streams(&self, _group: &str, prefix: &str) -> Result<Vec<String>, SinkError> {
            Ok(vec![prefix.to_string()])
        }

        async fn create_stream(&self, _group: &str, _stream: &str) -> Result<(), SinkError> {
            Ok(())
        }

        async fn put_events(
            &self,
            _target: &LogTarget,
            events: &[InputLogEvent],
            _token: Option<&str>,
        ) -> Result<Option<String>, SinkError> {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(events.to_vec());
            Ok(Some(format!("token-{}", submitted.len())))
        }
    }

    fn settings(max_count: usize) -> LogDestinationSettings {
        let target = LogTarget {
            group: "app".to_string(),
            stream: "host".to_string(),
        };
        LogDestinationSettings {
            engine: EngineSettings {
                limits: BatchLimits {
                    max_count,
                    max_size: 1024 * 1024,
                },
                send_interval: Duration::from_secs(60),
                retention: chrono::Duration::days(180),
                retention_sweep_interval: RETENTION_SWEEP_INTERVAL,
            },
            controller: ControllerSettings::new(target, 180),
            max_message_bytes: 262_114,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config: LogDestinationConfig = serde_yaml::from_str(
            r#"
endpoint: https://logs.example.com
group: app
stream: worker
store_path: /tmp/app.duckdb
send_interval_seconds: 1
max_batch_count: 5
retention_days: 7
create_stream_if_missing: false
"#,
        )
        .unwrap();

        let settings = LogDestinationSettings::from_config(&config);
        assert_eq!(settings.engine.limits.max_count, 5);
        assert_eq!(settings.engine.send_interval, Duration::from_secs(10));
        assert_eq!(settings.engine.retention, chrono::Duration::days(7));
        assert_eq!(settings.controller.target.stream, "worker");
        assert_eq!(settings.controller.retention_days, 7);
        assert!(settings.controller.create_group_if_missing);
        assert!(!settings.controller.create_stream_if_missing);
    }

    #[tokio::test]
    async fn test_written_records_are_delivered_and_deleted() {
        let store: Arc<dyn LogStore> = Arc::new(DuckDbLogStore::in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let destination = LogDestination::start("app", settings(2), store.clone(), sink.clone())
            .await
            .unwrap();

        destination.write("first", Utc::now()).unwrap();
        destination.write("second", Utc::now()).unwrap();

        for _ in 0..100 {
            if store.count_and_size().await.unwrap().0 == 0 && !sink.submitted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let submitted = sink.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        let messages: Vec<&str> = submitted[0].iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(store.count_and_size().await.unwrap(), (0, 0));
        assert_eq!(destination.state(), DestinationState::Ready);

        destination.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_records_do_not_reach_the_engine() {
        let store: Arc<dyn LogStore> = Arc::new(DuckDbLogStore::in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let destination = LogDestination::start("app", settings(10), store.clone(), sink)
            .await
            .unwrap();

        assert!(matches!(
            destination.write("", Utc::now()),
            Err(DestinationError::Record(RecordError::Empty))
        ));
        assert!(matches!(
            destination.write_bytes(&[0xff, 0xfe], Utc::now()),
            Err(DestinationError::Record(RecordError::NotEncodable(_)))
        ));

        destination.shutdown().await;
        assert_eq!(store.count_and_size().await.unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_stopped() {
        let store: Arc<dyn LogStore> = Arc::new(DuckDbLogStore::in_memory().unwrap());
        let destination =
            LogDestination::start("app", settings(10), store, Arc::new(RecordingSink::default()))
                .await
                .unwrap();
        let state = destination.subscribe_state();

        destination.shutdown().await;
        assert_eq!(*state.borrow(), DestinationState::Stopped);
    }

    #[derive(Default)]
    struct MemoryBlobStore {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put_object(&self, key: &str, _body: Vec<u8>) -> Result<(), BlobError> {
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_archive_rotation_is_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(MemoryBlobStore::default());
        let formatter = KeyFormatter::new("logs/@%Y%m%d%H%M%S@.log").unwrap();
        let settings = ArchiveSettings {
            path: dir.path().join("app.log"),
            policy: RotationPolicy::default(),
            retry_backoff: Duration::from_millis(20),
        };

        let archive = ArchiveDestination::start("files", settings, blob.clone(), key_namer(formatter))
            .unwrap();
        archive.write_line("hello").unwrap();
        let rotated = archive.rotate().unwrap().unwrap();

        let marked = crate::archive::naming::with_uploaded_postfix(&rotated);
        for _ in 0..100 {
            if marked.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marked.exists());
        assert_eq!(blob.keys.lock().unwrap().len(), 1);
        assert!(blob.keys.lock().unwrap()[0].starts_with("logs/"));

        archive.shutdown().await;
    }

    #[test]
    fn test_age_check_period() {
        let mut policy = RotationPolicy::default();
        assert_eq!(age_check_period(&policy), None);

        policy.max_file_age = Duration::from_secs(30);
        assert_eq!(age_check_period(&policy), Some(Duration::from_secs(30)));

        policy.max_file_age = Duration::from_secs(3600);
        assert_eq!(age_check_period(&policy), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_key_namer_uses_rotation_time() {
        let namer = key_namer(KeyFormatter::new("a/@%Y@/b").unwrap());
        let file = ArchiveFile {
            path: PathBuf::from("/tmp/app_2026-03-04-05-06-07.log"),
            stem: "app".to_string(),
            rotated_at: "2026-03-04T05:06:07Z".parse().unwrap(),
            uploaded: false,
        };
        assert_eq!(namer(&file), "a/2026/b");
    }
}
