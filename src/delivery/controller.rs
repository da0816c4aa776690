use super::sink::{InputLogEvent, LogSink, LogTarget, SinkError};
use crate::batcher::{BatchEvent, ClaimedBatch};
use crate::storage::{LogRecord, LogStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a log destination as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationState {
    Initializing,
    Ready,
    /// Setup failed in a way retrying cannot fix.
    SetupFailed(String),
    Stopped,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("log group '{0}' does not exist and creation is disabled")]
    GroupMissing(String),

    #[error("log stream '{stream}' does not exist in group '{group}' and creation is disabled")]
    StreamMissing { group: String, stream: String },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

impl SetupError {
    /// Whether retrying the same setup can ever succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SetupError::GroupMissing(_)
                | SetupError::StreamMissing { .. }
                | SetupError::Sink(SinkError::Misconfigured(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub target: LogTarget,
    pub create_group_if_missing: bool,
    pub create_stream_if_missing: bool,
    pub retention_days: u32,
    /// Wait before resubmitting with a corrected token.
    pub conflict_backoff: Duration,
    /// Wait before retrying setup or a failed submission.
    pub retry_backoff: Duration,
}

impl ControllerSettings {
    pub fn new(target: LogTarget, retention_days: u32) -> Self {
        Self {
            target,
            create_group_if_missing: true,
            create_stream_if_missing: true,
            retention_days,
            conflict_backoff: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(60),
        }
    }
}

/// Submits claimed batches one at a time and keeps the continuity token.
///
/// A batch is acknowledged to the engine only after the sink accepted it,
/// either now or by an earlier submission. Until then it stays claimed in the
/// store and is retried.
pub struct DeliveryController {
    sink: Arc<dyn LogSink>,
    store: Arc<dyn LogStore>,
    settings: ControllerSettings,
    token: Option<String>,
    acks: mpsc::UnboundedSender<BatchEvent>,
    state: watch::Sender<DestinationState>,
    cancel: CancellationToken,
}

impl DeliveryController {
    pub fn new(
        sink: Arc<dyn LogSink>,
        store: Arc<dyn LogStore>,
        settings: ControllerSettings,
        acks: mpsc::UnboundedSender<BatchEvent>,
        state: watch::Sender<DestinationState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            store,
            settings,
            token: None,
            acks,
            state,
            cancel,
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.settings.target
    }

    /// Make sure group, retention policy and stream exist. One attempt.
    pub async fn setup(&self) -> Result<(), SetupError> {
        let LogTarget { group, stream } = &self.settings.target;

        let groups = self.sink.describe_groups(group).await?;
        if !groups.iter().any(|g| g == group) {
            if !self.settings.create_group_if_missing {
                return Err(SetupError::GroupMissing(group.clone()));
            }
            info!(group = %group, "Creating log group");
            match self.sink.create_group(group).await {
                Ok(()) | Err(SinkError::ResourceAlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.sink
            .put_retention_policy(group, self.settings.retention_days)
            .await?;

        let streams = self.sink.describe_streams(group, stream).await?;
        if !streams.iter().any(|s| s == stream) {
            if !self.settings.create_stream_if_missing {
                return Err(SetupError::StreamMissing {
                    group: group.clone(),
                    stream: stream.clone(),
                });
            }
            info!(group = %group, stream = %stream, "Creating log stream");
            match self.sink.create_stream(group, stream).await {
                Ok(()) | Err(SinkError::ResourceAlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Run setup until it succeeds, then deliver batches until cancelled.
    pub async fn run(mut self, mut batches: mpsc::UnboundedReceiver<ClaimedBatch>) {
        if self.establish().await {
            self.state.send_replace(DestinationState::Ready);
            info!(
                group = %self.settings.target.group,
                stream = %self.settings.target.stream,
                "Destination ready"
            );

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    batch = batches.recv() => match batch {
                        Some(batch) => self.deliver(batch).await,
                        None => break,
                    },
                }
            }
        } else if !self.cancel.is_cancelled() {
            // Rows stay claimed until the destination is recreated.
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    batch = batches.recv() => match batch {
                        Some(batch) => {
                            debug!(batch_id = batch.batch_id, "Destination unusable, leaving batch claimed");
                        }
                        None => break,
                    },
                }
            }
        }

        self.state.send_replace(DestinationState::Stopped);
        debug!("Delivery controller stopped");
    }

    /// Returns true once setup succeeded, false on a terminal failure or
    /// cancellation.
    async fn establish(&self) -> bool {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                result = self.setup() => result,
            };

            match result {
                Ok(()) => return true,
                Err(e) if e.is_terminal() => {
                    error!(error = %e, "Destination setup failed");
                    self.state
                        .send_replace(DestinationState::SetupFailed(e.to_string()));
                    return false;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                        "Destination setup failed, retrying"
                    );
                    if !self.pause(self.settings.retry_backoff).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn deliver(&mut self, batch: ClaimedBatch) {
        let batch_id = batch.batch_id;
        let mut events = to_events(&batch.records);

        loop {
            if events.is_empty() {
                debug!(batch_id, "Batch has no deliverable events");
                self.acknowledge(batch_id);
                return;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.sink.put_events(&self.settings.target, &events, self.token.as_deref()) => result,
            };
            if self.cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(next) | Err(SinkError::DataAlreadyAccepted { next_token: next }) => {
                    debug!(batch_id, events = events.len(), "Batch accepted");
                    self.token = next;
                    self.acknowledge(batch_id);
                    return;
                }
                Err(SinkError::InvalidSequenceToken { expected }) => {
                    warn!(batch_id, "Sequence token rejected, resubmitting with expected token");
                    self.token = expected;
                    if !self.pause(self.settings.conflict_backoff).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        batch_id,
                        error = %e,
                        backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                        "Failed to deliver batch, will retry"
                    );
                    if !self.pause(self.settings.retry_backoff).await {
                        return;
                    }
                    match self.store.select_batch(batch_id).await {
                        Ok(records) => events = to_events(&records),
                        Err(e) => warn!(batch_id, error = %e, "Failed to reload batch, resending previous events"),
                    }
                    if self.cancel.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    fn acknowledge(&self, batch_id: i64) {
        if self.acks.send(BatchEvent::Delivered(batch_id)).is_err() {
            warn!(batch_id, "Batch engine gone, delivered batch not deleted");
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn to_events(records: &[LogRecord]) -> Vec<InputLogEvent> {
    records
        .iter()
        .filter_map(|record| {
            let timestamp = record.timestamp.timestamp_millis();
            if record.message.is_empty() || timestamp < 0 {
                warn!(id = record.id, "Dropping log record the sink cannot represent");
                None
            } else {
                Some(InputLogEvent {
                    message: record.message.clone(),
                    timestamp,
                })
            }
        })
        .collect()
}
