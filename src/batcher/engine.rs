use super::accumulator::{BatchAccumulator, BatchLimits, ReadyBatch};
use crate::storage::{LogRecord, LogStore, PendingLog, StorageError};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Input to the batching engine of one destination.
#[derive(Debug)]
pub enum BatchEvent {
    /// A producer wrote a record.
    Append(PendingLog),
    /// The remote end acknowledged a batch; its rows may be deleted.
    Delivered(i64),
}

/// Rows claimed for one batch, handed to the delivery controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub batch_id: i64,
    pub records: Vec<LogRecord>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub limits: BatchLimits,
    /// Longest a pending record waits before its batch is closed anyway.
    pub send_interval: Duration,
    /// Records older than this are purged without being delivered.
    pub retention: chrono::Duration,
    pub retention_sweep_interval: Duration,
}

/// Persists appended records, coalesces them into batches and claims each
/// closed batch from the store.
///
/// Every state change happens on the engine task, so closes and claims never
/// race each other. A claim never takes more than the batch limits allow;
/// whatever a close leaves unclaimed is emitted in further batches.
pub struct BatchEngine {
    store: Arc<dyn LogStore>,
    settings: EngineSettings,
    accumulator: BatchAccumulator,
    output: mpsc::UnboundedSender<ClaimedBatch>,
    /// Acknowledged batches whose delete failed.
    undeleted: Vec<i64>,
    /// Records whose insert failed, oldest first.
    unpersisted: VecDeque<PendingLog>,
}

impl BatchEngine {
    /// Bring the store back to a consistent state after a restart: purge
    /// expired rows, release every claim and seed the accumulator with what
    /// is left.
    pub async fn recover(
        store: Arc<dyn LogStore>,
        settings: EngineSettings,
        output: mpsc::UnboundedSender<ClaimedBatch>,
    ) -> Result<Self, StorageError> {
        store.init_schema().await?;

        let purged = store.purge_older_than(Utc::now() - settings.retention).await?;
        let released = store.reset_all_claims().await?;
        let (count, total_size) = store.count_and_size().await?;

        info!(
            purged,
            released,
            pending = count,
            pending_bytes = total_size,
            "Recovered log store"
        );

        Ok(Self {
            store,
            accumulator: BatchAccumulator::seeded(settings.limits, count, total_size),
            settings,
            output,
            undeleted: Vec::new(),
            unpersisted: VecDeque::new(),
        })
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BatchEvent>,
        cancel: CancellationToken,
    ) {
        let interval = self.settings.send_interval;
        let mut deadline = Instant::now() + interval;

        let sweep = self.settings.retention_sweep_interval;
        let mut retention = tokio::time::interval_at(Instant::now() + sweep, sweep);

        info!(
            max_count = self.settings.limits.max_count,
            max_size = self.settings.limits.max_size,
            send_interval_ms = interval.as_millis() as u64,
            "Batch engine started"
        );

        // A recovered backlog may already fill several batches.
        self.drain_backlog(&cancel).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = events.recv() => match event {
                    Some(BatchEvent::Append(log)) => {
                        self.unpersisted.push_back(log);
                        if self.persist_queued(&cancel).await {
                            deadline = Instant::now() + interval;
                        }
                    }
                    Some(BatchEvent::Delivered(batch_id)) => self.acknowledge(batch_id).await,
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    self.retry_deletes().await;
                    self.persist_queued(&cancel).await;
                    if let Some(ready) = self.accumulator.force_close(Utc::now()) {
                        debug!(batch_id = ready.batch_id, "Send interval elapsed, closing batch");
                        self.ship(ready, &cancel).await;
                    }
                    deadline = Instant::now() + interval;
                }

                _ = retention.tick() => self.sweep_expired().await,
            }
        }

        if !self.unpersisted.is_empty() {
            warn!(
                unpersisted = self.unpersisted.len(),
                "Batch engine stopped with records that were never persisted"
            );
        }
        info!(
            in_flight = self.accumulator.in_flight().len(),
            "Batch engine stopped"
        );
    }

    /// Insert queued records in order, stopping at the first failure. Returns
    /// true when a batch was shipped.
    async fn persist_queued(&mut self, cancel: &CancellationToken) -> bool {
        let mut shipped = false;

        while let Some(log) = self.unpersisted.pop_front() {
            let inserted = match self.store.insert(&log).await {
                Ok(inserted) => inserted,
                Err(e) => {
                    warn!(
                        error = %e,
                        size = log.size,
                        queued = self.unpersisted.len() + 1,
                        "Failed to persist log record, will retry"
                    );
                    self.unpersisted.push_front(log);
                    break;
                }
            };

            if let Some(ready) = self.accumulator.on_inserted(log.size, inserted.created_at) {
                shipped |= self.ship(ready, cancel).await;
            }
        }

        shipped
    }

    /// Claim a closed batch, then keep emitting full batches while the
    /// unclaimed backlog still reaches a limit.
    async fn ship(&mut self, ready: ReadyBatch, cancel: &CancellationToken) -> bool {
        if !self.claim(ready, cancel).await {
            return false;
        }
        self.drain_backlog(cancel).await;
        true
    }

    async fn drain_backlog(&mut self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let (count, total_size) = match self.store.count_pending().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "Failed to count pending records");
                    return;
                }
            };
            self.accumulator.reseed(count, total_size);

            let Some(ready) = self.accumulator.close_if_full(Utc::now()) else {
                return;
            };
            debug!(batch_id = ready.batch_id, pending = count, "Backlog fills a batch");
            if !self.claim(ready, cancel).await {
                return;
            }
        }
    }

    /// Returns true when rows were claimed and handed to delivery.
    async fn claim(&mut self, ready: ReadyBatch, cancel: &CancellationToken) -> bool {
        let limits = self.settings.limits;
        let records = match self
            .store
            .select_for_delivery(
                ready.from,
                ready.to,
                ready.batch_id,
                limits.max_count,
                limits.max_size,
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(batch_id = ready.batch_id, error = %e, "Failed to claim batch");
                self.accumulator.restore(ready.batch_id);
                return false;
            }
        };

        if records.is_empty() {
            debug!(batch_id = ready.batch_id, "Closed batch claimed no rows");
            self.accumulator.on_delivered(ready.batch_id);
            return false;
        }

        // Claimed rows stay claimed until the next startup resets them.
        if cancel.is_cancelled() {
            return false;
        }

        debug!(batch_id = ready.batch_id, count = records.len(), "Claimed batch");
        let batch = ClaimedBatch {
            batch_id: ready.batch_id,
            records,
        };
        if self.output.send(batch).is_err() {
            warn!(batch_id = ready.batch_id, "Delivery channel closed");
            return false;
        }
        true
    }

    async fn acknowledge(&mut self, batch_id: i64) {
        match self.store.delete_batch(batch_id).await {
            Ok(deleted) => {
                self.accumulator.on_delivered(batch_id);
                debug!(batch_id, deleted, "Deleted delivered batch");
            }
            Err(e) => {
                warn!(batch_id, error = %e, "Failed to delete delivered batch, will retry");
                self.undeleted.push(batch_id);
            }
        }
    }

    async fn retry_deletes(&mut self) {
        for batch_id in std::mem::take(&mut self.undeleted) {
            self.acknowledge(batch_id).await;
        }
    }

    async fn sweep_expired(&self) {
        match self
            .store
            .purge_older_than(Utc::now() - self.settings.retention)
            .await
        {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged expired log records"),
            Err(e) => warn!(error = %e, "Failed to purge expired log records"),
        }
    }
}
