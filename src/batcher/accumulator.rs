use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Start of the window used for batches that must sweep every pending row.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

/// Random batch id in `1..=i64::MAX`. Zero is reserved for pending rows.
pub fn new_batch_id() -> i64 {
    loop {
        let id = ((Uuid::new_v4().as_u128() as u64) >> 1) as i64;
        if id != 0 {
            return id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_size: i64,
}

/// Running totals for one group of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchState {
    pub count: usize,
    pub total_size: i64,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    /// 0 while the group is still accumulating.
    pub batch_id: i64,
}

impl BatchState {
    fn reaches(&self, limits: &BatchLimits) -> bool {
        self.count >= limits.max_count || self.total_size >= limits.max_size
    }
}

/// A closed group, ready to be claimed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyBatch {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub batch_id: i64,
}

/// In-memory view of how pending records split into batches.
///
/// Only a hint: the store's claim decides which rows end up in which batch.
/// Holds at most one open group plus the closed groups still waiting for
/// delivery.
#[derive(Debug)]
pub struct BatchAccumulator {
    limits: BatchLimits,
    open: Option<BatchState>,
    closed: Vec<BatchState>,
}

impl BatchAccumulator {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            open: None,
            closed: Vec::new(),
        }
    }

    /// Start from rows already in the store.
    pub fn seeded(limits: BatchLimits, count: usize, total_size: i64) -> Self {
        let mut accumulator = Self::new(limits);
        accumulator.reseed(count, total_size);
        accumulator
    }

    /// Replace the open group with the store's unclaimed backlog. Insertion
    /// times of those rows are unknown, so the group spans from the epoch.
    pub fn reseed(&mut self, count: usize, total_size: i64) {
        if count == 0 {
            self.open = None;
            return;
        }

        let latest = self.open.as_ref().map_or_else(epoch, |open| open.latest);
        self.open = Some(BatchState {
            count,
            total_size,
            earliest: epoch(),
            latest,
            batch_id: 0,
        });
    }

    /// Close the open group if it already reaches a limit.
    pub fn close_if_full(&mut self, now: DateTime<Utc>) -> Option<ReadyBatch> {
        match &self.open {
            Some(open) if open.reaches(&self.limits) => self.force_close(now),
            _ => None,
        }
    }

    /// Account for one inserted record. Returns the closed batch when a limit
    /// is reached.
    pub fn on_inserted(&mut self, size: i64, created_at: DateTime<Utc>) -> Option<ReadyBatch> {
        let open = self.open.get_or_insert(BatchState {
            count: 0,
            total_size: 0,
            earliest: created_at,
            latest: created_at,
            batch_id: 0,
        });

        open.count += 1;
        open.total_size += size;
        open.latest = open.latest.max(created_at);

        if open.reaches(&self.limits) {
            let to = open.latest;
            self.close_open(to)
        } else {
            None
        }
    }

    /// Close the open group regardless of limits, sweeping every pending row
    /// up to `now`. Does nothing when no records are waiting.
    pub fn force_close(&mut self, now: DateTime<Utc>) -> Option<ReadyBatch> {
        let open = self.open.as_ref()?;
        if open.count == 0 {
            return None;
        }

        let to = now.max(open.latest);
        let mut ready = self.close_open(to)?;
        ready.from = epoch();
        Some(ready)
    }

    /// Forget a delivered batch. Returns false for ids this accumulator never
    /// closed.
    pub fn on_delivered(&mut self, batch_id: i64) -> bool {
        match self.closed.iter().position(|b| b.batch_id == batch_id) {
            Some(index) => {
                self.closed.remove(index);
                true
            }
            None => false,
        }
    }

    /// Fold a closed batch whose rows could not be claimed back into the open
    /// group, widening it to the epoch so the next close sweeps those rows.
    pub fn restore(&mut self, batch_id: i64) {
        let Some(index) = self.closed.iter().position(|b| b.batch_id == batch_id) else {
            return;
        };
        let failed = self.closed.remove(index);

        match self.open.as_mut() {
            Some(open) => {
                open.count += failed.count;
                open.total_size += failed.total_size;
                open.earliest = epoch();
                open.latest = open.latest.max(failed.latest);
            }
            None => {
                self.open = Some(BatchState {
                    earliest: epoch(),
                    batch_id: 0,
                    ..failed
                });
            }
        }
    }

    pub fn open(&self) -> Option<&BatchState> {
        self.open.as_ref()
    }

    /// Closed batches not yet acknowledged, oldest first.
    pub fn in_flight(&self) -> &[BatchState] {
        &self.closed
    }

    fn close_open(&mut self, to: DateTime<Utc>) -> Option<ReadyBatch> {
        let mut batch = self.open.take()?;
        batch.batch_id = new_batch_id();
        batch.latest = to;

        let ready = ReadyBatch {
            from: batch.earliest,
            to,
            batch_id: batch.batch_id,
        };
        self.closed.push(batch);
        Some(ready)
    }
}
