//! Durable, bounded FIFO of pending telemetry records.
//!
//! The queue lives in memory behind an async mutex and is mirrored to the
//! [`QUEUE_KEY`] slot after every mutation. The mutex is held across the
//! whole read-modify-write, including the persist step, so concurrent
//! appends, drains and requeues never lose records.
//!
//! # Retention
//!
//! The queue never holds more than its capacity. When a mutation would
//! exceed it, records are dropped from the front (oldest first).
//!
//! # Persistence failures
//!
//! A failed persist is logged and the in-memory state is kept. The next
//! successful mutation writes the full queue again.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{StateStore, QUEUE_KEY};
use crate::types::EventRecord;

/// Default retention cap.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// Result of [`DurableQueue::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Queue length after the append.
    pub queued: usize,

    /// Oldest records evicted to stay within capacity.
    pub evicted: usize,
}

/// Result of [`DurableQueue::requeue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueOutcome {
    /// Records put back at the front.
    pub requeued: usize,

    /// Records that exceeded the retry limit and were dropped for good.
    pub dropped: usize,

    /// Oldest records cut to stay within capacity.
    pub truncated: usize,
}

/// A persisted queue of [`EventRecord`]s.
pub struct DurableQueue {
    store: Arc<dyn StateStore>,
    capacity: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl DurableQueue {
    /// Loads the queue from `store`.
    ///
    /// A missing slot, or one that does not hold a list of records, yields an
    /// empty queue. A stored queue longer than `capacity` is cut from the
    /// front.
    pub async fn open(store: Arc<dyn StateStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let loaded = match store.load(QUEUE_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<Vec<EventRecord>>(value) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Malformed queue slot, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load queue, starting empty");
                Vec::new()
            }
        };

        let mut records = VecDeque::from(loaded);
        let truncated = truncate_front(&mut records, capacity);
        if truncated > 0 {
            warn!(truncated, capacity, "Stored queue exceeded capacity");
        }
        debug!(pending = records.len(), "Queue loaded");

        Self {
            store,
            capacity,
            records: Mutex::new(records),
        }
    }

    /// Retention cap.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stamps `record` with the enqueue time, resets its retry count and
    /// appends it at the back.
    pub async fn append(&self, mut record: EventRecord) -> AppendOutcome {
        record.ts = Some(Utc::now().timestamp_millis());
        record.retries = 0;

        let mut records = self.records.lock().await;
        records.push_back(record);
        let evicted = truncate_front(&mut records, self.capacity);
        if evicted > 0 {
            warn!(evicted, capacity = self.capacity, "Queue full, oldest records evicted");
        }
        self.persist(&records).await;

        AppendOutcome {
            queued: records.len(),
            evicted,
        }
    }

    /// Removes and returns up to `max` records from the front.
    pub async fn drain(&self, max: usize) -> Vec<EventRecord> {
        let mut records = self.records.lock().await;
        let count = max.min(records.len());
        if count == 0 {
            return Vec::new();
        }

        let batch: Vec<EventRecord> = records.drain(..count).collect();
        self.persist(&records).await;
        debug!(drained = batch.len(), remaining = records.len(), "Drained batch");
        batch
    }

    /// Puts a failed batch back at the front.
    ///
    /// Each record's retry count is incremented; records whose count now
    /// exceeds `max_retries` are dropped permanently. Survivors keep their
    /// relative order ahead of anything appended since the drain.
    pub async fn requeue(&self, batch: Vec<EventRecord>, max_retries: u32) -> RequeueOutcome {
        let mut survivors = Vec::with_capacity(batch.len());
        let mut dropped = 0;
        for mut record in batch {
            record.retries = record.retries.saturating_add(1);
            if record.retries > max_retries {
                dropped += 1;
            } else {
                survivors.push(record);
            }
        }
        if dropped > 0 {
            warn!(dropped, max_retries, "Records exceeded retry limit and were dropped");
        }

        let mut records = self.records.lock().await;
        let requeued = survivors.len();
        for record in survivors.into_iter().rev() {
            records.push_front(record);
        }
        let truncated = truncate_front(&mut records, self.capacity);
        if truncated > 0 {
            warn!(truncated, capacity = self.capacity, "Queue over capacity after requeue");
        }
        self.persist(&records).await;

        RequeueOutcome {
            requeued,
            dropped,
            truncated,
        }
    }

    /// Puts a batch back at the front without touching retry counts.
    ///
    /// Used when a drained batch was never attempted.
    pub async fn restore(&self, batch: Vec<EventRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut records = self.records.lock().await;
        for record in batch.into_iter().rev() {
            records.push_front(record);
        }
        truncate_front(&mut records, self.capacity);
        self.persist(&records).await;
    }

    /// Number of pending records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// True when nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// A copy of the pending records, front first.
    pub async fn snapshot(&self) -> Vec<EventRecord> {
        self.records.lock().await.iter().cloned().collect()
    }

    async fn persist(&self, records: &VecDeque<EventRecord>) {
        let value = match serde_json::to_value(records) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize queue");
                return;
            }
        };
        if let Err(e) = self.store.save(QUEUE_KEY, &value).await {
            warn!(error = %e, pending = records.len(), "Failed to persist queue");
        }
    }
}

fn truncate_front(records: &mut VecDeque<EventRecord>, capacity: usize) -> usize {
    let excess = records.len().saturating_sub(capacity);
    records.drain(..excess);
    excess
}
