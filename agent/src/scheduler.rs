//! Periodic batched flushing with bounded exponential backoff.
//!
//! The scheduler owns the only consumer side of the [`DurableQueue`]. Each
//! tick reloads the settings, drains up to `batchSize` records and hands them
//! to a [`BatchSink`]. A failed batch is requeued (retry counters
//! incremented) and the scheduler sleeps a backoff delay before resuming
//! regular ticks. Producers and the anomaly notifier are never blocked by
//! that sleep.
//!
//! # State machine
//!
//! ```text
//! Idle -> Draining -> Delivering -> Idle
//!                                -> Backoff -> Idle
//! ```
//!
//! The current state is published on a watch channel for observability.
//!
//! # Backoff
//!
//! `min(8 * interval, interval * 2^r)`, where `r` is the retry count the
//! first record of the failed batch had before the attempt, floored at 1.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::delivery::{BatchSink, Delivery};
use crate::identity::IdentityProvider;
use crate::queue::DurableQueue;
use crate::settings::SettingsStore;

/// Upper bound of the backoff delay, as a multiple of the flush interval.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 8;

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// Removing a batch from the queue.
    Draining,
    /// Waiting on the sink.
    Delivering,
    /// Sleeping after a failed delivery.
    Backoff,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Telemetry is disabled in settings.
    Disabled,
    /// No endpoint is configured.
    NotConfigured,
    /// Nothing was pending.
    Empty,
    /// A batch was accepted by the collector.
    Delivered { count: usize },
    /// The batch was requeued; the scheduler backs off for `backoff_ms`.
    Failed {
        requeued: usize,
        dropped: usize,
        backoff_ms: u64,
    },
    /// Settings or identity could not be read; nothing was drained.
    Unavailable { reason: String },
}

/// Computes the delay after a failed delivery.
///
/// `retries` is the retry count of the first record of the failed batch
/// before the attempt. The result never exceeds
/// [`MAX_BACKOFF_MULTIPLIER`] times `interval`.
#[must_use]
pub fn backoff_delay(interval: Duration, retries: u32) -> Duration {
    let cap = interval.saturating_mul(MAX_BACKOFF_MULTIPLIER);
    let exponent = retries.max(1);
    // 2^3 already reaches the cap
    if exponent >= MAX_BACKOFF_MULTIPLIER.trailing_zeros() {
        return cap;
    }
    interval.saturating_mul(1 << exponent).min(cap)
}

/// Drives periodic delivery of queued records.
pub struct FlushScheduler {
    queue: Arc<DurableQueue>,
    settings: Arc<SettingsStore>,
    identity: Arc<IdentityProvider>,
    sink: Arc<dyn BatchSink>,
    state: watch::Sender<SchedulerState>,
    tick_lock: Mutex<()>,
}

impl FlushScheduler {
    /// Creates a scheduler. Nothing runs until [`run`](Self::run) or
    /// [`flush_now`](Self::flush_now) is called.
    #[must_use]
    pub fn new(
        queue: Arc<DurableQueue>,
        settings: Arc<SettingsStore>,
        identity: Arc<IdentityProvider>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            queue,
            settings,
            identity,
            sink,
            state,
            tick_lock: Mutex::new(()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Runs one tick.
    ///
    /// Ticks never overlap: a manual flush issued while the timer tick is in
    /// flight waits for it to finish.
    pub async fn tick(&self) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;

        let settings = match self.settings.get().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to read settings, skipping tick");
                return TickOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };
        if !settings.enabled {
            debug!("Telemetry disabled, skipping tick");
            return TickOutcome::Disabled;
        }
        if !settings.has_endpoint() {
            debug!("No endpoint configured, skipping tick");
            return TickOutcome::NotConfigured;
        }
        let install_id = match self.identity.install_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to resolve installation identifier, skipping tick");
                return TickOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        self.set_state(SchedulerState::Draining);
        let batch = self.queue.drain(settings.batch_size).await;
        if batch.is_empty() {
            self.set_state(SchedulerState::Idle);
            return TickOutcome::Empty;
        }
        let count = batch.len();
        let first_retries = batch[0].retries;

        self.set_state(SchedulerState::Delivering);
        let outcome = match self.sink.deliver(&install_id, &batch).await {
            Ok(Delivery::Sent) => {
                info!(events = count, "Flushed batch");
                TickOutcome::Delivered { count }
            }
            Ok(Delivery::NotConfigured) => {
                // Endpoint cleared while the batch was in hand
                self.queue.restore(batch).await;
                TickOutcome::NotConfigured
            }
            Err(e) => {
                let requeue = self.queue.requeue(batch, settings.max_retries).await;
                let backoff = backoff_delay(settings.flush_interval(), first_retries);
                let backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    error = %e,
                    events = count,
                    requeued = requeue.requeued,
                    dropped = requeue.dropped,
                    backoff_ms,
                    "Flush failed, batch requeued"
                );
                TickOutcome::Failed {
                    requeued: requeue.requeued,
                    dropped: requeue.dropped,
                    backoff_ms,
                }
            }
        };

        self.set_state(SchedulerState::Idle);
        outcome
    }

    /// Runs one tick immediately, outside the timer.
    ///
    /// A failure requeues the batch exactly like a timer tick, but does not
    /// put the timer loop into backoff.
    pub async fn flush_now(&self) -> TickOutcome {
        info!("Manual flush requested");
        self.tick().await
    }

    /// Runs the timer loop until `shutdown` turns `true` or its sender is
    /// dropped.
    ///
    /// The flush interval is re-read before every sleep, so settings edits
    /// take effect from the next cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Flush scheduler started");

        loop {
            let interval = self.current_interval().await;
            if !sleep_unless_shutdown(interval, &mut shutdown).await {
                break;
            }

            if let TickOutcome::Failed { backoff_ms, .. } = self.tick().await {
                self.set_state(SchedulerState::Backoff);
                let resumed =
                    sleep_unless_shutdown(Duration::from_millis(backoff_ms), &mut shutdown).await;
                self.set_state(SchedulerState::Idle);
                if !resumed {
                    break;
                }
            }
        }

        info!("Flush scheduler stopped");
    }

    async fn current_interval(&self) -> Duration {
        match self.settings.get().await {
            Ok(settings) => settings.flush_interval(),
            Err(e) => {
                warn!(error = %e, "Failed to read settings, using default interval");
                Duration::from_millis(crate::settings::DEFAULT_FLUSH_INTERVAL_MS)
            }
        }
    }
}

/// Sleeps for `duration`. Returns `false` if shutdown was signalled first.
async fn sleep_unless_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        () = sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            Err(_) => false,
        },
    }
}
