//! From raw observation to queued record.
//!
//! Every observation, whichever source it came from, takes the same path:
//! resolve the installation identifier, normalize (redaction, header
//! allowlist, truncation), append to the durable queue, then run the anomaly
//! check. The check is spawned once the append has completed, so a slow
//! predictor never holds up the next observation and its outcome never
//! decides whether the event is kept.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identity::IdentityProvider;
use crate::notifier::{AnomalyNotifier, Verdict};
use crate::queue::DurableQueue;
use crate::types::{EventRecord, Observation};

/// Default capacity of the observation channel.
pub const DEFAULT_PIPELINE_CAPACITY: usize = 1024;

/// Normalizes, queues and checks observations.
pub struct Pipeline {
    identity: Arc<IdentityProvider>,
    queue: Arc<DurableQueue>,
    notifier: Arc<AnomalyNotifier>,
}

impl Pipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        identity: Arc<IdentityProvider>,
        queue: Arc<DurableQueue>,
        notifier: Arc<AnomalyNotifier>,
    ) -> Self {
        Self {
            identity,
            queue,
            notifier,
        }
    }

    /// Handles a single observation.
    ///
    /// Returns once the record is queued. The anomaly check runs on its own
    /// task; await the returned handle for its verdict.
    ///
    /// # Errors
    ///
    /// Returns an error only when the installation identifier cannot be
    /// resolved; nothing is queued in that case.
    pub async fn process(&self, observation: Observation) -> Result<JoinHandle<Verdict>> {
        let record = self.enqueue(observation).await?;
        let notifier = Arc::clone(&self.notifier);
        Ok(tokio::spawn(async move { notifier.check(&record).await }))
    }

    async fn enqueue(&self, observation: Observation) -> Result<EventRecord> {
        let install_id = self.identity.install_id().await?;
        let record = observation.into_record(&install_id);

        let appended = self.queue.append(record.clone()).await;
        debug!(kind = %record.kind, queued = appended.queued, "Observation queued");
        Ok(record)
    }

    /// Consumes `rx` until it closes or `shutdown` turns `true`.
    ///
    /// Anomaly checks still in flight when the loop ends are awaited before
    /// returning. Returns the number of observations queued.
    pub async fn run(&self, mut rx: mpsc::Receiver<Observation>, mut shutdown: watch::Receiver<bool>) -> usize {
        info!("Pipeline started");
        let mut processed = 0;
        let mut checks = JoinSet::new();

        loop {
            let observation = tokio::select! {
                received = rx.recv() => match received {
                    Some(observation) => observation,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                Some(finished) = checks.join_next(), if !checks.is_empty() => {
                    log_check_failure(finished);
                    continue;
                }
            };

            match self.enqueue(observation).await {
                Ok(record) => {
                    processed += 1;
                    let notifier = Arc::clone(&self.notifier);
                    checks.spawn(async move { notifier.check(&record).await });
                }
                Err(e) => warn!(error = %e, "Dropped observation"),
            }
        }

        if !checks.is_empty() {
            debug!(pending = checks.len(), "Waiting for anomaly checks");
        }
        while let Some(finished) = checks.join_next().await {
            log_check_failure(finished);
        }

        info!(processed, "Pipeline stopped");
        processed
    }
}

fn log_check_failure(finished: std::result::Result<Verdict, tokio::task::JoinError>) {
    if let Err(e) = finished {
        warn!(error = %e, "Anomaly check task failed");
    }
}
