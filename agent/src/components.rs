//! Wiring of the agent's long-lived components.
//!
//! Every component is constructed once, around a single shared
//! [`StateStore`], and handed out as `Arc`s. The binary, the control surface
//! and the integration tests all build the agent through [`Components`].

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::AlertBroadcaster;
use crate::delivery::DeliveryClient;
use crate::identity::IdentityProvider;
use crate::notifier::{AnomalyNotifier, NotificationSurface};
use crate::pipeline::Pipeline;
use crate::queue::DurableQueue;
use crate::scheduler::FlushScheduler;
use crate::settings::SettingsStore;
use crate::store::StateStore;

/// All components of a running agent.
#[derive(Clone)]
pub struct Components {
    pub settings: Arc<SettingsStore>,
    pub identity: Arc<IdentityProvider>,
    pub queue: Arc<DurableQueue>,
    pub delivery: Arc<DeliveryClient>,
    pub broadcaster: AlertBroadcaster,
    pub notifier: Arc<AnomalyNotifier>,
    pub scheduler: Arc<FlushScheduler>,
    pub pipeline: Arc<Pipeline>,
}

impl Components {
    /// Builds every component on top of `store`, loading the persisted queue.
    pub async fn build(
        store: Arc<dyn StateStore>,
        queue_capacity: usize,
        request_timeout: Duration,
        surface: Arc<dyn NotificationSurface>,
    ) -> Self {
        let settings = Arc::new(SettingsStore::new(Arc::clone(&store)));
        let identity = Arc::new(IdentityProvider::new(Arc::clone(&store)));
        let queue = Arc::new(DurableQueue::open(store, queue_capacity).await);
        let delivery = Arc::new(DeliveryClient::new(Arc::clone(&settings), request_timeout));
        let broadcaster = AlertBroadcaster::new();
        let notifier = Arc::new(AnomalyNotifier::new(
            Arc::clone(&delivery),
            Arc::clone(&identity),
            broadcaster.clone(),
            surface,
        ));
        let scheduler = Arc::new(FlushScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&settings),
            Arc::clone(&identity),
            delivery.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&identity),
            Arc::clone(&queue),
            Arc::clone(&notifier),
        ));

        Self {
            settings,
            identity,
            queue,
            delivery,
            broadcaster,
            notifier,
            scheduler,
            pipeline,
        }
    }
}
