//! Synchronous anomaly check for freshly queued events.
//!
//! After an event is appended, the notifier asks the collector's predictor
//! about it. A result of `-1` raises an alert: it is pushed to every live
//! listener and shown on the local notification surface.
//!
//! The check is strictly best-effort. Missing configuration, an unreachable
//! predictor or a malformed response all end in [`Verdict::Skipped`] with a
//! warning at most, and never affect delivery of the event itself.

use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::broadcast::AlertBroadcaster;
use crate::delivery::DeliveryClient;
use crate::identity::IdentityProvider;
use crate::types::{AlertMessage, EventRecord};

/// Title used for local notifications.
pub const ALERT_TITLE: &str = "AI Threat Guard Alert";

/// How an anomaly check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No check was made, or it failed.
    Skipped,
    /// The predictor considered the event normal.
    Normal,
    /// The predictor flagged the event and an alert was raised.
    Anomalous,
}

/// A place to show a local, user-facing notification.
pub trait NotificationSurface: Send + Sync {
    /// Shows `message` under `title`. Must not block.
    fn notify(&self, title: &str, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSurface;

impl NotificationSurface for LogSurface {
    fn notify(&self, title: &str, message: &str) {
        warn!(title, message, "Threat alert");
    }
}

/// Runs an external command (e.g. `notify-send`) with the title and message
/// appended as the last two arguments.
#[derive(Debug, Clone)]
pub struct CommandSurface {
    program: String,
    args: Vec<String>,
}

impl CommandSurface {
    /// Parses a whitespace-separated command line. Returns `None` for a blank
    /// line.
    #[must_use]
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// The program that will be run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl NotificationSurface for CommandSurface {
    fn notify(&self, title: &str, message: &str) {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(title)
            .arg(message)
            .spawn();

        match spawned {
            Ok(mut child) => {
                let program = self.program.clone();
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            warn!(program = %program, %status, "Notification command failed");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(program = %program, error = %e, "Notification command failed"),
                    }
                });
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to run notification command");
            }
        }
    }
}

/// Checks events against the predictor and raises alerts.
pub struct AnomalyNotifier {
    delivery: Arc<DeliveryClient>,
    identity: Arc<IdentityProvider>,
    broadcaster: AlertBroadcaster,
    surface: Arc<dyn NotificationSurface>,
}

impl AnomalyNotifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new(
        delivery: Arc<DeliveryClient>,
        identity: Arc<IdentityProvider>,
        broadcaster: AlertBroadcaster,
        surface: Arc<dyn NotificationSurface>,
    ) -> Self {
        Self {
            delivery,
            identity,
            broadcaster,
            surface,
        }
    }

    /// Asks the predictor about `event` and raises an alert if it is
    /// anomalous.
    pub async fn check(&self, event: &EventRecord) -> Verdict {
        let install_id = match self.identity.install_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Anomaly check skipped, no installation identifier");
                return Verdict::Skipped;
            }
        };

        let response = match self.delivery.predict(&install_id, event).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(kind = %event.kind, "Anomaly check skipped, predictor not configured");
                return Verdict::Skipped;
            }
            Err(e) => {
                warn!(kind = %event.kind, error = %e, "Anomaly check failed");
                return Verdict::Skipped;
            }
        };

        if !response.is_anomalous() {
            return Verdict::Normal;
        }

        let alert = AlertMessage::anomaly(event);
        let listeners = self.broadcaster.broadcast(alert.clone());
        self.surface.notify(ALERT_TITLE, &alert.message);
        info!(kind = %event.kind, listeners, "Anomaly alert raised");
        Verdict::Anomalous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SettingsPatch, SettingsStore};
    use crate::store::MemoryStore;
    use serde_json::{json, Map};
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Surface that records every notification.
    #[derive(Default)]
    struct RecordingSurface {
        shown: Mutex<Vec<(String, String)>>,
    }

    impl NotificationSurface for RecordingSurface {
        fn notify(&self, title: &str, message: &str) {
            self.shown
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
        }
    }

    async fn notifier(
        endpoint: &str,
        api_key: &str,
    ) -> (AnomalyNotifier, AlertBroadcaster, Arc<RecordingSurface>) {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(SettingsStore::new(store.clone()));
        settings
            .patch(SettingsPatch {
                endpoint: Some(endpoint.to_string()),
                api_key: Some(api_key.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let delivery = Arc::new(DeliveryClient::new(settings, Duration::from_secs(5)));
        let identity = Arc::new(IdentityProvider::new(store));
        let broadcaster = AlertBroadcaster::new();
        let surface = Arc::new(RecordingSurface::default());
        let notifier = AnomalyNotifier::new(delivery, identity, broadcaster.clone(), surface.clone());
        (notifier, broadcaster, surface)
    }

    fn login_event() -> EventRecord {
        let mut fields = Map::new();
        fields.insert("path".to_string(), json!("/login"));
        EventRecord::new("login_attempt", "i", fields)
    }

    async fn predictor(results: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn command_surface_parses_command_line() {
        let surface = CommandSurface::parse("notify-send -u critical").unwrap();
        assert_eq!(surface.program(), "notify-send");
        assert_eq!(surface.args, vec!["-u", "critical"]);
        assert!(CommandSurface::parse("   ").is_none());
    }

    #[tokio::test]
    async fn missing_api_key_skips_check() {
        let server = predictor(json!([-1])).await;
        let (notifier, broadcaster, surface) = notifier(&format!("{}/ingest", server.uri()), "").await;
        let mut rx = broadcaster.subscribe();

        assert_eq!(notifier.check(&login_event()).await, Verdict::Skipped);
        assert!(rx.try_recv().is_err());
        assert!(surface.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn anomalous_result_raises_alert() {
        let server = predictor(json!([-1])).await;
        let (notifier, broadcaster, surface) = notifier(&format!("{}/ingest", server.uri()), "key").await;
        let mut rx = broadcaster.subscribe();

        assert_eq!(notifier.check(&login_event()).await, Verdict::Anomalous);

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.message, "Anomaly detected: login_attempt /login");
        let shown = surface.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, ALERT_TITLE);
    }

    #[tokio::test]
    async fn normal_result_raises_nothing() {
        let server = predictor(json!([1])).await;
        let (notifier, broadcaster, surface) = notifier(&format!("{}/ingest", server.uri()), "key").await;
        let mut rx = broadcaster.subscribe();

        assert_eq!(notifier.check(&login_event()).await, Verdict::Normal);
        assert!(rx.try_recv().is_err());
        assert!(surface.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn predictor_error_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (notifier, _, surface) = notifier(&format!("{}/ingest", server.uri()), "key").await;

        assert_eq!(notifier.check(&login_event()).await, Verdict::Skipped);
        assert!(surface.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn anomaly_without_listeners_still_notifies() {
        let server = predictor(json!([-1])).await;
        let (notifier, _, surface) = notifier(&format!("{}/ingest", server.uri()), "key").await;

        assert_eq!(notifier.check(&login_event()).await, Verdict::Anomalous);
        assert_eq!(surface.shown.lock().unwrap().len(), 1);
    }
}
