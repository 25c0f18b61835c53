//! Integration tests for anomaly alerts reaching live listeners.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use threatguard_agent::components::Components;
use threatguard_agent::notifier::{NotificationSurface, Verdict};
use threatguard_agent::settings::SettingsPatch;
use threatguard_agent::store::MemoryStore;
use threatguard_agent::types::Observation;
use tokio::sync::broadcast::error::TryRecvError;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

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

async fn agent(server: &MockServer, surface: Arc<RecordingSurface>) -> Components {
    let components = Components::build(
        Arc::new(MemoryStore::new()),
        100,
        Duration::from_secs(5),
        surface,
    )
    .await;
    components
        .settings
        .patch(SettingsPatch {
            endpoint: Some(format!("{}/ingest", server.uri())),
            api_key: Some("k".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    components
}

fn login_attempt() -> Observation {
    serde_json::from_value(json!({
        "type": "login_attempt",
        "path": "/login",
        "method": "POST",
        "url": "https://app.example/login?next=/home"
    }))
    .unwrap()
}

#[tokio::test]
async fn anomalous_login_alerts_every_listener_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .and(header("X-API-Key", "k"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [-1]})))
        .expect(1)
        .mount(&server)
        .await;

    let surface = Arc::new(RecordingSurface::default());
    let components = agent(&server, Arc::clone(&surface)).await;
    let mut first = components.broadcaster.subscribe();
    let mut second = components.broadcaster.subscribe();

    let check = components.pipeline.process(login_attempt()).await.unwrap();
    let verdict = check.await.unwrap();
    assert_eq!(verdict, Verdict::Anomalous);

    for rx in [&mut first, &mut second] {
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.kind, "alert");
        assert_eq!(alert.level, "warning");
        assert!(alert.message.contains("login_attempt"));
        assert!(alert.message.contains("/login"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    let shown = surface.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].0, "AI Threat Guard Alert");

    // The event is queued whatever the verdict
    assert_eq!(components.queue.len().await, 1);
}

#[tokio::test]
async fn normal_prediction_raises_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [1]})))
        .expect(1)
        .mount(&server)
        .await;

    let surface = Arc::new(RecordingSurface::default());
    let components = agent(&server, Arc::clone(&surface)).await;
    let mut rx = components.broadcaster.subscribe();

    let check = components.pipeline.process(login_attempt()).await.unwrap();
    let verdict = check.await.unwrap();

    assert_eq!(verdict, Verdict::Normal);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(surface.shown.lock().unwrap().is_empty());
}

#[tokio::test]
async fn predictor_failure_still_queues_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let surface = Arc::new(RecordingSurface::default());
    let components = agent(&server, Arc::clone(&surface)).await;

    let check = components.pipeline.process(login_attempt()).await.unwrap();
    let verdict = check.await.unwrap();

    assert_eq!(verdict, Verdict::Skipped);
    assert_eq!(components.queue.len().await, 1);
    assert!(surface.shown.lock().unwrap().is_empty());
}
