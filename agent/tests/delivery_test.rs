//! Integration tests for the delivery client against a mock collector.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use threatguard_agent::components::Components;
use threatguard_agent::delivery::{Delivery, DeliveryClient, API_KEY_HEADER};
use threatguard_agent::notifier::LogSurface;
use threatguard_agent::scheduler::TickOutcome;
use threatguard_agent::settings::{SettingsPatch, SettingsStore};
use threatguard_agent::store::{FileStore, MemoryStore, StateStore};
use threatguard_agent::types::{EventRecord, Observation};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

async fn client_with_key(server: &MockServer, api_key: &str) -> DeliveryClient {
    let settings = Arc::new(SettingsStore::new(Arc::new(MemoryStore::new())));
    settings
        .patch(SettingsPatch {
            endpoint: Some(format!("{}/ingest", server.uri())),
            api_key: Some(api_key.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    DeliveryClient::new(settings, Duration::from_secs(5))
}

fn event() -> EventRecord {
    EventRecord::new("console", "install-1", Map::new())
}

// =============================================================================
// API Key Header
// =============================================================================

#[tokio::test]
async fn blank_api_key_sends_no_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with_key(&server, "").await;
    assert_eq!(client.ingest("install-1", &[event()]).await.unwrap(), Delivery::Sent);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get(API_KEY_HEADER).is_none());
    assert_eq!(
        requests[0].headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn api_key_is_sent_trimmed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(header("X-API-Key", "abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_with_key(&server, "abc").await;
    client.ingest("install-1", &[event()]).await.unwrap();

    let padded = client_with_key(&server, "  abc  ").await;
    padded.ingest("install-1", &[event()]).await.unwrap();
}

// =============================================================================
// End-to-end Flow
// =============================================================================

/// Observation in, normalized batch out, queue cleared on disk.
#[tokio::test]
async fn observation_reaches_collector_redacted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(dir.path()));
    let components = Components::build(
        Arc::clone(&store),
        100,
        Duration::from_secs(5),
        Arc::new(LogSurface),
    )
    .await;
    components
        .settings
        .patch(SettingsPatch {
            endpoint: Some(format!("{}/ingest", server.uri())),
            ..Default::default()
        })
        .await
        .unwrap();

    let observation: Observation = serde_json::from_value(json!({
        "type": "xhrfetch",
        "phase": "completed",
        "request": {
            "url": "https://api.example/v1/profile?session=s3cr3t",
            "method": "GET",
            "headers": {"Authorization": "Bearer t", "Accept": "application/json"}
        },
        "response": {"status": 200},
        "durationMs": 31,
        "pageUrl": "https://app.example/home#tab"
    }))
    .unwrap();
    let check = components.pipeline.process(observation).await.unwrap();
    check.await.unwrap();

    assert_eq!(
        components.scheduler.flush_now().await,
        TickOutcome::Delivered { count: 1 }
    );

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let install_id = components.identity.install_id().await.unwrap();
    assert_eq!(body["installId"], install_id.as_str());

    let sent = &body["events"][0];
    assert_eq!(sent["kind"], "client_request");
    assert_eq!(sent["url"], "https://api.example/v1/profile");
    assert_eq!(sent["pageUrl"], "https://app.example/home");
    assert_eq!(sent["headers"], json!({"accept": "application/json"}));
    assert_eq!(sent["_retries"], 0);
    assert!(sent["_ts"].is_i64());
    assert_eq!(sent["installId"], install_id.as_str());

    assert_eq!(store.load("ai_queue_v1").await.unwrap(), Some(json!([])));
}
