//! Local control surface of the ThreatGuard agent.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /events` - Submit observations (single object or array)
//! - `GET /listen` - WebSocket feed of alert messages
//! - `GET /settings` - Current operational settings
//! - `PATCH /settings` - Partial settings update (empty body object resets)
//! - `DELETE /settings` - Reset settings to defaults
//! - `POST /flush` - Run one delivery tick immediately
//! - `GET /health` - Health check endpoint
//!
//! The surface is meant for the local machine only; it binds to loopback by
//! default and performs no authentication.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use threatguard_agent::components::Components;
//! use threatguard_agent::notifier::LogSurface;
//! use threatguard_agent::routes::{create_router, AppState};
//! use threatguard_agent::store::MemoryStore;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let components = Components::build(
//!         Arc::new(MemoryStore::new()),
//!         5000,
//!         Duration::from_secs(10),
//!         Arc::new(LogSurface),
//!     )
//!     .await;
//!     let (events_tx, _events_rx) = mpsc::channel(1024);
//!     let app = create_router(AppState::new(&components, events_tx));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:7878").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::AlertBroadcaster;
use crate::components::Components;
use crate::identity::IdentityProvider;
use crate::queue::DurableQueue;
use crate::scheduler::FlushScheduler;
use crate::settings::{SettingsError, SettingsPatch, SettingsStore};
use crate::types::Observation;

/// Maximum request body size (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub queue: Arc<DurableQueue>,
    pub identity: Arc<IdentityProvider>,
    pub scheduler: Arc<FlushScheduler>,
    pub broadcaster: AlertBroadcaster,

    /// Channel into the pipeline.
    pub events_tx: mpsc::Sender<Observation>,

    /// Start time for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Creates the state from the agent's components and the sending half of
    /// the pipeline channel.
    #[must_use]
    pub fn new(components: &Components, events_tx: mpsc::Sender<Observation>) -> Self {
        Self {
            settings: Arc::clone(&components.settings),
            queue: Arc::clone(&components.queue),
            identity: Arc::clone(&components.identity),
            scheduler: Arc::clone(&components.scheduler),
            broadcaster: components.broadcaster.clone(),
            events_tx,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("broadcaster", &self.broadcaster)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_events))
        .route("/listen", get(get_listen))
        .route(
            "/settings",
            get(get_settings).patch(patch_settings).delete(delete_settings),
        )
        .route("/flush", post(post_flush))
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn settings_error_response(err: &SettingsError) -> Response {
    match err {
        SettingsError::InvalidValue { .. } => error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(err.to_string()).with_code("invalid_value"),
        ),
        _ => {
            error!(error = %err, "Settings store failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("settings unavailable").with_code("storage_error"),
            )
        }
    }
}

// ============================================================================
// POST /events
// ============================================================================

/// Accepts either a single observation or an array of observations.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsPayload {
    Single(Observation),
    Batch(Vec<Observation>),
}

impl EventsPayload {
    fn into_observations(self) -> Vec<Observation> {
        match self {
            Self::Single(observation) => vec![observation],
            Self::Batch(observations) => observations,
        }
    }
}

/// Response body for accepted observations.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

/// POST /events - Forward observations to the pipeline.
///
/// # Responses
///
/// - `202 Accepted` - Observations handed to the pipeline
/// - `400 Bad Request` - Body is not an observation or array of observations
/// - `503 Service Unavailable` - The pipeline has shut down
async fn post_events(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: EventsPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "Failed to parse observation payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(format!("invalid observation format: {err}"))
                    .with_code("invalid_format"),
            );
        }
    };

    let observations = payload.into_observations();
    let accepted = observations.len();
    for observation in observations {
        trace!(kind = observation.kind(), "Forwarding observation");
        if state.events_tx.send(observation).await.is_err() {
            warn!("Pipeline closed, rejecting observations");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("pipeline unavailable").with_code("shutting_down"),
            );
        }
    }

    debug!(accepted, "Observations accepted");
    (StatusCode::ACCEPTED, Json(AcceptedResponse { accepted })).into_response()
}

// ============================================================================
// GET /listen
// ============================================================================

/// GET /listen - WebSocket feed of alert messages.
///
/// Once connected, every alert is sent as a JSON text message
/// (`{"kind":"alert","level":...,"type":...,"message":...}`).
async fn get_listen(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    info!("Listener connecting");
    ws.on_upgrade(move |socket| handle_listener(socket, state.broadcaster))
}

/// Forwards alerts to an established WebSocket until either side closes.
async fn handle_listener(socket: axum::extract::ws::WebSocket, broadcaster: AlertBroadcaster) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut alert_rx = broadcaster.subscribe();

    info!("Listener connected");

    let forward_task = tokio::spawn(async move {
        loop {
            match alert_rx.recv().await {
                Ok(alert) => match serde_json::to_string(&alert) {
                    Ok(json) => {
                        if let Err(err) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %err, "Failed to send alert to listener");
                            break;
                        }
                    }
                    Err(err) => error!(error = %err, "Failed to serialize alert"),
                },
                Err(RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Listener lagged, skipped alerts");
                }
                Err(RecvError::Closed) => {
                    debug!("Alert broadcaster closed");
                    break;
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                debug!("Listener sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    info!("Listener disconnected");
}

// ============================================================================
// /settings
// ============================================================================

/// GET /settings - Current settings, merged over defaults.
async fn get_settings(State(state): State<AppState>) -> Response {
    match state.settings.get().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => settings_error_response(&err),
    }
}

/// PATCH /settings - Apply a partial update.
///
/// An empty object resets every field to its default.
async fn patch_settings(State(state): State<AppState>, body: Bytes) -> Response {
    let patch: SettingsPatch = match serde_json::from_slice(&body) {
        Ok(patch) => patch,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(format!("invalid settings format: {err}"))
                    .with_code("invalid_format"),
            );
        }
    };

    match state.settings.patch(patch).await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => settings_error_response(&err),
    }
}

/// DELETE /settings - Reset to defaults.
async fn delete_settings(State(state): State<AppState>) -> Response {
    match state.settings.reset_to_default().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => settings_error_response(&err),
    }
}

// ============================================================================
// POST /flush
// ============================================================================

/// POST /flush - Run one scheduler tick now and report its outcome.
async fn post_flush(State(state): State<AppState>) -> Response {
    let outcome = state.scheduler.flush_now().await;
    Json(outcome).into_response()
}

// ============================================================================
// GET /health
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the installation identifier is unavailable.
    pub status: String,

    /// Installation identifier.
    pub install_id: Option<String>,

    /// Records waiting for delivery.
    pub queued: usize,

    /// Connected alert listeners.
    pub listeners: usize,

    /// Agent uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let install_id = match state.identity.install_id().await {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(error = %err, "Installation identifier unavailable");
            None
        }
    };

    Json(HealthResponse {
        status: if install_id.is_some() { "ok" } else { "degraded" }.to_string(),
        install_id,
        queued: state.queue.len().await,
        listeners: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
