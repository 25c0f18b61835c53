//! HTTP delivery client for the collector.
//!
//! This module ships telemetry to the collector and asks its predictor about
//! single events:
//!
//! - Connection pooling via reqwest, with a client-level timeout
//! - `X-API-Key` header only when a non-blank key is configured
//! - Settings are read fresh on every call, so edits apply immediately
//! - An empty endpoint means "not configured": no request is made
//!
//! Retry and backoff are not handled here; the flush scheduler requeues a
//! failed batch and decides when to try again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use threatguard_agent::delivery::DeliveryClient;
//! use threatguard_agent::settings::SettingsStore;
//! use threatguard_agent::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Arc::new(SettingsStore::new(Arc::new(MemoryStore::new())));
//!     let client = DeliveryClient::new(settings, Duration::from_secs(10));
//!
//!     client.ingest("install-id", &[]).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::settings::{SettingsError, SettingsStore};
use crate::types::EventRecord;

/// Path segment of the ingest endpoint.
pub const INGEST_PATH: &str = "/ingest";

/// Path segment of the anomaly predictor.
pub const PREDICT_PATH: &str = "/predict";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Predictor result value that marks an event as anomalous.
pub const ANOMALY_SENTINEL: i64 = -1;

/// Errors that can occur while talking to the collector.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Transport failure (connection refused, timeout, bad response body).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-2xx status.
    #[error("{path} failed: HTTP {status}")]
    Status { path: String, status: u16 },

    /// The API key contains characters not allowed in a header.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Settings could not be read.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Body of ingest and predict requests.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    install_id: &'a str,
    events: &'a [EventRecord],
}

/// Predictor response: one result per submitted event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub results: Vec<i64>,
}

impl PredictResponse {
    /// True when the first result is the anomaly sentinel.
    #[must_use]
    pub fn is_anomalous(&self) -> bool {
        self.results.first() == Some(&ANOMALY_SENTINEL)
    }
}

/// What happened to a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The collector accepted the batch.
    Sent,
    /// No endpoint is configured; nothing was sent.
    NotConfigured,
}

/// Destination for drained batches.
///
/// The flush scheduler only depends on this trait, so tests can substitute
/// an in-process sink.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Submits `batch` on behalf of `install_id`.
    async fn deliver(&self, install_id: &str, batch: &[EventRecord]) -> Result<Delivery, DeliveryError>;
}

/// HTTP client for the collector's ingest and predict endpoints.
pub struct DeliveryClient {
    settings: Arc<SettingsStore>,
    client: Client,
}

impl DeliveryClient {
    /// Creates a client that reads its endpoint and key from `settings`.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed (TLS backend
    /// unavailable).
    #[must_use]
    pub fn new(settings: Arc<SettingsStore>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .expect("Failed to create HTTP client");

        Self { settings, client }
    }

    /// Posts `payload` as JSON to the endpoint with `/ingest` replaced by
    /// `path`.
    ///
    /// Returns `Ok(None)` without any network call when the endpoint is
    /// empty, otherwise the parsed response body (`Value::Null` for an empty
    /// body).
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Status`] for non-2xx responses and
    /// [`DeliveryError::Http`] for transport failures.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<Option<Value>, DeliveryError> {
        let settings = self.settings.get().await?;
        if !settings.has_endpoint() {
            debug!(path, "No endpoint configured, skipping request");
            return Ok(None);
        }

        let url = target_url(settings.endpoint.trim(), path);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = settings.api_key() {
            headers.insert(API_KEY_HEADER, HeaderValue::from_str(key)?);
        }

        debug!(url = %url, path, "Sending request");
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        // Success is decided by the status alone
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                debug!(path, error = %e, "Failed to read response body, ignoring");
                return Ok(Some(Value::Null));
            }
        };
        if body.is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_slice(&body).unwrap_or(Value::Null)))
    }

    /// Submits a batch to the ingest endpoint.
    ///
    /// # Errors
    ///
    /// Any [`DeliveryError`] from [`send`](Self::send).
    pub async fn ingest(&self, install_id: &str, batch: &[EventRecord]) -> Result<Delivery, DeliveryError> {
        let body = SubmitBody {
            install_id,
            events: batch,
        };
        match self.send(INGEST_PATH, &body).await? {
            Some(_) => {
                debug!(events = batch.len(), "Batch ingested");
                Ok(Delivery::Sent)
            }
            None => Ok(Delivery::NotConfigured),
        }
    }

    /// Asks the predictor about a single event.
    ///
    /// Returns `None` when the endpoint or API key is not configured.
    ///
    /// # Errors
    ///
    /// Any [`DeliveryError`] from [`send`](Self::send). An unparseable
    /// response body is not an error; it yields empty results.
    pub async fn predict(
        &self,
        install_id: &str,
        event: &EventRecord,
    ) -> Result<Option<PredictResponse>, DeliveryError> {
        let settings = self.settings.get().await?;
        if settings.api_key().is_none() || !settings.has_endpoint() {
            return Ok(None);
        }

        let body = SubmitBody {
            install_id,
            events: std::slice::from_ref(event),
        };
        let Some(value) = self.send(PREDICT_PATH, &body).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value).unwrap_or_default()))
    }
}

#[async_trait]
impl BatchSink for DeliveryClient {
    async fn deliver(&self, install_id: &str, batch: &[EventRecord]) -> Result<Delivery, DeliveryError> {
        self.ingest(install_id, batch).await
    }
}

/// Builds the request URL by swapping the first `/ingest` in `endpoint` for
/// `path`. Endpoints without `/ingest` are used unchanged.
#[must_use]
pub fn target_url(endpoint: &str, path: &str) -> String {
    endpoint.replacen(INGEST_PATH, path, 1)
}
