//! Client for the control surface of a running agent.
//!
//! Only one process may own the persisted queue. Maintenance commands that
//! read or drain it (`flush`, `queue status`) first try the daemon listening
//! on the configured address and fall back to the state directory only when
//! no agent answers.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::routes::HealthResponse;
use crate::scheduler::TickOutcome;

/// Errors from a reachable control surface.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Transport failure other than "nothing is listening".
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The agent answered with a non-2xx status.
    #[error("{path} failed: HTTP {status}")]
    Status { path: String, status: u16 },
}

/// HTTP client for a local agent's control surface.
pub struct ControlClient {
    base_url: String,
    client: Client,
}

impl ControlClient {
    /// Creates a client for the agent listening on `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed (TLS backend
    /// unavailable).
    #[must_use]
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
        }
    }

    /// Base URL of the control surface.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Asks the running agent for one immediate delivery tick.
    ///
    /// Returns `Ok(None)` when no agent is listening.
    ///
    /// # Errors
    ///
    /// Returns a [`ControlError`] when an agent answered but the request
    /// failed.
    pub async fn flush(&self) -> Result<Option<TickOutcome>, ControlError> {
        self.request(Method::POST, "/flush").await
    }

    /// Reads the running agent's health report.
    ///
    /// Returns `Ok(None)` when no agent is listening.
    ///
    /// # Errors
    ///
    /// Returns a [`ControlError`] when an agent answered but the request
    /// failed.
    pub async fn health(&self) -> Result<Option<HealthResponse>, ControlError> {
        self.request(Method::GET, "/health").await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<Option<T>, ControlError> {
        let url = format!("{}{path}", self.base_url);
        let response = match self.client.request(method, &url).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                debug!(url = %url, "No agent listening");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Some(response.json().await?))
    }
}
