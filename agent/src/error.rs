//! Error types for the ThreatGuard agent.
//!
//! Each component owns a focused error enum; [`AgentError`] aggregates them
//! for callers that cross component boundaries (the pipeline, the CLI).
//! None of these errors are fatal to the hosting process: the scheduler and
//! notifier log them and degrade to "try again next tick" or "skip".

use thiserror::Error;

use crate::config::ConfigError;
use crate::delivery::DeliveryError;
use crate::settings::SettingsError;
use crate::store::StoreError;

/// Errors that can occur during agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Process configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operational settings could not be read, validated or written.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Persisted state could not be read or written.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Outbound submission to the collector failed.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// I/O error (event sources, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
