//! Persisted key/value slots for agent state.
//!
//! The agent keeps exactly three durable slots: the installation identifier,
//! the operational settings record and the pending event queue. Each slot
//! holds one JSON value. Components receive an `Arc<dyn StateStore>` handle
//! at construction and never touch the backing medium directly.
//!
//! Two implementations are provided:
//!
//! - [`FileStore`]: one `<slot>.json` file per slot in a state directory,
//!   replaced atomically (write to a temporary file, then rename).
//! - [`MemoryStore`]: a process-local map, used by tests and ephemeral runs.
//!
//! A slot whose contents cannot be parsed is reported as absent, so callers
//! fall back to their defaults instead of failing.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Slot holding the installation identifier.
pub const INSTALL_ID_KEY: &str = "ai_install_id";

/// Slot holding the operational settings record.
pub const SETTINGS_KEY: &str = "ai_cfg_v1";

/// Slot holding the pending event queue.
pub const QUEUE_KEY: &str = "ai_queue_v1";

/// Errors that can occur while reading or writing persisted slots.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("I/O error on slot {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The value could not be serialized.
    #[error("JSON error on slot {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Slot names are restricted to ASCII alphanumerics, `-` and `_`.
    #[error("invalid slot key: {0}")]
    InvalidKey(String),
}

/// Asynchronous key/value storage for JSON slots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the value stored under `key`, or `None` if the slot is absent
    /// or unreadable as JSON.
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the value stored under `key`.
    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// File-backed state store: one JSON file per slot.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// the first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        validate_key(key)?;
        let path = self.slot_path(key);

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(slot = key, path = %path.display(), error = %e, "Malformed slot, treating as absent");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        validate_key(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;

        let path = self.slot_path(key);
        let tmp_path = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp_path, &bytes).await.map_err(io_err)?;
        fs::rename(&tmp_path, &path).await.map_err(io_err)?;

        debug!(slot = key, bytes = bytes.len(), "Slot saved");
        Ok(())
    }
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        validate_key(key)?;
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.to_string(), value.clone());
        Ok(())
    }
}
