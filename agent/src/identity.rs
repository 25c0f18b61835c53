//! Installation identity.
//!
//! Every record the agent ships carries a stable, opaque installation
//! identifier. It is generated once (UUID v4), persisted in the
//! [`INSTALL_ID_KEY`] slot and cached for the lifetime of the process.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::store::{StateStore, StoreError, INSTALL_ID_KEY};

/// Resolves the installation identifier with create-once semantics.
///
/// Resolution is serialized by an async mutex, so concurrent first calls
/// observe and persist a single identifier.
pub struct IdentityProvider {
    store: Arc<dyn StateStore>,
    cached: Mutex<Option<String>>,
}

impl IdentityProvider {
    /// Creates a provider backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Returns the installation identifier, creating and persisting it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the slot cannot be read, or a freshly
    /// generated identifier cannot be persisted. Nothing is cached in that
    /// case, so the next call retries.
    pub async fn install_id(&self) -> Result<String, StoreError> {
        let mut cached = self.cached.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.store.load(INSTALL_ID_KEY).await? {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            _ => {
                let id = Uuid::new_v4().to_string();
                self.store
                    .save(INSTALL_ID_KEY, &Value::String(id.clone()))
                    .await?;
                info!(install_id = %id, "Generated new installation identifier");
                id
            }
        };

        *cached = Some(id.clone());
        Ok(id)
    }
}
