//! Operational settings (the "Config Store").
//!
//! Settings are the mutable knobs the queue, scheduler, delivery client and
//! anomaly notifier consult before every operation: whether telemetry is
//! enabled, where to send it, the API key, and the batching/retry policy.
//! They are persisted in the [`SETTINGS_KEY`] slot and edited through the
//! CLI or the local control surface.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `enabled` | `true` |
//! | `endpoint` | `http://localhost:8000/ingest` |
//! | `apiKey` | empty (no `X-API-Key` header is sent) |
//! | `batchSize` | 25 |
//! | `flushIntervalMs` | 4000 |
//! | `maxRetries` | 5 |
//!
//! Stored values are merged over the defaults on every read, so a stored
//! record missing a field still yields a complete [`Settings`].
//!
//! # Patch and reset contract
//!
//! [`SettingsStore::patch`] overwrites only the fields present in the patch.
//! A patch with no fields at all resets every field to its default; this is
//! the documented behavior of the empty update, not an accident. The same end
//! state is also reachable through the explicit
//! [`SettingsStore::reset_to_default`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{StateStore, StoreError, SETTINGS_KEY};

/// Default collector ingest endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/ingest";

/// Default number of records per delivery batch.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 4000;

/// Default number of failed deliveries a record survives.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Errors that can occur while reading or updating settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A patched field has an invalid value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// The settings slot could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The settings record could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The operational settings record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// When false, the scheduler skips every tick.
    pub enabled: bool,

    /// Collector ingest URL. Empty means "not configured yet".
    pub endpoint: String,

    /// API key sent as `X-API-Key`. Empty means "dev mode": no header.
    pub api_key: String,

    /// Maximum records drained per tick.
    pub batch_size: usize,

    /// Base interval between scheduler ticks.
    pub flush_interval_ms: u64,

    /// Failed deliveries a record survives before it is dropped.
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Settings {
    /// Base flush interval as a `Duration`.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The trimmed API key, or `None` when no usable key is configured.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        (!key.is_empty()).then_some(key)
    }

    /// True when an endpoint is configured.
    #[must_use]
    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }
}

/// A partial update of [`Settings`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl SettingsPatch {
    /// True when the patch carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Checks the patched fields against their documented ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] when `batchSize` or
    /// `flushIntervalMs` is zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.batch_size == Some(0) {
            return Err(SettingsError::InvalidValue {
                field: "batchSize".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.flush_interval_ms == Some(0) {
            return Err(SettingsError::InvalidValue {
                field: "flushIntervalMs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    fn apply_to(self, settings: &mut Settings) {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(endpoint) = self.endpoint {
            settings.endpoint = endpoint;
        }
        if let Some(api_key) = self.api_key {
            settings.api_key = api_key;
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = batch_size;
        }
        if let Some(flush_interval_ms) = self.flush_interval_ms {
            settings.flush_interval_ms = flush_interval_ms;
        }
        if let Some(max_retries) = self.max_retries {
            settings.max_retries = max_retries;
        }
    }
}

/// Persisted, serialized access to [`Settings`].
pub struct SettingsStore {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Creates a settings store backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Reads the current settings, merged over the defaults.
    ///
    /// A missing or malformed record yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Store`] if the slot cannot be read.
    pub async fn get(&self) -> Result<Settings, SettingsError> {
        let Some(value) = self.store.load(SETTINGS_KEY).await? else {
            return Ok(Settings::default());
        };

        match serde_json::from_value(value) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(error = %e, "Malformed settings record, using defaults");
                Ok(Settings::default())
            }
        }
    }

    /// Applies a partial update and returns the resulting settings.
    ///
    /// An empty patch resets every field to its default.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] for out-of-range fields (the
    /// stored record is left unchanged), or a store error if the slot cannot
    /// be read or written.
    pub async fn patch(&self, patch: SettingsPatch) -> Result<Settings, SettingsError> {
        if patch.is_empty() {
            return self.reset_to_default().await;
        }
        patch.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut settings = self.get().await?;
        patch.apply_to(&mut settings);
        self.persist(&settings).await?;

        info!(
            enabled = settings.enabled,
            endpoint = %settings.endpoint,
            api_key_set = settings.api_key().is_some(),
            batch_size = settings.batch_size,
            flush_interval_ms = settings.flush_interval_ms,
            max_retries = settings.max_retries,
            "Settings updated"
        );
        Ok(settings)
    }

    /// Restores every field to its default and returns the defaults.
    ///
    /// # Errors
    ///
    /// Returns a store error if the slot cannot be written.
    pub async fn reset_to_default(&self) -> Result<Settings, SettingsError> {
        let _guard = self.write_lock.lock().await;
        let settings = Settings::default();
        self.persist(&settings).await?;
        info!("Settings reset to defaults");
        Ok(settings)
    }

    async fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let value = serde_json::to_value(settings)?;
        self.store.save(SETTINGS_KEY, &value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn settings_store() -> (Arc<MemoryStore>, SettingsStore) {
        let backing = Arc::new(MemoryStore::new());
        let store = SettingsStore::new(backing.clone());
        (backing, store)
    }

    #[tokio::test]
    async fn get_returns_defaults_when_absent() {
        let (_, store) = settings_store();
        let settings = store.get().await.unwrap();

        assert_eq!(settings, Settings::default());
        assert!(settings.enabled);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.flush_interval_ms, 4000);
        assert_eq!(settings.max_retries, 5);
        assert!(settings.api_key().is_none());
    }

    #[tokio::test]
    async fn get_merges_partial_record_over_defaults() {
        let (backing, store) = settings_store();
        backing
            .save(SETTINGS_KEY, &json!({"batchSize": 7, "apiKey": "k"}))
            .await
            .unwrap();

        let settings = store.get().await.unwrap();
        assert_eq!(settings.batch_size, 7);
        assert_eq!(settings.api_key, "k");
        assert_eq!(settings.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
        assert!(settings.enabled);
    }

    #[tokio::test]
    async fn get_falls_back_to_defaults_on_malformed_record() {
        let (backing, store) = settings_store();
        backing
            .save(SETTINGS_KEY, &json!({"batchSize": "lots"}))
            .await
            .unwrap();

        assert_eq!(store.get().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn patch_updates_only_supplied_fields() {
        let (_, store) = settings_store();

        let updated = store
            .patch(SettingsPatch {
                endpoint: Some("https://collector.example/ingest".to_string()),
                max_retries: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.endpoint, "https://collector.example/ingest");
        assert_eq!(updated.max_retries, 2);
        assert_eq!(updated.batch_size, DEFAULT_BATCH_SIZE);

        // A second patch keeps the first one's fields
        let updated = store
            .patch(SettingsPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.endpoint, "https://collector.example/ingest");
        assert_eq!(store.get().await.unwrap(), updated);
    }

    #[tokio::test]
    async fn empty_patch_resets_to_defaults() {
        let (_, store) = settings_store();
        store
            .patch(SettingsPatch {
                api_key: Some("abc".to_string()),
                batch_size: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();

        let reset = store.patch(SettingsPatch::default()).await.unwrap();
        assert_eq!(reset, Settings::default());
        assert_eq!(store.get().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn reset_to_default_matches_empty_patch() {
        let (_, store) = settings_store();
        store
            .patch(SettingsPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let reset = store.reset_to_default().await.unwrap();
        assert_eq!(reset, Settings::default());
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected_and_state_unchanged() {
        let (_, store) = settings_store();

        let err = store
            .patch(SettingsPatch {
                batch_size: Some(0),
                endpoint: Some("https://ignored.example/ingest".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidValue { ref field, .. } if field == "batchSize"
        ));

        let err = store
            .patch(SettingsPatch {
                flush_interval_ms: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidValue { ref field, .. } if field == "flushIntervalMs"
        ));

        assert_eq!(store.get().await.unwrap(), Settings::default());
    }

    #[test]
    fn api_key_is_trimmed() {
        let settings = Settings {
            api_key: "  abc \n".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.api_key(), Some("abc"));

        let blank = Settings {
            api_key: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(blank.api_key(), None);
    }

    #[test]
    fn patch_deserializes_from_camel_case() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"apiKey":"abc","flushIntervalMs":1000}"#).unwrap();
        assert_eq!(patch.api_key.as_deref(), Some("abc"));
        assert_eq!(patch.flush_interval_ms, Some(1000));
        assert!(!patch.is_empty());

        let empty: SettingsPatch = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn settings_serialize_with_camel_case_fields() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["flushIntervalMs"], 4000);
        assert_eq!(json["batchSize"], 25);
        assert_eq!(json["maxRetries"], 5);
        assert_eq!(json["apiKey"], "");
    }
}
