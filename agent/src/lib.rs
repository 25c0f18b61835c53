//! ThreatGuard Agent - security telemetry queue and delivery.
//!
//! This crate buffers security telemetry observed in browser pages (console
//! output, network requests, login attempts, runtime errors, cookie changes)
//! and reliably relays it to a remote collector, with a synchronous anomaly
//! check that pushes urgent alerts to live listeners.
//!
//! # Overview
//!
//! Observations arrive from an [`source::EventSource`] or the local HTTP
//! surface, are normalized by the [`pipeline`], and land in the
//! [`queue::DurableQueue`]. The [`scheduler::FlushScheduler`] drains the
//! queue in batches and hands them to the [`delivery::DeliveryClient`],
//! requeueing with bounded exponential backoff on failure. Right after each
//! append, the [`notifier::AnomalyNotifier`] asks the collector's predictor
//! about the event and raises an alert when it is flagged.
//!
//! # Privacy
//!
//! Query strings, URL credentials and non-allowlisted headers never leave
//! the process; see [`privacy`].
//!
//! # Modules
//!
//! - [`types`]: Observations, queued records and alert messages
//! - [`store`]: Persisted key/value slots
//! - [`identity`]: Installation identifier
//! - [`settings`]: Operational settings with defaults and patching
//! - [`queue`]: Durable, bounded FIFO of pending records
//! - [`delivery`]: HTTP client for the ingest and predict endpoints
//! - [`scheduler`]: Periodic batched flushing with backoff
//! - [`broadcast`]: Alert fan-out to live listeners
//! - [`notifier`]: Anomaly check and local notifications
//! - [`privacy`]: URL redaction, header allowlist, truncation
//! - [`source`]: Event sources
//! - [`pipeline`]: Observation to queued record
//! - [`components`]: Construction of all long-lived components
//! - [`routes`]: Local HTTP control surface
//! - [`config`]: Configuration from environment variables
//! - [`control`]: Client for a running agent's control surface
//! - [`error`]: Error types for agent operations

pub mod broadcast;
pub mod components;
pub mod config;
pub mod control;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod notifier;
pub mod pipeline;
pub mod privacy;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod settings;
pub mod source;
pub mod store;
pub mod types;

pub use broadcast::AlertBroadcaster;
pub use components::Components;
pub use config::{Config, ConfigError, LogFormat};
pub use control::{ControlClient, ControlError};
pub use delivery::{BatchSink, Delivery, DeliveryClient, DeliveryError, PredictResponse};
pub use error::{AgentError, Result};
pub use identity::IdentityProvider;
pub use notifier::{AnomalyNotifier, CommandSurface, LogSurface, NotificationSurface, Verdict};
pub use pipeline::Pipeline;
pub use queue::{AppendOutcome, DurableQueue, RequeueOutcome};
pub use scheduler::{backoff_delay, FlushScheduler, SchedulerState, TickOutcome};
pub use settings::{Settings, SettingsError, SettingsPatch, SettingsStore};
pub use source::{EventSource, JsonLinesSource};
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
pub use types::{AlertMessage, EventRecord, Observation};
