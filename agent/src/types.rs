//! Telemetry record types.
//!
//! - [`Observation`]: what an event source captured in the page or browser,
//!   tagged by `type`. Observations are never queued as-is.
//! - [`EventRecord`]: the normalized, privacy-filtered record that is queued
//!   and shipped to the collector. Its wire form is a flat JSON object with
//!   `kind`, kind-specific fields, `installId`, `t`, `_ts` and `_retries`.
//! - [`AlertMessage`]: what live listeners receive when an event is judged
//!   anomalous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::privacy::{allowlist_headers, redact_url, truncate_chars, MAX_CONSOLE_MESSAGE_CHARS};

/// A normalized telemetry record.
///
/// Immutable once enqueued except for `retries`, which the flush scheduler
/// increments on every failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Record kind, e.g. `login_attempt` or `client_request`.
    pub kind: String,

    /// Installation that observed the event.
    #[serde(rename = "installId", default)]
    pub install_id: String,

    /// When the event was observed.
    pub t: DateTime<Utc>,

    /// Enqueue time in epoch milliseconds, set by the queue on append.
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// Failed delivery attempts so far.
    #[serde(rename = "_retries", default)]
    pub retries: u32,

    /// Kind-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    /// Creates a record observed now, not yet enqueued.
    #[must_use]
    pub fn new(kind: impl Into<String>, install_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            install_id: install_id.into(),
            t: Utc::now(),
            ts: None,
            retries: 0,
            fields,
        }
    }

    /// Returns a kind-specific string field.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The field that best identifies what the event is about: the path for
    /// login and request-like events, otherwise the URL.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.field_str("path")
            .filter(|p| !p.is_empty())
            .or_else(|| self.field_str("url").filter(|u| !u.is_empty()))
    }
}

/// HTTP request details captured by the fetch/XHR hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

/// HTTP response details captured by the fetch/XHR hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A raw observation produced by an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    /// Console output from the page.
    #[serde(rename_all = "camelCase")]
    Console {
        level: String,
        message: String,
        #[serde(default, alias = "pageUrl")]
        url: Option<String>,
        #[serde(default)]
        top_frame: Option<bool>,
    },

    /// Uncaught error or unhandled rejection.
    #[serde(rename_all = "camelCase")]
    RuntimeError {
        error: String,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default, alias = "pageUrl")]
        url: Option<String>,
        #[serde(default)]
        top_frame: Option<bool>,
    },

    /// Submission of a form containing a password field.
    #[serde(rename_all = "camelCase")]
    LoginAttempt {
        path: String,
        method: String,
        #[serde(default, alias = "pageUrl")]
        url: Option<String>,
        #[serde(default)]
        top_frame: Option<bool>,
    },

    /// A fetch or XHR issued by the page.
    #[serde(rename = "xhrfetch", rename_all = "camelCase")]
    XhrFetch {
        phase: String,
        request: CapturedRequest,
        #[serde(default)]
        response: Option<CapturedResponse>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default, alias = "pageUrl")]
        url: Option<String>,
        #[serde(default)]
        top_frame: Option<bool>,
    },

    /// A completed browser-level network request.
    #[serde(rename_all = "camelCase")]
    NetCompleted {
        url: String,
        method: String,
        status: u16,
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        initiator: Option<String>,
        #[serde(default)]
        res_type: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        completed_at: Option<f64>,
    },

    /// A failed browser-level network request.
    #[serde(rename_all = "camelCase")]
    NetError {
        url: String,
        method: String,
        error: String,
        #[serde(default)]
        res_type: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        failed_at: Option<f64>,
    },

    /// A cookie was set or removed.
    #[serde(rename_all = "camelCase")]
    CookieChange {
        domain: String,
        path: String,
        secure: bool,
        http_only: bool,
        #[serde(default)]
        same_site: Option<String>,
        removed: bool,
        #[serde(default)]
        cause: Option<String>,
        #[serde(default)]
        expires: Option<f64>,
    },
}

impl Observation {
    /// The record kind this observation normalizes to.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Console { .. } => "console",
            Self::RuntimeError { .. } => "runtime_error",
            Self::LoginAttempt { .. } => "login_attempt",
            Self::XhrFetch { .. } => "client_request",
            Self::NetCompleted { .. } => "net_completed",
            Self::NetError { .. } => "net_error",
            Self::CookieChange { .. } => "cookie_change",
        }
    }

    /// Normalizes the observation into a queueable record.
    ///
    /// URLs are redacted, request headers are allowlisted and console
    /// messages are bounded. Page-level observations default `topFrame` to
    /// `true`.
    #[must_use]
    pub fn into_record(self, install_id: &str) -> EventRecord {
        let kind = self.kind();
        let redact = |url: Option<String>| url.map(|u| redact_url(&u, &[]));

        let fields = match self {
            Self::Console {
                level,
                message,
                url,
                top_frame,
            } => json!({
                "level": level,
                "message": truncate_chars(&message, MAX_CONSOLE_MESSAGE_CHARS),
                "url": redact(url),
                "topFrame": top_frame.unwrap_or(true),
            }),
            Self::RuntimeError {
                error,
                stack,
                url,
                top_frame,
            } => json!({
                "error": error,
                "stack": stack,
                "url": redact(url),
                "topFrame": top_frame.unwrap_or(true),
            }),
            Self::LoginAttempt {
                path,
                method,
                url,
                top_frame,
            } => json!({
                "path": path,
                "method": method,
                "hasPwdField": true,
                "url": redact(url),
                "topFrame": top_frame.unwrap_or(true),
            }),
            Self::XhrFetch {
                phase,
                request,
                response,
                duration_ms,
                url,
                top_frame,
            } => json!({
                "phase": phase,
                "url": redact_url(&request.url, &[]),
                "method": request.method,
                "headers": allowlist_headers(&request.headers),
                "status": response.map(|r| r.status),
                "durationMs": duration_ms,
                "pageUrl": redact(url),
                "topFrame": top_frame.unwrap_or(true),
            }),
            Self::NetCompleted {
                url,
                method,
                status,
                ip,
                initiator,
                res_type,
                request_id,
                completed_at,
            } => json!({
                "url": redact_url(&url, &[]),
                "method": method,
                "status": status,
                "ip": ip,
                "initiator": initiator,
                "resType": res_type,
                "requestId": request_id,
                "completedAt": completed_at,
            }),
            Self::NetError {
                url,
                method,
                error,
                res_type,
                request_id,
                failed_at,
            } => json!({
                "url": redact_url(&url, &[]),
                "method": method,
                "error": error,
                "resType": res_type,
                "requestId": request_id,
                "failedAt": failed_at,
            }),
            Self::CookieChange {
                domain,
                path,
                secure,
                http_only,
                same_site,
                removed,
                cause,
                expires,
            } => json!({
                "domain": domain,
                "path": path,
                "secure": secure,
                "httpOnly": http_only,
                "sameSite": same_site,
                "removed": removed,
                "cause": cause,
                "expires": expires,
            }),
        };

        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        EventRecord::new(kind, install_id, fields)
    }
}

/// Alert pushed to live listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Always `"alert"`.
    pub kind: String,

    /// Severity, e.g. `warning`.
    pub level: String,

    /// Alert category, e.g. `threat`.
    #[serde(rename = "type")]
    pub alert_type: String,

    /// Human-readable description.
    pub message: String,
}

impl AlertMessage {
    /// Builds the alert raised when the predictor flags `event`.
    #[must_use]
    pub fn anomaly(event: &EventRecord) -> Self {
        let message = format!(
            "Anomaly detected: {} {}",
            event.kind,
            event.subject().unwrap_or_default()
        );
        Self {
            kind: "alert".to_string(),
            level: "warning".to_string(),
            alert_type: "threat".to_string(),
            message: message.trim_end().to_string(),
        }
    }
}
