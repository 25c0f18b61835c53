//! Process configuration for the ThreatGuard agent.
//!
//! This module handles parsing configuration from environment variables.
//! Operational settings (endpoint, API key, batching) are not configured
//! here; they live in the settings store and can be edited at runtime.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `THREATGUARD_STATE_DIR` | No | `<data dir>/threatguard` | Directory holding the persisted slots |
//! | `THREATGUARD_LISTEN_ADDR` | No | `127.0.0.1:7878` | Bind address of the local control surface |
//! | `THREATGUARD_QUEUE_CAPACITY` | No | 5000 | Retention cap of the durable queue |
//! | `THREATGUARD_REQUEST_TIMEOUT_SECS` | No | 10 | Timeout for collector requests |
//! | `THREATGUARD_NOTIFY_COMMAND` | No | - | Command run for local alerts (e.g. `notify-send`) |
//! | `THREATGUARD_LOG_FORMAT` | No | `pretty` | `pretty` or `json` |
//! | `THREATGUARD_STDIN_EVENTS` | No | `false` | Also read JSON-lines observations from stdin |
//!
//! # Example
//!
//! ```no_run
//! use threatguard_agent::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("State directory: {}", config.state_dir.display());
//! ```

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Default bind address of the control surface.
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";

/// Default collector request timeout (in seconds).
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// State directory name under the platform data directory.
const STATE_DIR_NAME: &str = "threatguard";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

/// Configuration for the ThreatGuard agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the persisted state slots.
    pub state_dir: PathBuf,

    /// Bind address of the local control surface.
    pub listen_addr: SocketAddr,

    /// Retention cap of the durable queue.
    pub queue_capacity: usize,

    /// Timeout applied to every collector request.
    pub request_timeout: Duration,

    /// Command line for local alert notifications. `None` logs them instead.
    pub notify_command: Option<String>,

    /// Log output format.
    pub log_format: LogFormat,

    /// Whether to read observations from stdin in addition to HTTP.
    pub stdin_events: bool,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a numeric variable is set but is not a positive integer
    /// - `THREATGUARD_LISTEN_ADDR` is not a socket address
    /// - `THREATGUARD_LOG_FORMAT` or `THREATGUARD_STDIN_EVENTS` has an
    ///   unrecognized value
    /// - `THREATGUARD_STATE_DIR` is unset and no platform data directory can
    ///   be determined
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: THREATGUARD_STATE_DIR (default: <data dir>/threatguard)
        let state_dir = match env::var("THREATGUARD_STATE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => BaseDirs::new()
                .map(|dirs| dirs.data_dir().join(STATE_DIR_NAME))
                .ok_or_else(|| ConfigError::MissingEnvVar("THREATGUARD_STATE_DIR".to_string()))?,
        };

        // Optional: THREATGUARD_LISTEN_ADDR (default: 127.0.0.1:7878)
        let listen_addr = env::var("THREATGUARD_LISTEN_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "THREATGUARD_LISTEN_ADDR".to_string(),
                message: format!("expected host:port, got '{listen_addr}'"),
            })?;

        // Optional: THREATGUARD_QUEUE_CAPACITY (default: 5000, must be > 0)
        let queue_capacity = parse_positive("THREATGUARD_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;

        // Optional: THREATGUARD_REQUEST_TIMEOUT_SECS (default: 10, must be > 0)
        let request_timeout = Duration::from_secs(parse_positive(
            "THREATGUARD_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        // Optional: THREATGUARD_NOTIFY_COMMAND (default: None = log alerts)
        let notify_command = env::var("THREATGUARD_NOTIFY_COMMAND")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        let log_format = match env::var("THREATGUARD_LOG_FORMAT") {
            Ok(val) => val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "THREATGUARD_LOG_FORMAT".to_string(),
                message,
            })?,
            Err(_) => LogFormat::default(),
        };

        let stdin_events = match env::var("THREATGUARD_STDIN_EVENTS") {
            Ok(val) => parse_bool(&val).ok_or_else(|| ConfigError::InvalidValue {
                key: "THREATGUARD_STDIN_EVENTS".to_string(),
                message: format!("expected true or false, got '{val}'"),
            })?,
            Err(_) => false,
        };

        Ok(Self {
            state_dir,
            listen_addr,
            queue_capacity,
            request_timeout,
            notify_command,
            log_format,
            stdin_events,
        })
    }
}

fn parse_positive<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };
    let parsed = val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected positive integer, got '{val}'"),
    })?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than 0".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Runs `f` with every `THREATGUARD_*` variable removed, restoring them
    /// afterwards.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("THREATGUARD_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("THREATGUARD_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/threatguard-test");

            let config = Config::from_env().expect("should parse defaults");

            assert_eq!(config.state_dir, PathBuf::from("/tmp/threatguard-test"));
            assert_eq!(config.listen_addr, "127.0.0.1:7878".parse().unwrap());
            assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
            assert_eq!(config.request_timeout, Duration::from_secs(10));
            assert!(config.notify_command.is_none());
            assert_eq!(config.log_format, LogFormat::Pretty);
            assert!(!config.stdin_events);
        });
    }

    #[test]
    #[serial]
    fn test_default_state_dir_uses_data_dir() {
        with_clean_env(|| {
            let Some(dirs) = BaseDirs::new() else {
                return;
            };
            let config = Config::from_env().expect("should parse defaults");
            assert_eq!(config.state_dir, dirs.data_dir().join("threatguard"));
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/var/lib/threatguard");
            env::set_var("THREATGUARD_LISTEN_ADDR", "0.0.0.0:9000");
            env::set_var("THREATGUARD_QUEUE_CAPACITY", "200");
            env::set_var("THREATGUARD_REQUEST_TIMEOUT_SECS", "3");
            env::set_var("THREATGUARD_NOTIFY_COMMAND", "notify-send -u critical");
            env::set_var("THREATGUARD_LOG_FORMAT", "JSON");
            env::set_var("THREATGUARD_STDIN_EVENTS", "yes");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.state_dir, PathBuf::from("/var/lib/threatguard"));
            assert_eq!(config.listen_addr.port(), 9000);
            assert_eq!(config.queue_capacity, 200);
            assert_eq!(config.request_timeout, Duration::from_secs(3));
            assert_eq!(
                config.notify_command.as_deref(),
                Some("notify-send -u critical")
            );
            assert_eq!(config.log_format, LogFormat::Json);
            assert!(config.stdin_events);
        });
    }

    #[test]
    #[serial]
    fn test_invalid_queue_capacity() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/tg");
            env::set_var("THREATGUARD_QUEUE_CAPACITY", "lots");

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "THREATGUARD_QUEUE_CAPACITY")
            );
        });
    }

    #[test]
    #[serial]
    fn test_zero_values_rejected() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/tg");
            env::set_var("THREATGUARD_REQUEST_TIMEOUT_SECS", "0");

            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("must be greater than 0"));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_listen_addr() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/tg");
            env::set_var("THREATGUARD_LISTEN_ADDR", "localhost");

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "THREATGUARD_LISTEN_ADDR")
            );
        });
    }

    #[test]
    #[serial]
    fn test_invalid_log_format_and_flag() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/tg");
            env::set_var("THREATGUARD_LOG_FORMAT", "xml");
            assert!(Config::from_env().is_err());

            env::remove_var("THREATGUARD_LOG_FORMAT");
            env::set_var("THREATGUARD_STDIN_EVENTS", "maybe");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_blank_notify_command_is_none() {
        with_clean_env(|| {
            env::set_var("THREATGUARD_STATE_DIR", "/tmp/tg");
            env::set_var("THREATGUARD_NOTIFY_COMMAND", "   ");

            let config = Config::from_env().unwrap();
            assert!(config.notify_command.is_none());
        });
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!(" Json ".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
