//! ThreatGuard Agent - security telemetry queue and delivery.
//!
//! This binary runs the agent daemon and offers a few maintenance commands
//! against its persisted state.
//!
//! # Commands
//!
//! - `threatguard-agent run`: Start the agent (scheduler, pipeline, control surface)
//! - `threatguard-agent install-id`: Print the installation identifier
//! - `threatguard-agent settings show|set|reset`: Inspect or edit operational settings
//! - `threatguard-agent queue status`: Show pending records
//! - `threatguard-agent flush`: Run one delivery tick now
//!
//! `queue status` and `flush` talk to a running agent over its control
//! surface when one is listening, and act on the state directory otherwise.
//!
//! # Environment Variables
//!
//! See the [`config`](threatguard_agent::config) module for available
//! configuration options.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use threatguard_agent::components::Components;
use threatguard_agent::config::{Config, LogFormat};
use threatguard_agent::control::ControlClient;
use threatguard_agent::notifier::{CommandSurface, LogSurface, NotificationSurface};
use threatguard_agent::pipeline::DEFAULT_PIPELINE_CAPACITY;
use threatguard_agent::routes::{create_router, AppState};
use threatguard_agent::settings::SettingsPatch;
use threatguard_agent::source::{EventSource, JsonLinesSource};
use threatguard_agent::store::{FileStore, StateStore};

/// ThreatGuard Agent - security telemetry queue and delivery.
///
/// Buffers page telemetry durably, ships it to the collector in batches and
/// raises alerts for events the predictor flags as anomalous.
#[derive(Parser, Debug)]
#[command(name = "threatguard-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    THREATGUARD_STATE_DIR             State directory (default: <data dir>/threatguard)
    THREATGUARD_LISTEN_ADDR           Control surface address (default: 127.0.0.1:7878)
    THREATGUARD_QUEUE_CAPACITY        Queue retention cap (default: 5000)
    THREATGUARD_REQUEST_TIMEOUT_SECS  Collector request timeout (default: 10)
    THREATGUARD_NOTIFY_COMMAND        Command for local alerts, e.g. notify-send
    THREATGUARD_LOG_FORMAT            pretty or json (default: pretty)
    THREATGUARD_STDIN_EVENTS          Read JSON-lines observations from stdin

EXAMPLES:
    # Point the agent at a collector
    threatguard-agent settings set --endpoint https://collector.example/ingest --api-key KEY

    # Start the agent
    threatguard-agent run

    # Feed observations from another process
    producer | THREATGUARD_STDIN_EVENTS=true threatguard-agent run
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent daemon.
    Run,

    /// Print the installation identifier, creating it if needed.
    InstallId,

    /// Inspect or edit operational settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Inspect the pending queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run one delivery tick immediately.
    Flush,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print the current settings as JSON.
    Show,

    /// Update individual fields. With no fields, resets to defaults.
    Set {
        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        flush_interval_ms: Option<u64>,

        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Restore every field to its default.
    Reset,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show the number of pending records.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_logging(config.log_format);

    let components = build_components(&config).await;

    match cli.command {
        Command::Run => run_agent(config, components).await,
        Command::InstallId => {
            let id = components
                .identity
                .install_id()
                .await
                .context("Failed to resolve installation identifier")?;
            println!("{id}");
            Ok(())
        }
        Command::Settings { action } => run_settings(action, &components).await,
        Command::Queue {
            action: QueueAction::Status,
        } => {
            let control = ControlClient::new(config.listen_addr, config.request_timeout);
            if let Some(health) = control
                .health()
                .await
                .context("Failed to query the running agent")?
            {
                println!("pending:  {}", health.queued);
                println!("agent:    {} ({})", control.base_url(), health.status);
                return Ok(());
            }

            let pending = components.queue.snapshot().await;
            println!("pending:  {}", pending.len());
            println!("capacity: {}", components.queue.capacity());
            if let Some(oldest) = pending.first() {
                println!("oldest:   {} ({})", oldest.t.to_rfc3339(), oldest.kind);
            }
            Ok(())
        }
        Command::Flush => {
            // A running agent owns the queue; flushing the state file behind
            // its back would deliver records twice
            let control = ControlClient::new(config.listen_addr, config.request_timeout);
            let outcome = match control
                .flush()
                .await
                .context("Failed to flush through the running agent")?
            {
                Some(outcome) => outcome,
                None => {
                    info!("No running agent, flushing the local queue");
                    components.scheduler.flush_now().await
                }
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

async fn build_components(config: &Config) -> Components {
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&config.state_dir));
    let surface: Arc<dyn NotificationSurface> =
        match config.notify_command.as_deref().and_then(CommandSurface::parse) {
            Some(command) => Arc::new(command),
            None => Arc::new(LogSurface),
        };
    Components::build(store, config.queue_capacity, config.request_timeout, surface).await
}

async fn run_settings(action: SettingsAction, components: &Components) -> Result<()> {
    let settings = match action {
        SettingsAction::Show => components.settings.get().await?,
        SettingsAction::Set {
            enabled,
            endpoint,
            api_key,
            batch_size,
            flush_interval_ms,
            max_retries,
        } => {
            let patch = SettingsPatch {
                enabled,
                endpoint,
                api_key,
                batch_size,
                flush_interval_ms,
                max_retries,
            };
            if patch.is_empty() {
                eprintln!("No fields given, resetting settings to defaults.");
            }
            components
                .settings
                .patch(patch)
                .await
                .context("Failed to update settings")?
        }
        SettingsAction::Reset => components
            .settings
            .reset_to_default()
            .await
            .context("Failed to reset settings")?,
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// Runs the daemon until SIGINT or SIGTERM.
async fn run_agent(config: Config, components: Components) -> Result<()> {
    info!("Starting ThreatGuard agent");

    let install_id = components
        .identity
        .install_id()
        .await
        .context("Failed to resolve installation identifier")?;
    let settings = components.settings.get().await?;
    info!(
        install_id = %install_id,
        state_dir = %config.state_dir.display(),
        endpoint = %settings.endpoint,
        enabled = settings.enabled,
        pending = components.queue.len().await,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(DEFAULT_PIPELINE_CAPACITY);

    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&components.scheduler);
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });

    let pipeline_handle = tokio::spawn({
        let pipeline = Arc::clone(&components.pipeline);
        let shutdown = shutdown_rx.clone();
        async move { pipeline.run(events_rx, shutdown).await }
    });

    if config.stdin_events {
        let tx = events_tx.clone();
        tokio::spawn(async move {
            let source = Box::new(JsonLinesSource::stdin());
            let name = source.name();
            if let Err(e) = source.run(tx).await {
                warn!(source = name, error = %e, "Event source failed");
            }
        });
        info!("Reading observations from stdin");
    }

    let app = create_router(AppState::new(&components, events_tx));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    info!(address = %config.listen_addr, "Control surface listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    info!("Agent running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;
    info!("Shutdown signal received");
    shutdown_tx.send_replace(true);

    server_handle
        .await
        .context("Control surface task panicked")?
        .context("Control surface error")?;
    let processed = pipeline_handle.await.context("Pipeline task panicked")?;
    scheduler_handle.await.context("Scheduler task panicked")?;

    info!(
        processed,
        pending = components.queue.len().await,
        "ThreatGuard agent stopped"
    );
    Ok(())
}

/// Initializes logging to stderr, human-readable or JSON.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .init();
        }
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
