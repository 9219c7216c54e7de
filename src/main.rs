//! Presence guardian - RD-03D radar presence tracking service
//!
//! Polls the radar over UART, debounces detections into present/absent
//! transitions, records each transition in an append-only event log and
//! answers status queries over HTTP.
//!
//! Module structure:
//! - `domain/` - Core types (Detection, PresenceEvent, PresenceSnapshot)
//! - `io/` - External interfaces (serial radar, event log, HTTP API)
//! - `services/` - Presence state machine and polling loop
//! - `infra/` - Infrastructure (Config, Metrics)

use chrono::Utc;
use clap::Parser;
use presence_guardian::infra::{Config, Metrics};
use presence_guardian::io::api::{start_api_server, ApiState};
use presence_guardian::io::{EventStore, JsonlEventStore, SerialConnector};
use presence_guardian::services::{PollSettings, PresenceService, PresenceTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence guardian - radar-driven occupancy tracking
#[derive(Parser, Debug)]
#[command(name = "presence-guardian", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "presence-guardian starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::resolve_config_path);
    let config = Config::load_from_path(&config_path);
    config.validate()?;

    info!(
        config_file = %config.config_file(),
        device = %config.sensor_device(),
        baud = %config.sensor_baud(),
        inactivity_timeout_s = %config.inactivity_timeout_s(),
        hysteresis_m = %config.hysteresis_m(),
        store_path = %config.store_path(),
        api_port = %config.api_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn EventStore> = Arc::new(JsonlEventStore::open(config.store_path())?);
    let tracker = Arc::new(PresenceTracker::new(&config, store, metrics.clone()));
    let service = Arc::new(PresenceService::new(
        tracker.clone(),
        Arc::new(SerialConnector::from_config(&config)),
        metrics.clone(),
        PollSettings::from_config(&config),
    ));

    service.start();

    // HTTP query surface (if port > 0)
    let api_handle = if config.api_port() > 0 {
        let addr: SocketAddr = format!("{}:{}", config.api_host(), config.api_port()).parse()?;
        let state = Arc::new(ApiState::new(service.clone(), metrics.clone()));
        let api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(addr, state, api_shutdown).await {
                error!(error = %e, "api_server_error");
            }
        }))
    } else {
        None
    };

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    service.stop().await;

    if config.reset_on_shutdown() {
        match tracker.force_absent(Utc::now()) {
            Ok(event) => info!(id = %event.id, "presence_reset_on_shutdown"),
            Err(e) => warn!(error = %e, "presence_reset_on_shutdown_failed"),
        }
    }

    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    metrics.report().log();
    info!("presence-guardian shutdown complete");
    Ok(())
}
