//! Garage monitor - turns door sensor pings into door events and alerts
//!
//! Module structure:
//! - `domain/` - Door state, interpreter, notification payloads, snooze
//! - `io/` - External interfaces (MQTT ingest, MQTT egress, history log)
//! - `services/` - Event updates, door-not-closed alerts, retention
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use garage_monitor::infra::{Config, Metrics};
use garage_monitor::io::{create_egress_channel, HistoryLog, MqttPublisher};
use garage_monitor::services::{DoorAlertChecker, EventUpdater, MemoryStore, RetentionJob};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Garage door monitor
#[derive(Parser, Debug)]
#[command(name = "garage-monitor", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Default: INFO, use RUST_LOG=debug for per-ping visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(git_hash = %env!("GIT_HASH"), version = %env!("CARGO_PKG_VERSION"), "garage_monitor_starting");

    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        egress = %config.mqtt_egress_enabled(),
        history_file = %config.history_file().unwrap_or("disabled"),
        recheck_interval_secs = %config.recheck_interval_secs(),
        snooze = %config.snooze_enabled(),
        retention = %config.retention_enabled(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());

    let mut updater = EventUpdater::new(store.clone(), metrics.clone());
    let mut alerts = DoorAlertChecker::new(store.clone(), metrics.clone(), config.snooze_enabled());

    let mut retention = RetentionJob::new(
        store.clone(),
        metrics.clone(),
        config.retention_enabled(),
        config.retention_dry_run(),
        config.retention_max_age_days(),
    );

    if let Some(path) = config.history_file() {
        let history = HistoryLog::new(path);
        if let Err(e) = history.restore_into(&store) {
            warn!(error = %format!("{e:#}"), "history_restore_failed");
        }
        updater = updater.with_history_log(history.clone());
        alerts = alerts.with_history_log(history.clone());
        retention = retention.with_history_log(history);
    }

    let mut tasks = Vec::new();

    if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(1000, config.site_id().to_string(), metrics.clone());
        updater = updater.with_egress(egress_sender.clone());
        alerts = alerts.with_egress(egress_sender);

        let publisher = MqttPublisher::new(&config, egress_rx);
        tasks.push(tokio::spawn(publisher.run(shutdown_rx.clone())));
    }

    // Bounded ping channel
    let (ping_tx, ping_rx) = mpsc::channel(1000);
    // Snooze requests; with snoozing off the sender is dropped and nothing subscribes
    let (snooze_tx, snooze_rx) = mpsc::channel(64);
    let snooze_tx = config.snooze_enabled().then_some(snooze_tx);

    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = garage_monitor::io::mqtt::start_mqtt_client(
            &mqtt_config,
            ping_tx,
            snooze_tx,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            tracing::error!(error = %format!("{e:#}"), "mqtt_client_failed");
        }
    });

    tasks.push(tokio::spawn(alerts.run(
        config.alert_check_interval_secs(),
        snooze_rx,
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(retention.run(config.retention_interval_secs(), shutdown_rx.clone())));

    // Metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(metrics_interval.max(1)));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Consumes pings and re-checks doors until shutdown
    updater.run(ping_rx, config.recheck_interval_secs(), shutdown_rx).await;

    for task in tasks {
        task.await.ok();
    }

    metrics.report().log();
    info!("garage_monitor_shutdown_complete");
    Ok(())
}
