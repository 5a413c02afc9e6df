//! Qingping MQTT to Prometheus bridge.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use mqtt_bridge_qingping::bridge::INGEST_QUEUE_CAPACITY;
use mqtt_bridge_qingping::{
    BridgeConfig, DeviceView, HttpServer, Ingestor, KeepaliveController, MetricCollector, MqttChannel,
    SessionDriver, SessionTiming, StalenessReaper, UpdateTracker,
};

/// Export Qingping air monitor readings as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-qingping")]
#[command(about = "Export Qingping air monitor readings from MQTT as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config and METRICS_PORT).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // File, then environment, then CLI.
    let mut config = if let Some(config_path) = &args.config {
        BridgeConfig::load_from_file(config_path)?
    } else {
        BridgeConfig::default()
    };
    let ignored_env = config.apply_env();

    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    config.validate()?;
    airsight_common::init_tracing(&config.logging)?;

    for ignored in &ignored_env {
        warn!(
            key = ignored.key,
            value = %ignored.value,
            "Ignoring unparseable environment value, keeping default"
        );
    }

    let device = &config.device;
    info!(
        device = %device.name,
        mac = %device.mac,
        interval_secs = device.update_interval_secs,
        duration_secs = device.duration_secs,
        "Starting Qingping bridge"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector = Arc::new(MetricCollector::new(config.prometheus.prefix.clone()));
    let tracker = Arc::new(UpdateTracker::new());
    let topics = device.topics();

    let (client, eventloop) = airsight_common::connect(&config.mqtt)?;
    let channel = MqttChannel::new(client);
    let controller = Arc::new(KeepaliveController::new(
        channel.clone(),
        topics.clone(),
        device.keepalive_command(),
    ));

    let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
    let ingestor = Ingestor::new(device.name.clone(), collector.clone(), tracker.clone());
    let session = SessionDriver::new(
        eventloop,
        channel,
        controller.clone(),
        topics,
        ingest_tx,
        SessionTiming::from(&config.mqtt),
    );
    let reaper = StalenessReaper::new(tracker.clone(), collector.clone(), device.update_interval());

    let listen_addr = config.listen_addr()?;
    let view = DeviceView {
        collector: collector.clone(),
        tracker: tracker.clone(),
    };
    let http_server = HttpServer::new(view, listen_addr, config.prometheus.path.clone());

    let session_task = tokio::spawn(session.run(shutdown_rx.clone()));
    let ingest_task = tokio::spawn(ingestor.run(ingest_rx));
    let refresh_task = tokio::spawn(controller.run_refresh(shutdown_rx.clone()));
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    // The ingest worker ends once the session drops its sender.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = session_task.await;
        let _ = ingest_task.await;
        let _ = refresh_task.await;
        let _ = reaper_task.await;
        let _ = http_task.await;
    })
    .await;

    let stats = collector.stats();
    info!(
        messages_received = stats.messages_received,
        readings_accepted = stats.readings_accepted,
        messages_ignored = stats.messages_ignored,
        messages_rejected = stats.messages_rejected,
        devices_reaped = stats.devices_reaped,
        series_count = collector.series_count(),
        "Final statistics"
    );

    info!("Bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
