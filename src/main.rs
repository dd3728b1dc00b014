//! Shipment tracking reconciler
//!
//! Polls carrier tracking APIs on an adaptive schedule, merges new events into
//! each tracked shipment and publishes the resulting domain events.
//!
//! Module structure:
//! - `domain/` - Tracking aggregate, statuses, interval strategy
//! - `io/` - Carrier clients, repository, publisher, contract listener, metrics endpoint
//! - `services/` - Reconciliation, registration, scheduler
//! - `infra/` - Config, Metrics

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use tracking_reconciler::domain::interval::IntervalStrategy;
use tracking_reconciler::domain::status_map::StatusMappingTable;
use tracking_reconciler::infra::{Config, Metrics};
use tracking_reconciler::io::cache::LastCheckCache;
use tracking_reconciler::io::contract_listener::{run_contract_worker, start_contract_listener};
use tracking_reconciler::io::publisher::LogEventPublisher;
use tracking_reconciler::io::{
    create_publish_channel, CarrierClients, EventPublisher, InMemoryTrackingRepository, MqttPublisher,
    ResilientCarrierClient, TrackingRepository,
};
use tracking_reconciler::services::{Reconciler, RegistrationService, Scheduler, SchedulerOptions};

/// Shipment tracking reconciler
#[derive(Parser, Debug)]
#[command(name = "tracking-reconciler", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("GIT_HASH"), "tracking-reconciler starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        service_id = %config.service_id(),
        carriers = %config.carriers().len(),
        tick_interval_secs = %config.scheduler().tick_interval_secs,
        batch_size = %config.scheduler().batch_size,
        selection = %config.scheduler().selection.as_str(),
        mqtt_enabled = %config.mqtt_enabled(),
        metrics_port = %config.metrics_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let mut clients = CarrierClients::new();
    for endpoint in config.carriers() {
        let name = endpoint.name;
        let client = ResilientCarrierClient::from_endpoint(endpoint.clone(), config.circuit_breaker(), metrics.clone())
            .with_context(|| format!("failed to build HTTP client for {name}"))?;
        info!(carrier = %name, base_url = %endpoint.base_url, "carrier_client_ready");
        clients.insert(Arc::new(client));
    }
    if clients.is_empty() {
        warn!("no_carriers_configured");
    }

    let store = match config.snapshot_file() {
        Some(path) => Arc::new(
            InMemoryTrackingRepository::load_snapshot(path)
                .with_context(|| format!("failed to load snapshot {path}"))?,
        ),
        None => Arc::new(InMemoryTrackingRepository::new()),
    };
    let repository: Arc<dyn TrackingRepository> = store.clone();

    let mut background = Vec::new();

    let publisher: Arc<dyn EventPublisher> = if config.mqtt_enabled() {
        let (publisher, rx) = create_publish_channel(config.mqtt_queue_size());
        let mqtt = MqttPublisher::new(&config, rx);
        background.push(tokio::spawn(mqtt.run(shutdown_rx.clone())));
        Arc::new(publisher)
    } else {
        info!("mqtt_disabled_events_logged_only");
        Arc::new(LogEventPublisher)
    };

    let strategy = Arc::new(IntervalStrategy::new(config.intervals().clone()));
    let cache = Arc::new(LastCheckCache::new(config.last_check_ttl()));

    let reconciler = Arc::new(
        Reconciler::new(
            repository.clone(),
            clients.clone(),
            publisher.clone(),
            Arc::new(StatusMappingTable::default()),
            strategy.clone(),
            metrics.clone(),
            config.default_carrier(),
        )
        .with_cache(cache.clone()),
    );

    let registration =
        Arc::new(RegistrationService::new(repository.clone(), publisher.clone(), strategy, metrics.clone()));

    if config.mqtt_enabled() {
        let (contract_tx, contract_rx) = mpsc::channel(config.mqtt_queue_size());
        tokio::spawn(run_contract_worker(contract_rx, registration.clone()));

        let listener_config = config.clone();
        let listener_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_contract_listener(&listener_config, contract_tx, listener_shutdown).await {
                error!(error = %format!("{e:#}"), "contract_listener_failed");
            }
        });
    }

    let metrics_port = config.metrics_port();
    if metrics_port > 0 {
        let server_metrics = metrics.clone();
        let server_clients = clients.clone();
        let service_id = config.service_id().to_string();
        let server_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = tracking_reconciler::io::prometheus::start_metrics_server(
                metrics_port,
                server_metrics,
                server_clients,
                service_id,
                server_shutdown,
            )
            .await
            {
                error!(error = %format!("{e:#}"), "metrics_server_failed");
            }
        });
    }

    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    let options = SchedulerOptions {
        cache: Some(cache),
        snapshot: config.snapshot_file().map(|path| (store.clone(), PathBuf::from(path))),
    };
    let scheduler = Scheduler::new(&config, reconciler, repository, metrics.clone(), options);
    scheduler.start();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");

    scheduler.stop().await;
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background_task_join_failed");
        }
    }

    if let Some(path) = config.snapshot_file() {
        match store.write_snapshot(path) {
            Ok(written) => info!(file = %path, records = %written, "snapshot_saved"),
            Err(e) => error!(file = %path, error = %e, "snapshot_save_failed"),
        }
    }

    metrics.snapshot().log();
    info!("tracking-reconciler shutdown complete");
    Ok(())
}
