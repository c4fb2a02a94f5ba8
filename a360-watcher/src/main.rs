//! a360-watcher - aging-timeline ingestion watcher
//!
//! Observes the external generator's output directory, ingests recognized
//! timeline images into the canonical subject layout, records them in the
//! registry and streams live status events to connected observers.

use a360_common::config::AppConfig;
use a360_common::events::EventBus;
use a360_watcher::ingest::IngestEngine;
use a360_watcher::ledger::Ledger;
use a360_watcher::manifest::ManifestAssembler;
use a360_watcher::registry::{Registry, SheetRegistry, SubjectCache};
use a360_watcher::slots::SlotTable;
use a360_watcher::watchloop::WatchLoop;
use a360_watcher::AppState;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "a360-watcher", version, about = "A360 ingestion watcher")]
struct Args {
    /// Path to the TOML config file (falls back to A360_CONFIG_PATH, then
    /// the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting a360-watcher");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    // Fatal configuration problems abort startup with a non-zero exit;
    // the watcher never runs in a degraded silent state.
    let config_path = AppConfig::resolve_path(args.config.as_deref())
        .context("config file resolution failed")?;
    info!("config: {}", config_path.display());
    let config = Arc::new(AppConfig::load(&config_path)?);
    config.validate().context("invalid configuration")?;

    let registry: Arc<dyn Registry> = Arc::new(SheetRegistry::new(&config.registry_dir));
    let subjects = Arc::new(SubjectCache::new());
    let known = subjects
        .refresh(registry.as_ref())
        .await
        .context("initial registry read failed")?;
    info!("registry: {} ({known} subjects)", config.registry_dir.display());

    let event_bus = EventBus::new(256);
    let slots = Arc::new(SlotTable::new());
    let ledger = Arc::new(Ledger::new(
        config.write_event_log.then(|| config.event_log_path()),
        config.write_dataset_index.then(|| config.dataset_index_path()),
    ));
    let assembler = Arc::new(ManifestAssembler::new(
        &config.project_root,
        config.hash_images,
    ));

    let engine = Arc::new(IngestEngine::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&slots),
        event_bus.clone(),
        ledger,
        subjects,
        Arc::clone(&assembler),
    ));

    let cancel = CancellationToken::new();
    let (detections_tx, detections_rx) = mpsc::channel(256);

    let watch = WatchLoop::new(
        config.watch_dir.clone(),
        Duration::from_millis(config.poll_interval_ms),
        config.stability_cycles,
        detections_tx,
    );
    info!("watching {}", config.watch_dir.display());

    let watch_task = tokio::spawn(watch.run(cancel.clone()));
    let engine_task = tokio::spawn(Arc::clone(&engine).run(detections_rx, cancel.clone()));

    let state = AppState::new(
        Arc::clone(&config),
        registry,
        slots,
        event_bus,
        assembler,
    );
    let app = a360_watcher::build_router(state);

    let addr = format!("{}:{}", config.event_host, config.event_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind event channel on {addr}"))?;
    info!("event channel: http://{addr}/events");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    // The watch loop and engine stop accepting new work immediately;
    // in-flight slot ingestions run to completion before exit.
    let _ = watch_task.await;
    let _ = engine_task.await;
    engine.shutdown().await;
    info!("a360-watcher stopped");

    Ok(())
}
