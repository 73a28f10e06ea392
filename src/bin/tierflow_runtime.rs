//! Tierflow Runtime - ingestion plus scheduled aggregation, delta and archival
//!
//! - Opens the SQLite hot store and applies the schema
//! - Wraps the filesystem cold store with timeouts and retries
//! - Reads newline-delimited JSON submissions from stdin (message-bus adapter)
//! - Runs every aggregation, delta and archival job on its cadence
//!
//! Usage:
//!   cargo run --release --bin tierflow_runtime < readings.jsonl
//!
//! Environment variables: see `TierflowConfig::from_env`

use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use tierflow::config::TierflowConfig;
use tierflow::pipeline::notify::{FanoutDispatcher, LogDispatcher, ThrottledDispatcher, WebhookDispatcher};
use tierflow::pipeline::{
    register_standard_jobs, start_ingestion, ArchivalMover, Clock, DeltaCalculator, IngestionGate,
    IntervalAggregator, MemoryDirectory, NotificationDispatcher, Scheduler, SqliteCalibration,
    SystemClock, TieredReader,
};
use tierflow::store::{ColdStore, FsColdStore, HotStore, ResilientColdStore, SqliteHotStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 Tierflow Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: ingestion + scheduled jobs");

    let config = TierflowConfig::from_env();

    if !config.enabled {
        info!("⚠️  Tierflow is DISABLED (set ENABLE_TIERFLOW=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    let delta_config = config.delta_config()?;
    let catalog = Arc::new(config.catalog());

    info!("✅ Tierflow ENABLED");
    info!("   ├─ Hot store: {}", config.db_path);
    info!("   ├─ Cold store: {}", config.cold_root);
    info!("   ├─ Staleness limit: {}s", config.staleness_secs);
    info!(
        "   ├─ Retention: readings {}s, buckets {}s, summaries {}s",
        config.reading_retention_secs, config.bucket_retention_secs, config.summary_retention_secs
    );
    info!("   ├─ Counters: {}", delta_config.counters.len());
    info!("   └─ Channel buffer: {} readings", config.channel_buffer);

    info!("🔧 Initializing stores...");
    let sqlite = SqliteHotStore::open(&config.db_path, &config.schema_dir)?;
    let calibration = Arc::new(SqliteCalibration::new(sqlite.connection()));
    let hot: Arc<dyn HotStore> = Arc::new(sqlite);
    let cold: Arc<dyn ColdStore> = Arc::new(ResilientColdStore::new(
        Arc::new(FsColdStore::new(&config.cold_root)?),
        config.retry_policy(),
    ));
    info!("✅ Stores ready ({} / {})", hot.backend_type(), cold.backend_type());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let directory = Arc::new(MemoryDirectory::new());
    let reader = TieredReader::new(hot.clone(), cold.clone());

    let mut channels: Vec<Arc<dyn NotificationDispatcher>> = vec![Arc::new(LogDispatcher)];
    if let Some(url) = &config.webhook_url {
        let webhook = WebhookDispatcher::new(url.clone())?;
        channels.push(Arc::new(ThrottledDispatcher::new(Arc::new(webhook))));
        info!("   └─ Exceedance webhook: {}", url);
    }
    let notifier = Arc::new(FanoutDispatcher::new(channels));

    let gate = Arc::new(IngestionGate::new(
        hot.clone(),
        catalog.readings.clone(),
        calibration,
        directory.clone(),
        notifier,
        clock.clone(),
        config.gate_config(),
    ));

    let aggregator = Arc::new(IntervalAggregator::new(
        hot.clone(),
        reader.clone(),
        catalog.clone(),
        directory.clone(),
        config.aggregator_config(),
    ));
    let calculator = Arc::new(DeltaCalculator::new(
        hot.clone(),
        reader,
        catalog.clone(),
        directory,
        delta_config,
    ));
    let mover = Arc::new(ArchivalMover::new(hot.clone(), cold));

    let mut scheduler = Scheduler::new(clock);
    register_standard_jobs(
        &mut scheduler,
        aggregator,
        calculator,
        mover,
        catalog,
        config.archive_every(),
    );
    info!("✅ Scheduler ready ({} jobs)", scheduler.len());

    info!("🚀 Spawning background tasks...");
    let (tx, rx) = mpsc::channel::<String>(config.channel_buffer);

    tokio::spawn(start_ingestion(rx, gate));
    info!("   ├─ ✅ Ingestion task spawned");

    let poll = std::time::Duration::from_millis(config.scheduler_poll_ms);
    tokio::spawn(scheduler.run_forever(poll));
    info!("   ├─ ✅ Scheduler task spawned (poll: {}ms)", config.scheduler_poll_ms);

    let stdin_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if stdin_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("📭 stdin closed, no more submissions");
                    break;
                }
                Err(e) => {
                    warn!("⚠️  Failed to read submission from stdin: {}", e);
                    break;
                }
            }
        }
    });
    info!("   └─ ✅ stdin reader spawned");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    drop(tx);

    // Give in-flight jobs time to finish
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    info!("✅ Tierflow runtime stopped");
    Ok(())
}
