//! Pipeline Runtime
//!
//! Orchestrates the appointment pipeline:
//! - Opens the SQLite store (schema is created if missing)
//! - Rebuilds aggregates from the store
//! - Resumes the JSONL source from the committed checkpoint
//! - Logs a facade report periodically
//! - Shuts down gracefully on CTRL+C (drain, final checkpoint)
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables (see `PipelineConfig::from_env`):
//!   CLINICFLOW_DB_PATH - SQLite database path (default: data/clinicflow.db)
//!   APPOINTMENTS_SOURCE_PATH - JSONL stream (default: streams/appointments.jsonl)
//!   DEAD_LETTER_PATH - Dead letters (default: streams/dead_letter.jsonl)
//!   BUCKET_SECS / RETENTION_BUCKETS - Window granularity and retention

use clinicflow::pipeline::{
    rebuild_engine, AggregationEngine, AppointmentStore, Checkpointer, JsonlDeadLetterWriter,
    JsonlFileSource, Pipeline, PipelineConfig, PipelineStats, QueryFacade, SqliteAppointmentStore,
    SqliteCheckpointStore, TimeRange, WindowMetric,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::{Arc, RwLock};
use tokio::time::{interval, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Clinicflow Pipeline Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Source: {} ({}/{})", config.source_path, config.source_name, config.partition);
    info!("   ├─ Dead letters: {}", config.dead_letter_path);
    info!("   ├─ Channel buffer: {} records", config.channel_buffer);
    info!("   ├─ Buckets: {}s x {}", config.bucket_secs, config.retention_buckets);
    info!(
        "   ├─ Sink retries: {} ({}ms..{}ms)",
        config.sink_max_retries, config.sink_retry_initial_ms, config.sink_retry_max_ms
    );
    info!("   ├─ Checkpoint every: {} records", config.checkpoint_every);
    info!("   └─ Flush interval: {}ms", config.flush_interval_ms);

    // Initialize database
    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteAppointmentStore::open(&config.db_path)?);
    let checkpoints = Arc::new(SqliteCheckpointStore::new(store.connection()));
    info!("✅ Database initialized ({} appointments)", store.count().await?);

    // Rebuild the derived aggregates before consuming anything new
    let engine = if config.rebuild_on_start {
        rebuild_engine(store.as_ref(), &config).await?
    } else {
        warn!("⚠️  REBUILD_ON_START=false: aggregates start empty");
        AggregationEngine::new(config.engine_config())
    };
    let engine = Arc::new(RwLock::new(engine));

    let stats = Arc::new(PipelineStats::new());
    let checkpointer = Checkpointer::resume(
        checkpoints,
        config.source_name.clone(),
        config.partition,
        config.checkpoint_every,
    )
    .await?;

    let source = JsonlFileSource::new(&config.source_path, config.partition);
    let dead_letters = JsonlDeadLetterWriter::new(&config.dead_letter_path)?;

    let facade = QueryFacade::new(engine.clone(), store.clone(), stats.clone());

    let handle = Pipeline::new(
        config.clone(),
        Box::new(source),
        store.clone(),
        engine,
        checkpointer,
        Box::new(dead_letters),
        stats,
    )
    .spawn();

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let mut report_timer = interval(Duration::from_secs(config.report_interval_secs.max(1)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("");
                        info!("⚠️  Received CTRL+C, shutting down...");
                    }
                    Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
                }
                break;
            }
            _ = report_timer.tick() => {
                log_report(&facade).await;
                if handle.is_finished() {
                    warn!("⚠️  Pipeline task exited on its own");
                    break;
                }
            }
        }
    }

    let report = handle.shutdown().await?;
    log_report(&facade).await;

    info!("✅ Pipeline runtime stopped");
    info!("   ├─ Processed: {}", report.processed);
    info!("   ├─ Committed offset: {}", report.committed_offset);
    match report.held_at {
        Some(offset) => warn!("   └─ Checkpoint held at {} (replayed on next start)", offset),
        None => info!("   └─ Checkpoint not held"),
    }
    Ok(())
}

async fn log_report(facade: &QueryFacade) {
    let kpis = facade.get_kpis();
    let stats = facade.stats();

    info!("📊 Pipeline Status: {}", facade.health());
    info!(
        "   ├─ KPIs: {} appointments | ${:.2} total | ${:.2} avg | {:.1}% completed | ${:.2} avg copay",
        kpis.total, kpis.total_cost, kpis.avg_cost, kpis.completion_rate, kpis.avg_copay
    );
    info!(
        "   ├─ Events: {} received | {} persisted | {} stale | {} dead-lettered | {} late",
        stats.received,
        stats.persisted,
        stats.stale_writes,
        stats.dead_lettered,
        facade.late_events()
    );

    if let Some(point) = facade
        .get_window_series(WindowMetric::Appointments, TimeRange::all())
        .last()
    {
        info!("   ├─ Latest bucket {}: {} appointments", point.bucket_start, point.value);
    }

    match facade.get_latest(1).await {
        Ok(latest) => match latest.first() {
            Some(record) => info!(
                "   └─ Most recent: {} {} ({})",
                record.event.appointment_id, record.event.status, record.event.timestamp
            ),
            None => info!("   └─ Most recent: none"),
        },
        Err(e) => error!("   └─ ❌ Failed to read latest records: {}", e),
    }
}
