//! Pipeline ingestion - source reader plus the unified processing loop
//!
//! ```text
//! EventSource ──reader task──► mpsc ──► decode ──┬─► store.upsert (retry/backoff)
//!                                                └─► engine.apply
//!                                                        │ join
//!                                                        ▼
//!                                                  Checkpointer
//! ```
//!
//! Shutdown: the reader stops polling and drops its sender; the loop drains
//! whatever is still buffered, commits the final checkpoint and returns.

use super::checkpoint::Checkpointer;
use super::config::PipelineConfig;
use super::db::{AppointmentStore, UpsertOutcome};
use super::dead_letter::{DeadLetter, DeadLetterKind, DeadLetterSink};
use super::decoder::decode;
use super::engine::{AggregationEngine, ApplyOutcome};
use super::error::{PipelineError, SinkError};
use super::query::SharedEngine;
use super::retry::ExponentialBackoff;
use super::source::EventSource;
use super::stats::{PipelineHealth, PipelineStats};
use super::types::{AppointmentEvent, SourceRecord};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Summary returned when the pipeline stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub processed: u64,
    pub committed_offset: u64,
    /// Offset of the first record the sink could not persist, if any
    pub held_at: Option<u64>,
}

/// Everything one partition's pipeline needs
pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn EventSource>,
    store: Arc<dyn AppointmentStore>,
    engine: SharedEngine,
    checkpointer: Checkpointer,
    dead_letters: Box<dyn DeadLetterSink>,
    stats: Arc<PipelineStats>,
}

/// Running pipeline; dropping it does not stop the task
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<PipelineReport, PipelineError>>,
}

impl PipelineHandle {
    /// Ask the reader to stop; buffered records are still processed
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Graceful shutdown: stop reading, drain, commit, wait
    pub async fn shutdown(self) -> Result<PipelineReport, PipelineError> {
        self.request_shutdown();
        self.join().await
    }

    pub async fn join(self) -> Result<PipelineReport, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Replay the durable store into a fresh engine
pub async fn rebuild_engine(
    store: &dyn AppointmentStore,
    config: &PipelineConfig,
) -> Result<AggregationEngine, SinkError> {
    let records = store.scan_all().await?;
    Ok(AggregationEngine::rebuild(
        config.engine_config(),
        records.into_iter().map(|r| r.event),
    ))
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn EventSource>,
        store: Arc<dyn AppointmentStore>,
        engine: SharedEngine,
        checkpointer: Checkpointer,
        dead_letters: Box<dyn DeadLetterSink>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            engine,
            checkpointer,
            dead_letters,
            stats,
        }
    }

    /// Run on the current runtime and return a handle for shutdown
    pub fn spawn(self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        PipelineHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<PipelineReport, PipelineError> {
        let Pipeline {
            config,
            source,
            store,
            engine,
            checkpointer,
            dead_letters,
            stats,
        } = self;

        let (tx, rx) = mpsc::channel(config.channel_buffer);

        log::info!("🚀 Starting appointment pipeline");
        log::info!("   ├─ Source: {}", source.describe());
        log::info!("   ├─ Resume offset: {}", checkpointer.resume_offset());
        log::info!("   ├─ Dead letters: {}", dead_letters.backend_type());
        log::info!("   └─ Flush interval: {}ms", config.flush_interval_ms);

        let reader = tokio::spawn(read_source(
            source,
            tx,
            shutdown,
            stats.clone(),
            checkpointer.resume_offset(),
            config.clone(),
        ));

        let mut ingestion = Ingestion {
            config,
            store,
            engine,
            checkpointer,
            dead_letters,
            stats,
            processed: 0,
            dead_lettered: 0,
        };
        let result = ingestion.consume(rx).await;

        reader.await.map_err(|e| PipelineError::Task(e.to_string()))?;
        result
    }
}

/// Poll the source into the channel until shutdown
///
/// Source failures never end the task: they are retried with an unbounded
/// backoff while health reports Degraded, and the offset does not move.
async fn read_source(
    mut source: Box<dyn EventSource>,
    tx: mpsc::Sender<SourceRecord>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<PipelineStats>,
    start_offset: u64,
    config: PipelineConfig,
) {
    let poll_timeout = config.poll_timeout();
    let mut backoff = ExponentialBackoff::unbounded(
        Duration::from_millis(config.source_retry_initial_ms),
        Duration::from_millis(config.source_retry_max_ms),
    );

    match source.seek(start_offset).await {
        Ok(()) => stats.set_health(PipelineHealth::Healthy),
        Err(e) => {
            // The next poll reopens at the same offset
            log::error!("❌ Source seek to {} failed: {}", start_offset, e);
            stats.record_source_error();
            stats.set_health(PipelineHealth::Degraded);
        }
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            polled = source.poll(poll_timeout) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                backoff.reset();
                stats.set_health(PipelineHealth::Healthy);
                if tx.send(record).await.is_err() {
                    log::warn!("⚠️  Ingestion channel closed, stopping source reader");
                    break;
                }
            }
            Ok(None) => {
                backoff.reset();
                stats.set_health(PipelineHealth::Healthy);
            }
            Err(e) => {
                stats.record_source_error();
                stats.set_health(PipelineHealth::Degraded);
                log::error!("❌ Source unavailable ({}): {}", source.describe(), e);

                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = backoff.sleep() => {}
                }
            }
        }
    }

    log::info!("🛑 Source reader stopped ({})", source.describe());
}

/// State owned by the processing loop
struct Ingestion {
    config: PipelineConfig,
    store: Arc<dyn AppointmentStore>,
    engine: SharedEngine,
    checkpointer: Checkpointer,
    dead_letters: Box<dyn DeadLetterSink>,
    stats: Arc<PipelineStats>,
    processed: u64,
    dead_lettered: u64,
}

impl Ingestion {
    async fn consume(&mut self, mut rx: mpsc::Receiver<SourceRecord>) -> Result<PipelineReport, PipelineError> {
        let mut flush_timer = interval(self.config.flush_interval());
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let channel_capacity = self.config.channel_buffer;

        let mut window_count = 0u64;
        let mut last_log_time = Instant::now();

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(record) = received else {
                        // Reader gone and channel drained
                        break;
                    };

                    self.process(record).await;
                    window_count += 1;

                    // Log throughput every 10 seconds
                    if last_log_time.elapsed().as_secs() >= 10 {
                        let per_sec = window_count as f64 / last_log_time.elapsed().as_secs_f64();
                        log::info!("📊 Ingestion rate: {:.1} events/sec (total: {})", per_sec, self.processed);
                        last_log_time = Instant::now();
                        window_count = 0;
                    }
                }

                _ = flush_timer.tick() => {
                    self.flush().await;

                    let channel_usage = rx.len();
                    if channel_usage > channel_capacity / 2 {
                        log::warn!(
                            "⚠️  Channel usage high: {}/{} ({}%)",
                            channel_usage,
                            channel_capacity,
                            (channel_usage * 100) / channel_capacity.max(1)
                        );
                    } else {
                        log::debug!("   └─ Channel: {}/{}", channel_usage, channel_capacity);
                    }
                }
            }
        }

        log::info!("🔄 Channel closed, performing final flush...");

        if let Err(e) = self.dead_letters.flush().await {
            log::error!("❌ Failed to flush dead letters: {}", e);
        }
        let final_commit = self.checkpointer.commit().await;
        self.stats.set_health(PipelineHealth::Stopped);
        final_commit?;

        let report = PipelineReport {
            processed: self.processed,
            committed_offset: self.checkpointer.committed(),
            held_at: self.checkpointer.held_at(),
        };

        log::info!("✅ Pipeline stopped");
        log::info!("   ├─ Processed: {}", report.processed);
        log::info!("   ├─ Dead-lettered: {}", self.dead_lettered);
        log::info!("   └─ Committed offset: {}", report.committed_offset);

        Ok(report)
    }

    /// Decode, fan out to sink and engine, then acknowledge
    async fn process(&mut self, record: SourceRecord) {
        self.stats.record_received();
        self.processed += 1;

        match decode(&record.payload) {
            Err(e) => {
                self.stats.record_decode_failure();
                self.dead_letter(DeadLetter::new(
                    &record.payload,
                    e.to_string(),
                    DeadLetterKind::Decode,
                    record.position,
                ))
                .await;
            }
            Ok(event) => {
                let store = self.store.clone();
                let engine = self.engine.clone();
                let sink = persist_with_retry(store.as_ref(), &event, &self.config, &self.stats);
                let aggregate = async { apply_to_engine(&engine, &event) };

                let (persisted, (applied, clamps)) = tokio::join!(sink, aggregate);
                self.stats.set_aggregation_clamps(clamps);

                match persisted {
                    Ok(UpsertOutcome::Stale) => {
                        self.stats.record_stale_write();
                        log::debug!(
                            "↩️  Stale write ignored: {} v{} at {}",
                            event.appointment_id,
                            event.version,
                            record.position
                        );
                    }
                    Ok(_) => self.stats.record_persisted(),
                    Err(e) => {
                        self.checkpointer.hold(record.position.offset);
                        self.dead_letter(DeadLetter::new(
                            &record.payload,
                            e.to_string(),
                            DeadLetterKind::Sink,
                            record.position,
                        ))
                        .await;
                    }
                }

                if applied == ApplyOutcome::Stale {
                    log::debug!("↩️  Engine ignored stale {} v{}", event.appointment_id, event.version);
                }
            }
        }

        if self.checkpointer.ack(record.next_offset) {
            self.commit().await;
        }
    }

    async fn dead_letter(&mut self, letter: DeadLetter) {
        self.stats.record_dead_letter();
        self.dead_lettered += 1;

        log::warn!(
            "☠️  Dead-lettered record at {}/{}: {} | payload: {}",
            letter.partition,
            letter.offset,
            letter.reason,
            letter.raw_payload
        );

        if let Err(e) = self.dead_letters.write(&letter).await {
            log::error!("❌ Failed to write dead letter ({}): {}", self.dead_letters.backend_type(), e);
        }
    }

    async fn commit(&mut self) {
        if let Err(e) = self.checkpointer.commit().await {
            // Progress stays acknowledged in memory; the next commit retries
            log::error!("❌ Checkpoint commit failed: {}", e);
        }
    }

    async fn flush(&mut self) {
        let flush_start = Instant::now();

        self.commit().await;
        if let Err(e) = self.dead_letters.flush().await {
            log::error!("❌ Failed to flush dead letters: {}", e);
        }

        let late_events = match self.engine.read() {
            Ok(engine) => engine.late_events(),
            Err(poisoned) => poisoned.into_inner().late_events(),
        };

        log::info!(
            "📊 Flush complete: {} processed, {} dead-lettered, {} late | offset {} | {}ms",
            self.processed,
            self.dead_lettered,
            late_events,
            self.checkpointer.committed(),
            flush_start.elapsed().as_millis()
        );
    }
}

/// Upsert with bounded retry on transient failures
async fn persist_with_retry(
    store: &dyn AppointmentStore,
    event: &AppointmentEvent,
    config: &PipelineConfig,
    stats: &PipelineStats,
) -> Result<UpsertOutcome, SinkError> {
    let mut backoff = ExponentialBackoff::new(
        Duration::from_millis(config.sink_retry_initial_ms),
        Duration::from_millis(config.sink_retry_max_ms),
        config.sink_max_retries,
    );

    loop {
        match store.upsert(event).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  Sink write for {} failed: {}", event.appointment_id, e);
                if backoff.sleep().await.is_err() {
                    log::error!(
                        "❌ Giving up on {} after {} retries",
                        event.appointment_id,
                        backoff.attempts()
                    );
                    return Err(e);
                }
                stats.record_sink_retry();
            }
            Err(e) => {
                log::error!("❌ Sink write for {} failed permanently: {}", event.appointment_id, e);
                return Err(e);
            }
        }
    }
}

/// Apply under the write lock; returns the outcome and the engine's clamp total
fn apply_to_engine(engine: &SharedEngine, event: &AppointmentEvent) -> (ApplyOutcome, u64) {
    let mut guard = match engine.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let outcome = guard.apply(event);
    (outcome, guard.counters().clamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checkpoint::MemoryCheckpointStore;
    use crate::pipeline::db::SqliteAppointmentStore;
    use crate::pipeline::dead_letter::MemoryDeadLetterSink;
    use crate::pipeline::source::MemorySource;
    use std::sync::RwLock;
    use tempfile::TempDir;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            channel_buffer: 16,
            poll_timeout_ms: 10,
            source_retry_initial_ms: 1,
            source_retry_max_ms: 5,
            sink_retry_initial_ms: 1,
            sink_retry_max_ms: 2,
            flush_interval_ms: 50,
            checkpoint_every: 2,
            ..PipelineConfig::default()
        }
    }

    fn record(id: &str, status: &str, version: i64) -> String {
        format!(
            r#"{{"appointment_id":"{}","status":"{}","department":"Cardiology","urgency":"High","cost":120.50,"copay":20.00,"timestamp":"2024-05-01T10:15:30","city":"Boston","payment_method":"Insurance","version":{}}}"#,
            id, status, version
        )
    }

    async fn wait_for_offset(store: &MemoryCheckpointStore, offset: u64) {
        for _ in 0..200 {
            if store.history().last().map_or(false, |o| *o >= offset) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct Harness {
        _dir: TempDir,
        source: MemorySource,
        store: Arc<SqliteAppointmentStore>,
        engine: SharedEngine,
        checkpoints: MemoryCheckpointStore,
        dead_letters: MemoryDeadLetterSink,
        stats: Arc<PipelineStats>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(SqliteAppointmentStore::open(dir.path().join("ingest.db")).unwrap());
            Self {
                _dir: dir,
                source: MemorySource::new(0),
                store,
                engine: Arc::new(RwLock::new(AggregationEngine::default())),
                checkpoints: MemoryCheckpointStore::new(),
                dead_letters: MemoryDeadLetterSink::new(),
                stats: Arc::new(PipelineStats::new()),
            }
        }

        async fn spawn(&self) -> PipelineHandle {
            let checkpointer = Checkpointer::resume(Arc::new(self.checkpoints.clone()), "appointments", 0, 2)
                .await
                .unwrap();
            Pipeline::new(
                test_config(),
                Box::new(self.source.clone()),
                self.store.clone(),
                self.engine.clone(),
                checkpointer,
                Box::new(self.dead_letters.clone()),
                self.stats.clone(),
            )
            .spawn()
        }
    }

    #[tokio::test]
    async fn test_ingestion_processes_events() {
        // Test: Records flow through decode into both store and engine
        let harness = Harness::new();
        harness.source.push(record("a1", "Scheduled", 1));
        harness.source.push(record("a2", "Completed", 1));
        harness.source.push(record("a1", "Completed", 2));

        let handle = harness.spawn().await;
        wait_for_offset(&harness.checkpoints, 3).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.committed_offset, 3);
        assert_eq!(report.held_at, None);

        let kpis = harness.engine.read().unwrap().kpis();
        assert_eq!(kpis.total, 2);
        assert_eq!(kpis.completion_rate, 100.0);
        assert_eq!(harness.store.count().await.unwrap(), 2);
        assert_eq!(harness.stats.health(), PipelineHealth::Stopped);
    }

    #[tokio::test]
    async fn test_decode_failure_is_dead_lettered_and_skipped() {
        // Test: A malformed record does not stall the stream
        let harness = Harness::new();
        harness.source.push("{not json");
        harness.source.push(record("b1", "Scheduled", 1));

        let handle = harness.spawn().await;
        wait_for_offset(&harness.checkpoints, 2).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.committed_offset, 2);
        let letters = harness.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, DeadLetterKind::Decode);
        assert_eq!(letters[0].raw_payload, "{not json");
        assert_eq!(harness.store.count().await.unwrap(), 1);
        assert_eq!(harness.stats.snapshot().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_source_outage_degrades_then_recovers() {
        // Test: Source errors are retried without losing records
        let harness = Harness::new();
        harness.source.fail_next_poll("broker down");
        harness.source.fail_next_poll("broker still down");
        harness.source.push(record("c1", "Scheduled", 1));

        let handle = harness.spawn().await;
        wait_for_offset(&harness.checkpoints, 1).await;
        let report = handle.shutdown().await.unwrap();

        assert_eq!(report.committed_offset, 1);
        assert_eq!(harness.stats.snapshot().source_errors, 2);
        assert_eq!(harness.store.count().await.unwrap(), 1);
    }
}
