//! Operational counters and health, shared between the pipeline and readers

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineHealth {
    Starting,
    Healthy,
    /// Source unreachable; retrying without moving the offset
    Degraded,
    Stopped,
}

impl PipelineHealth {
    fn as_u8(self) -> u8 {
        match self {
            PipelineHealth::Starting => 0,
            PipelineHealth::Healthy => 1,
            PipelineHealth::Degraded => 2,
            PipelineHealth::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineHealth::Healthy,
            2 => PipelineHealth::Degraded,
            3 => PipelineHealth::Stopped,
            _ => PipelineHealth::Starting,
        }
    }
}

impl fmt::Display for PipelineHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineHealth::Starting => "starting",
            PipelineHealth::Healthy => "healthy",
            PipelineHealth::Degraded => "degraded",
            PipelineHealth::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    persisted: AtomicU64,
    stale_writes: AtomicU64,
    decode_failures: AtomicU64,
    dead_lettered: AtomicU64,
    source_errors: AtomicU64,
    sink_retries: AtomicU64,
    aggregation_clamps: AtomicU64,
    health: AtomicU8,
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub stale_writes: u64,
    pub decode_failures: u64,
    pub dead_lettered: u64,
    pub source_errors: u64,
    pub sink_retries: u64,
    pub aggregation_clamps: u64,
    pub health: PipelineHealth,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_write(&self) {
        self.stale_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_error(&self) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_retry(&self) {
        self.sink_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Engine clamps are cumulative inside the engine; mirror the latest total
    pub fn set_aggregation_clamps(&self, total: u64) {
        self.aggregation_clamps.store(total, Ordering::Relaxed);
    }

    pub fn set_health(&self, health: PipelineHealth) {
        let previous = PipelineHealth::from_u8(self.health.swap(health.as_u8(), Ordering::Relaxed));
        if previous != health {
            match health {
                PipelineHealth::Degraded => log::warn!("⚠️  Pipeline health: {} (was {})", health, previous),
                _ => log::info!("💓 Pipeline health: {} (was {})", health, previous),
            }
        }
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            aggregation_clamps: self.aggregation_clamps.load(Ordering::Relaxed),
            health: self.health(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_health() {
        let stats = PipelineStats::new();
        assert_eq!(stats.health(), PipelineHealth::Starting);

        stats.record_received();
        stats.record_received();
        stats.record_decode_failure();
        stats.record_dead_letter();
        stats.set_aggregation_clamps(3);
        stats.set_health(PipelineHealth::Degraded);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.decode_failures, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.aggregation_clamps, 3);
        assert_eq!(snap.health, PipelineHealth::Degraded);

        stats.set_health(PipelineHealth::Healthy);
        assert_eq!(stats.health().to_string(), "healthy");
    }
}
