//! Read-only facade for the visualization layer
//!
//! Aggregate reads take the engine's read lock for the duration of one clone
//! or one small computation; record reads go to the store's reader connection.
//! Nothing here can block ingestion for longer than that.

use super::db::AppointmentStore;
use super::engine::AggregationEngine;
use super::error::SinkError;
use super::state::{
    payment_summary, status_mix, urgency_by_department, Kpis, PaymentSummaryEntry, StatusMixEntry,
    UrgencyDepartmentEntry,
};
use super::stats::{PipelineHealth, PipelineStats, StatsSnapshot};
use super::types::{AppointmentStatus, PersistedRecord};
use super::windows::{AggregateWindow, SeriesPoint, TimeRange, WindowMetric};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Engine handle shared between ingestion (writer) and the facade (readers)
pub type SharedEngine = Arc<RwLock<AggregationEngine>>;

#[derive(Clone)]
pub struct QueryFacade {
    engine: SharedEngine,
    store: Arc<dyn AppointmentStore>,
    stats: Arc<PipelineStats>,
}

impl QueryFacade {
    pub fn new(engine: SharedEngine, store: Arc<dyn AppointmentStore>, stats: Arc<PipelineStats>) -> Self {
        Self { engine, store, stats }
    }

    fn engine(&self) -> RwLockReadGuard<'_, AggregationEngine> {
        // A panicked writer leaves the last consistent-enough state behind; keep serving it
        self.engine.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cumulative KPIs
    pub fn get_kpis(&self) -> Kpis {
        self.engine().kpis()
    }

    /// `(bucket_start, value)` for every retained bucket in `range`, oldest first
    pub fn get_window_series(&self, metric: WindowMetric, range: TimeRange) -> Vec<SeriesPoint> {
        self.engine().series(metric, range)
    }

    pub fn get_bucket(&self, at: DateTime<Utc>) -> Option<AggregateWindow> {
        self.engine().snapshot(at)
    }

    pub fn get_buckets(&self, range: TimeRange) -> Vec<AggregateWindow> {
        self.engine().buckets(range)
    }

    /// `n` most recent persisted records, newest first
    pub async fn get_latest(&self, n: usize) -> Result<Vec<PersistedRecord>, SinkError> {
        self.store.latest(n, None).await
    }

    pub async fn latest_by_status(
        &self,
        n: usize,
        status: AppointmentStatus,
    ) -> Result<Vec<PersistedRecord>, SinkError> {
        self.store.latest(n, Some(status)).await
    }

    pub fn status_mix(&self) -> Vec<StatusMixEntry> {
        status_mix(self.engine().cumulative())
    }

    pub fn urgency_by_department(&self) -> Vec<UrgencyDepartmentEntry> {
        urgency_by_department(self.engine().cumulative())
    }

    pub fn payment_summary(&self) -> Vec<PaymentSummaryEntry> {
        payment_summary(self.engine().cumulative())
    }

    pub fn late_events(&self) -> u64 {
        self.engine().late_events()
    }

    pub fn health(&self) -> PipelineHealth {
        self.stats.health()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::SqliteAppointmentStore;
    use crate::pipeline::engine::EngineConfig;
    use crate::pipeline::types::{AppointmentEvent, PaymentMethod, Urgency};
    use crate::pipeline::windows::epoch;

    fn event(id: &str, version: i64, status: AppointmentStatus, ts: i64, cost_cents: i64) -> AppointmentEvent {
        AppointmentEvent {
            appointment_id: id.to_string(),
            version,
            status,
            department: "Neurology".to_string(),
            urgency: Urgency::Critical,
            cost_cents,
            copay_cents: cost_cents / 10,
            timestamp: epoch(ts),
            city: "Chicago".to_string(),
            payment_method: PaymentMethod::Insurance,
        }
    }

    #[tokio::test]
    async fn test_facade_reads_engine_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteAppointmentStore::open(dir.path().join("q.db")).unwrap());
        let engine: SharedEngine = Arc::new(RwLock::new(AggregationEngine::new(EngineConfig::default())));
        let stats = Arc::new(PipelineStats::new());
        let facade = QueryFacade::new(engine.clone(), store.clone(), stats.clone());

        let events = [
            event("a", 1, AppointmentStatus::Scheduled, 1_700_000_000, 10_000),
            event("b", 1, AppointmentStatus::Completed, 1_700_000_030, 30_000),
            event("a", 2, AppointmentStatus::Completed, 1_700_000_090, 10_000),
        ];
        for e in &events {
            store.upsert(e).await.unwrap();
            engine.write().unwrap().apply(e);
        }

        let kpis = facade.get_kpis();
        assert_eq!(kpis.total, 2);
        assert_eq!(kpis.completion_rate, 100.0);
        assert_eq!(kpis.total_cost, 400.0);

        let series = facade.get_window_series(WindowMetric::Appointments, TimeRange::all());
        assert_eq!(series.len(), 2);
        assert_eq!(series.iter().map(|p| p.value).sum::<f64>(), 2.0);
        assert!(series[0].bucket_start < series[1].bucket_start);

        let latest = facade.get_latest(1).await.unwrap();
        assert_eq!(latest[0].event.appointment_id, "a");
        assert!(facade.latest_by_status(5, AppointmentStatus::Scheduled).await.unwrap().is_empty());

        assert_eq!(facade.status_mix()[0].appointments, 2);
        assert_eq!(facade.payment_summary()[0].volume, 2);
        assert_eq!(facade.late_events(), 0);
        assert_eq!(facade.health(), PipelineHealth::Starting);
    }
}
