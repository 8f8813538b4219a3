//! Aggregation engine - incremental rolling-window statistics
//!
//! ## Architecture
//!
//! ```text
//! AppointmentEvent
//!     ↓
//! AggregationEngine::apply()
//!     ├─ AppliedTable      (last applied version per appointment_id)
//!     ├─ cumulative        (all-time KPI accumulator, never expires)
//!     └─ BucketStore       (per-minute accumulators, bounded retention)
//!     ↓
//! QueryFacade (read lock / snapshot copies)
//! ```
//!
//! Every event either starts a new appointment or corrects an existing one.
//! A correction subtracts the previous contribution and adds the new one, so
//! a Scheduled → Completed transition moves one count between statuses and
//! never double-counts the appointment or its revenue.
//!
//! The engine is a derived cache. `rebuild()` reconstructs it by replaying the
//! latest persisted record of every appointment in timestamp order.
//!
//! The `AppliedTable` keeps one entry per distinct `appointment_id` ever seen
//! and is never pruned, so memory grows with the number of appointments. Bucket
//! retention does not bound it; restarting with a rebuild over a pruned store
//! is the way to reclaim it.

use super::state::{AppliedEntry, AppliedTable, Kpis};
use super::types::AppointmentEvent;
use super::windows::{Accumulator, AggregateWindow, BucketStore, Contribution, SeriesPoint, TimeRange, WindowMetric};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bucket width in seconds
    pub bucket_secs: i64,
    /// Number of buckets retained behind (and including) the newest one
    pub retention_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 60,
            retention_buckets: 60,
        }
    }
}

/// What `apply` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First version seen for this appointment
    Inserted,
    /// Replaced the previously applied version via delta correction
    Corrected,
    /// Same version and content as already applied
    Duplicate,
    /// Older than the applied version; ignored
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub inserted: u64,
    pub corrected: u64,
    pub duplicates: u64,
    pub stale: u64,
    /// Events whose bucket had already expired on arrival
    pub late_events: u64,
    /// Counters clamped at zero or saturated (should stay 0)
    pub clamps: u64,
    pub evicted_buckets: u64,
}

pub struct AggregationEngine {
    config: EngineConfig,
    buckets: BucketStore,
    applied: AppliedTable,
    cumulative: Accumulator,
    counters: EngineCounters,
}

impl AggregationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            buckets: BucketStore::new(config.bucket_secs, config.retention_buckets),
            applied: AppliedTable::new(),
            cumulative: Accumulator::default(),
            counters: EngineCounters::default(),
        }
    }

    /// Rebuild engine state from persisted records
    ///
    /// Records are replayed in timestamp order so retention evicts the same
    /// buckets it would have during live ingestion.
    pub fn rebuild<I>(config: EngineConfig, records: I) -> Self
    where
        I: IntoIterator<Item = AppointmentEvent>,
    {
        let mut events: Vec<_> = records.into_iter().collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.version.cmp(&b.version)));

        let mut engine = Self::new(config);
        for event in &events {
            engine.apply(event);
        }

        log::info!(
            "🔁 Rebuilt aggregates from {} records ({} appointments, {} buckets retained)",
            events.len(),
            engine.applied.len(),
            engine.buckets.len()
        );
        engine
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Apply one validated event
    ///
    /// Never fails: stale versions are ignored, late events only reach the
    /// cumulative state, and any counter that would underflow is clamped.
    pub fn apply(&mut self, event: &AppointmentEvent) -> ApplyOutcome {
        let contribution = Contribution::from(event);
        let bucket_start = self.buckets.bucket_start_for(event.timestamp);

        // Every event moves the watermark, even one that is later ignored, so
        // the retained buckets do not depend on arrival order
        self.counters.evicted_buckets += self.buckets.advance(bucket_start) as u64;

        let previous = self.applied.get(&event.appointment_id).cloned();

        let outcome = match previous {
            Some(prev) if event.version < prev.version => {
                log::debug!(
                    "⏭️  Stale version {} < {} for {}",
                    event.version,
                    prev.version,
                    event.appointment_id
                );
                self.counters.stale += 1;
                return ApplyOutcome::Stale;
            }
            Some(prev)
                if event.version == prev.version
                    && prev.contribution == contribution
                    && prev.bucket_start == bucket_start =>
            {
                self.counters.duplicates += 1;
                return ApplyOutcome::Duplicate;
            }
            Some(prev) => {
                self.retract(&prev);
                self.counters.corrected += 1;
                ApplyOutcome::Corrected
            }
            None => {
                self.counters.inserted += 1;
                ApplyOutcome::Inserted
            }
        };

        let clamps = self.cumulative.add(&contribution);
        self.counters.clamps += u64::from(clamps);
        let counted_in_bucket = self.place_in_bucket(bucket_start, &contribution, &event.appointment_id);

        self.applied.insert(
            event.appointment_id.clone(),
            AppliedEntry {
                version: event.version,
                contribution,
                bucket_start,
                counted_in_bucket,
            },
        );

        outcome
    }

    /// Undo a previously applied version
    fn retract(&mut self, prev: &AppliedEntry) {
        let mut clamps = self.cumulative.remove(&prev.contribution);

        if prev.counted_in_bucket {
            // An evicted bucket has nothing left to correct
            if let Some(window) = self.buckets.get_mut(prev.bucket_start) {
                clamps += window.totals.remove(&prev.contribution);
            }
            self.buckets.remove_if_empty(prev.bucket_start);
        }

        self.counters.clamps += u64::from(clamps);
    }

    fn place_in_bucket(&mut self, bucket_start: i64, contribution: &Contribution, appointment_id: &str) -> bool {
        match self.buckets.get_or_create(bucket_start) {
            Some(window) => {
                let clamps = window.totals.add(contribution);
                self.counters.clamps += u64::from(clamps);
                true
            }
            None => {
                self.counters.late_events += 1;
                log::debug!(
                    "🕰️  Late event for {}: bucket {} is past the retention horizon",
                    appointment_id,
                    bucket_start
                );
                false
            }
        }
    }

    /// Copy of the bucket containing `at`, if retained
    pub fn snapshot(&self, at: DateTime<Utc>) -> Option<AggregateWindow> {
        self.buckets.get(self.buckets.bucket_start_for(at)).cloned()
    }

    /// Copies of the retained buckets in `range`, oldest first
    pub fn buckets(&self, range: TimeRange) -> Vec<AggregateWindow> {
        self.buckets.range(range).cloned().collect()
    }

    pub fn series(&self, metric: WindowMetric, range: TimeRange) -> Vec<SeriesPoint> {
        self.buckets
            .range(range)
            .map(|window| SeriesPoint {
                bucket_start: window.bucket_start,
                value: metric.value(&window.totals),
            })
            .collect()
    }

    pub fn kpis(&self) -> Kpis {
        Kpis::from_accumulator(&self.cumulative)
    }

    pub fn cumulative(&self) -> &Accumulator {
        &self.cumulative
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn late_events(&self) -> u64 {
        self.counters.late_events
    }

    pub fn tracked_appointments(&self) -> usize {
        self.applied.len()
    }

    pub fn retained_buckets(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
