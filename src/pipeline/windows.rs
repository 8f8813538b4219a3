//! Time-bucketed accumulators for trend aggregation
//!
//! Buckets are fixed-width, aligned to the Unix epoch and keyed by their start
//! second. Retention is measured in event time: the newest bucket seen is the
//! watermark, and buckets more than `retention_buckets - 1` widths behind it
//! are evicted oldest-first.

use super::types::{AppointmentEvent, AppointmentStatus, PaymentMethod, Urgency};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// The part of an event that an accumulator counts
///
/// Kept per appointment in the engine's side-table so a later version can
/// subtract exactly what the earlier one added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub status: AppointmentStatus,
    pub urgency: Urgency,
    pub department: String,
    pub payment_method: PaymentMethod,
    pub cost_cents: i64,
    pub copay_cents: i64,
}

impl From<&AppointmentEvent> for Contribution {
    fn from(event: &AppointmentEvent) -> Self {
        Self {
            status: event.status,
            urgency: event.urgency,
            department: event.department.clone(),
            payment_method: event.payment_method,
            cost_cents: event.cost_cents,
            copay_cents: event.copay_cents,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentTotals {
    pub cost_cents: i64,
    pub copay_cents: i64,
    pub count: u64,
}

/// Counters for one bucket (or for the cumulative view)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    pub count: u64,
    pub revenue_cents: i64,
    pub copay_cents: i64,
    pub status_counts: BTreeMap<AppointmentStatus, u64>,
    pub status_revenue_cents: BTreeMap<AppointmentStatus, i64>,
    pub urgency_by_department: BTreeMap<(String, Urgency), u64>,
    pub payment: BTreeMap<PaymentMethod, PaymentTotals>,
}

impl Accumulator {
    /// Add one contribution
    ///
    /// Sums saturate instead of overflowing; each saturation is logged and
    /// counted in the returned clamp total.
    pub fn add(&mut self, c: &Contribution) -> u32 {
        let mut clamps = 0;

        clamps += increment_count(&mut self.count, "count");
        clamps += increment_amount(&mut self.revenue_cents, c.cost_cents, "revenue");
        clamps += increment_amount(&mut self.copay_cents, c.copay_cents, "copay");
        clamps += increment_count(self.status_counts.entry(c.status).or_insert(0), "status");
        clamps += increment_amount(
            self.status_revenue_cents.entry(c.status).or_insert(0),
            c.cost_cents,
            "status revenue",
        );
        clamps += increment_count(
            self.urgency_by_department
                .entry((c.department.clone(), c.urgency))
                .or_insert(0),
            "urgency/department",
        );

        let payment = self.payment.entry(c.payment_method).or_default();
        clamps += increment_amount(&mut payment.cost_cents, c.cost_cents, "payment cost");
        clamps += increment_amount(&mut payment.copay_cents, c.copay_cents, "payment copay");
        clamps += increment_count(&mut payment.count, "payment count");

        clamps
    }

    /// Subtract a previously added contribution
    ///
    /// Never fails. Any counter that would go below zero is clamped to zero and
    /// logged; the number of clamps is returned so the caller can count them.
    pub fn remove(&mut self, c: &Contribution) -> u32 {
        let mut clamps = 0;

        clamps += decrement_count(&mut self.count, "count");
        clamps += decrement_amount(&mut self.revenue_cents, c.cost_cents, "revenue");
        clamps += decrement_amount(&mut self.copay_cents, c.copay_cents, "copay");

        clamps += decrement_entry(&mut self.status_counts, &c.status, "status");
        if let Some(revenue) = self.status_revenue_cents.get_mut(&c.status) {
            clamps += decrement_amount(revenue, c.cost_cents, "status revenue");
            if *revenue == 0 && !self.status_counts.contains_key(&c.status) {
                self.status_revenue_cents.remove(&c.status);
            }
        } else {
            clamps += clamp("status revenue");
        }

        let key = (c.department.clone(), c.urgency);
        clamps += decrement_entry(&mut self.urgency_by_department, &key, "urgency/department");

        match self.payment.get_mut(&c.payment_method) {
            Some(totals) => {
                clamps += decrement_count(&mut totals.count, "payment count");
                clamps += decrement_amount(&mut totals.cost_cents, c.cost_cents, "payment cost");
                clamps += decrement_amount(&mut totals.copay_cents, c.copay_cents, "payment copay");
                if totals.count == 0 {
                    self.payment.remove(&c.payment_method);
                }
            }
            None => clamps += clamp("payment"),
        }

        clamps
    }

    pub fn status_count(&self, status: AppointmentStatus) -> u64 {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    /// `count == Σ status counts == Σ urgency×department counts`
    pub fn is_conserved(&self) -> bool {
        let by_status: u64 = self.status_counts.values().sum();
        let by_urgency: u64 = self.urgency_by_department.values().sum();
        let by_payment: u64 = self.payment.values().map(|p| p.count).sum();
        self.count == by_status && self.count == by_urgency && self.count == by_payment
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn clamp(what: &str) -> u32 {
    log::error!("❌ Aggregate invariant violated: {} would go below zero, clamped", what);
    1
}

fn saturate(what: &str) -> u32 {
    log::error!("❌ Aggregate overflow: {} saturated at its maximum", what);
    1
}

fn increment_count(value: &mut u64, what: &str) -> u32 {
    match value.checked_add(1) {
        Some(next) => {
            *value = next;
            0
        }
        None => saturate(what),
    }
}

fn increment_amount(value: &mut i64, amount: i64, what: &str) -> u32 {
    match value.checked_add(amount) {
        Some(next) => {
            *value = next;
            0
        }
        None => {
            *value = i64::MAX;
            saturate(what)
        }
    }
}

fn decrement_count(value: &mut u64, what: &str) -> u32 {
    if *value == 0 {
        return clamp(what);
    }
    *value -= 1;
    0
}

fn decrement_amount(value: &mut i64, amount: i64, what: &str) -> u32 {
    if *value < amount {
        *value = 0;
        return clamp(what);
    }
    *value -= amount;
    0
}

fn decrement_entry<K: Ord + Clone>(map: &mut BTreeMap<K, u64>, key: &K, what: &str) -> u32 {
    match map.get_mut(key) {
        Some(count) => {
            let clamps = decrement_count(count, what);
            if *count == 0 {
                map.remove(key);
            }
            clamps
        }
        None => clamp(what),
    }
}

/// One time bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateWindow {
    pub bucket_start: DateTime<Utc>,
    pub bucket_secs: i64,
    pub totals: Accumulator,
}

/// Value plotted per bucket by a window series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMetric {
    /// Appointments per bucket
    Appointments,
    /// Sum of cost, in dollars
    Revenue,
    AverageCost,
    /// Sum of copay, in dollars
    Copay,
    StatusCount(AppointmentStatus),
}

impl WindowMetric {
    pub fn value(&self, totals: &Accumulator) -> f64 {
        match self {
            WindowMetric::Appointments => totals.count as f64,
            WindowMetric::Revenue => totals.revenue_cents as f64 / 100.0,
            WindowMetric::AverageCost => {
                if totals.count == 0 {
                    0.0
                } else {
                    totals.revenue_cents as f64 / 100.0 / totals.count as f64
                }
            }
            WindowMetric::Copay => totals.copay_cents as f64 / 100.0,
            WindowMetric::StatusCount(status) => totals.status_count(*status) as f64,
        }
    }
}

/// Half-open range `[from, to)` over bucket starts; `None` bounds are open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from: Some(from), to: Some(to) }
    }

    fn contains(&self, start: i64) -> bool {
        self.from.map_or(true, |f| start >= f.timestamp()) && self.to.map_or(true, |t| start < t.timestamp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
}

/// Retained buckets, oldest first
#[derive(Debug, Clone)]
pub struct BucketStore {
    bucket_secs: i64,
    retention_buckets: usize,
    buckets: BTreeMap<i64, AggregateWindow>,
    watermark: Option<i64>,
}

impl BucketStore {
    pub fn new(bucket_secs: i64, retention_buckets: usize) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
            retention_buckets: retention_buckets.max(1),
            buckets: BTreeMap::new(),
            watermark: None,
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }

    pub fn bucket_start_for(&self, timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs
    }

    /// Earliest bucket start still inside the retention horizon
    pub fn horizon_start(&self) -> Option<i64> {
        let span = (self.retention_buckets as i64 - 1).saturating_mul(self.bucket_secs);
        self.watermark.map(|w| w.saturating_sub(span))
    }

    pub fn is_expired(&self, start: i64) -> bool {
        self.horizon_start().map_or(false, |h| start < h)
    }

    /// Move the watermark forward if `start` is newer; returns buckets evicted
    pub fn advance(&mut self, start: i64) -> usize {
        if self.watermark.map_or(false, |w| start <= w) {
            return 0;
        }
        self.watermark = Some(start);

        let Some(horizon) = self.horizon_start() else {
            return 0;
        };

        let retained = self.buckets.split_off(&horizon);
        let evicted = std::mem::replace(&mut self.buckets, retained);
        if !evicted.is_empty() {
            log::debug!("🧹 Evicted {} expired buckets (horizon {})", evicted.len(), horizon);
        }
        evicted.len()
    }

    /// Bucket at `start`, created on first use; `None` when expired
    pub fn get_or_create(&mut self, start: i64) -> Option<&mut AggregateWindow> {
        if self.is_expired(start) {
            return None;
        }
        let bucket_secs = self.bucket_secs;
        Some(self.buckets.entry(start).or_insert_with(|| AggregateWindow {
            bucket_start: epoch(start),
            bucket_secs,
            totals: Accumulator::default(),
        }))
    }

    /// Drop a bucket whose every appointment moved elsewhere
    pub fn remove_if_empty(&mut self, start: i64) {
        if self.buckets.get(&start).map_or(false, |w| w.totals.is_empty()) {
            self.buckets.remove(&start);
        }
    }

    pub fn get(&self, start: i64) -> Option<&AggregateWindow> {
        self.buckets.get(&start)
    }

    pub fn get_mut(&mut self, start: i64) -> Option<&mut AggregateWindow> {
        self.buckets.get_mut(&start)
    }

    pub fn range(&self, range: TimeRange) -> impl Iterator<Item = &AggregateWindow> + '_ {
        self.buckets
            .iter()
            .filter(move |(start, _)| range.contains(**start))
            .map(|(_, window)| window)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

pub(crate) fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(status: AppointmentStatus, department: &str, cost_cents: i64) -> Contribution {
        Contribution {
            status,
            urgency: Urgency::Medium,
            department: department.to_string(),
            payment_method: PaymentMethod::Insurance,
            cost_cents,
            copay_cents: 1_000,
        }
    }

    #[test]
    fn test_add_remove_is_exact() {
        let mut acc = Accumulator::default();
        let a = contribution(AppointmentStatus::Scheduled, "Cardiology", 10_000);
        let b = contribution(AppointmentStatus::Completed, "Oncology", 25_050);

        acc.add(&a);
        acc.add(&b);
        assert_eq!(acc.count, 2);
        assert_eq!(acc.revenue_cents, 35_050);
        assert!(acc.is_conserved());

        assert_eq!(acc.remove(&a), 0);
        assert_eq!(acc.count, 1);
        assert_eq!(acc.status_count(AppointmentStatus::Scheduled), 0);
        assert_eq!(acc.status_count(AppointmentStatus::Completed), 1);
        assert!(!acc.urgency_by_department.contains_key(&("Cardiology".to_string(), Urgency::Medium)));
        assert!(acc.is_conserved());

        assert_eq!(acc.remove(&b), 0);
        assert_eq!(acc, Accumulator::default());
    }

    #[test]
    fn test_remove_from_empty_clamps() {
        // Edge case: removing something never added must not underflow
        let mut acc = Accumulator::default();
        let clamps = acc.remove(&contribution(AppointmentStatus::Cancelled, "Radiology", 500));

        assert!(clamps > 0);
        assert_eq!(acc.count, 0);
        assert_eq!(acc.revenue_cents, 0);
        assert!(acc.status_counts.is_empty());
    }

    #[test]
    fn test_bucket_alignment() {
        let store = BucketStore::new(60, 10);
        let ts = epoch(1_700_000_039);
        assert_eq!(store.bucket_start_for(ts), 1_699_999_980);
        assert_eq!(store.bucket_start_for(epoch(1_699_999_980)), 1_699_999_980);
        // Pre-epoch timestamps still floor downwards
        assert_eq!(store.bucket_start_for(epoch(-1)), -60);
    }

    #[test]
    fn test_retention_evicts_oldest_first() {
        let mut store = BucketStore::new(60, 3);
        for start in [0, 60, 120] {
            store.advance(start);
            store.get_or_create(start).unwrap().totals.count = 1;
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.horizon_start(), Some(0));

        // Watermark moves to 180: bucket 0 falls out
        assert_eq!(store.advance(180), 1);
        assert!(store.get(0).is_none());
        assert!(store.is_expired(0));
        assert!(!store.is_expired(60));
        assert!(store.get_or_create(0).is_none());

        // Older starts never move the watermark back
        assert_eq!(store.advance(60), 0);
        assert_eq!(store.horizon_start(), Some(60));
    }

    #[test]
    fn test_range_and_metrics() {
        let mut store = BucketStore::new(60, 10);
        for (start, cents) in [(0, 1_000), (60, 2_000), (120, 3_000)] {
            store.advance(start);
            store
                .get_or_create(start)
                .unwrap()
                .totals
                .add(&contribution(AppointmentStatus::Completed, "Neurology", cents));
        }

        let selected: Vec<_> = store
            .range(TimeRange::between(epoch(60), epoch(120)))
            .map(|w| WindowMetric::Revenue.value(&w.totals))
            .collect();
        assert_eq!(selected, vec![20.0]);

        let all: Vec<_> = store.range(TimeRange::all()).map(|w| w.bucket_start).collect();
        assert_eq!(all, vec![epoch(0), epoch(60), epoch(120)]);

        let bucket = &store.get(120).unwrap().totals;
        assert_eq!(WindowMetric::Appointments.value(bucket), 1.0);
        assert_eq!(WindowMetric::AverageCost.value(bucket), 30.0);
        assert_eq!(WindowMetric::Copay.value(bucket), 10.0);
        assert_eq!(WindowMetric::StatusCount(AppointmentStatus::Completed).value(bucket), 1.0);
        assert_eq!(WindowMetric::AverageCost.value(&Accumulator::default()), 0.0);
    }
}
