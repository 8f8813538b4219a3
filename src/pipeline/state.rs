//! Per-appointment side-table and the cumulative views derived from it
//!
//! The side-table holds, for each appointment_id, only what the engine needs to
//! undo the last applied version: its version, its contribution and the bucket
//! it was counted in. Full event history is never kept here; the durable store
//! has the latest record if a rebuild is needed.

use super::types::{cents_to_dollars, AppointmentStatus, PaymentMethod, Urgency};
use super::windows::{Accumulator, Contribution};
use serde::Serialize;
use std::collections::HashMap;

/// What was last applied for one appointment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub version: i64,
    pub contribution: Contribution,
    /// Bucket start the event's timestamp maps to
    pub bucket_start: i64,
    /// False when the event arrived late and only reached cumulative state
    pub counted_in_bucket: bool,
}

/// Last applied version per appointment; grows with distinct ids
#[derive(Debug, Clone, Default)]
pub struct AppliedTable {
    entries: HashMap<String, AppliedEntry>,
}

impl AppliedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, appointment_id: &str) -> Option<&AppliedEntry> {
        self.entries.get(appointment_id)
    }

    pub fn insert(&mut self, appointment_id: String, entry: AppliedEntry) -> Option<AppliedEntry> {
        self.entries.insert(appointment_id, entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Headline numbers for the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Kpis {
    pub total: u64,
    pub total_cost: f64,
    pub avg_cost: f64,
    /// Percentage of appointments whose latest status is Completed (0-100)
    pub completion_rate: f64,
    pub avg_copay: f64,
}

impl Kpis {
    pub fn from_accumulator(acc: &Accumulator) -> Self {
        if acc.count == 0 {
            return Self::default();
        }

        let total = acc.count as f64;
        let completed = acc.status_count(AppointmentStatus::Completed) as f64;

        Self {
            total: acc.count,
            total_cost: cents_to_dollars(acc.revenue_cents),
            avg_cost: cents_to_dollars(acc.revenue_cents) / total,
            completion_rate: completed / total * 100.0,
            avg_copay: cents_to_dollars(acc.copay_cents) / total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMixEntry {
    pub status: AppointmentStatus,
    pub appointments: u64,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrgencyDepartmentEntry {
    pub department: String,
    pub urgency: Urgency,
    pub appointments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSummaryEntry {
    pub payment_method: PaymentMethod,
    pub avg_cost: f64,
    pub avg_copay: f64,
    pub volume: u64,
}

/// Per-status appointments and revenue, most appointments first
pub fn status_mix(acc: &Accumulator) -> Vec<StatusMixEntry> {
    let mut mix: Vec<_> = acc
        .status_counts
        .iter()
        .map(|(status, count)| StatusMixEntry {
            status: *status,
            appointments: *count,
            revenue: cents_to_dollars(acc.status_revenue_cents.get(status).copied().unwrap_or(0)),
        })
        .collect();
    mix.sort_by(|a, b| b.appointments.cmp(&a.appointments).then(a.status.cmp(&b.status)));
    mix
}

/// Appointments per (department, urgency), most appointments first
pub fn urgency_by_department(acc: &Accumulator) -> Vec<UrgencyDepartmentEntry> {
    let mut rows: Vec<_> = acc
        .urgency_by_department
        .iter()
        .map(|((department, urgency), count)| UrgencyDepartmentEntry {
            department: department.clone(),
            urgency: *urgency,
            appointments: *count,
        })
        .collect();
    rows.sort_by(|a, b| b.appointments.cmp(&a.appointments));
    rows
}

/// Average cost and copay per payment method, highest average cost first
pub fn payment_summary(acc: &Accumulator) -> Vec<PaymentSummaryEntry> {
    let mut rows: Vec<_> = acc
        .payment
        .iter()
        .filter(|(_, totals)| totals.count > 0)
        .map(|(method, totals)| PaymentSummaryEntry {
            payment_method: *method,
            avg_cost: cents_to_dollars(totals.cost_cents) / totals.count as f64,
            avg_copay: cents_to_dollars(totals.copay_cents) / totals.count as f64,
            volume: totals.count,
        })
        .collect();
    rows.sort_by(|a, b| b.avg_cost.total_cmp(&a.avg_cost));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(
        status: AppointmentStatus,
        department: &str,
        urgency: Urgency,
        payment_method: PaymentMethod,
        cost_cents: i64,
        copay_cents: i64,
    ) -> Contribution {
        Contribution {
            status,
            urgency,
            department: department.to_string(),
            payment_method,
            cost_cents,
            copay_cents,
        }
    }

    fn sample() -> Accumulator {
        let mut acc = Accumulator::default();
        acc.add(&contribution(AppointmentStatus::Completed, "Cardiology", Urgency::High, PaymentMethod::Insurance, 40_000, 2_000));
        acc.add(&contribution(AppointmentStatus::Completed, "Cardiology", Urgency::High, PaymentMethod::Medicare, 20_000, 1_000));
        acc.add(&contribution(AppointmentStatus::Cancelled, "Pediatrics", Urgency::Low, PaymentMethod::SelfPay, 10_000, 0));
        acc.add(&contribution(AppointmentStatus::Scheduled, "Pediatrics", Urgency::High, PaymentMethod::Insurance, 30_000, 3_000));
        acc
    }

    #[test]
    fn test_kpis_from_accumulator() {
        let kpis = Kpis::from_accumulator(&sample());

        assert_eq!(kpis.total, 4);
        assert_eq!(kpis.total_cost, 1_000.0);
        assert_eq!(kpis.avg_cost, 250.0);
        assert_eq!(kpis.completion_rate, 50.0);
        assert_eq!(kpis.avg_copay, 15.0);
    }

    #[test]
    fn test_kpis_empty_are_zero() {
        assert_eq!(Kpis::from_accumulator(&Accumulator::default()), Kpis::default());
    }

    #[test]
    fn test_mix_views_sorted() {
        let acc = sample();

        let mix = status_mix(&acc);
        assert_eq!(mix[0].status, AppointmentStatus::Completed);
        assert_eq!(mix[0].appointments, 2);
        assert_eq!(mix[0].revenue, 600.0);
        assert_eq!(mix.len(), 3);

        let urgency = urgency_by_department(&acc);
        assert_eq!(urgency[0].department, "Cardiology");
        assert_eq!(urgency[0].urgency, Urgency::High);
        assert_eq!(urgency[0].appointments, 2);
        assert_eq!(urgency.iter().map(|r| r.appointments).sum::<u64>(), 4);

        let payments = payment_summary(&acc);
        assert_eq!(payments[0].payment_method, PaymentMethod::Insurance);
        assert_eq!(payments[0].avg_cost, 350.0);
        assert_eq!(payments[0].avg_copay, 25.0);
        assert_eq!(payments[0].volume, 2);
        assert_eq!(payments.last().unwrap().payment_method, PaymentMethod::SelfPay);
    }

    #[test]
    fn test_applied_table_replaces_entry() {
        let mut table = AppliedTable::new();
        let first = AppliedEntry {
            version: 1,
            contribution: contribution(AppointmentStatus::Scheduled, "Oncology", Urgency::Low, PaymentMethod::Medicaid, 100, 0),
            bucket_start: 0,
            counted_in_bucket: true,
        };
        assert!(table.insert("x".to_string(), first.clone()).is_none());

        let second = AppliedEntry { version: 2, ..first.clone() };
        assert_eq!(table.insert("x".to_string(), second).unwrap(), first);
        assert_eq!(table.get("x").unwrap().version, 2);
        assert_eq!(table.len(), 1);
    }
}
