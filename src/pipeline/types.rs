//! Core appointment types shared by every pipeline stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an appointment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    #[serde(rename = "No-Show")]
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "Scheduled",
            AppointmentStatus::Completed => "Completed",
            AppointmentStatus::Cancelled => "Cancelled",
            AppointmentStatus::NoShow => "No-Show",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Scheduled" => Some(AppointmentStatus::Scheduled),
            "Completed" => Some(AppointmentStatus::Completed),
            "Cancelled" => Some(AppointmentStatus::Cancelled),
            "No-Show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    pub fn all() -> [AppointmentStatus; 4] {
        [
            AppointmentStatus::Scheduled,
            AppointmentStatus::Completed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::NoShow,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "Low",
            Urgency::Medium => "Medium",
            Urgency::High => "High",
            Urgency::Critical => "Critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Low" => Some(Urgency::Low),
            "Medium" => Some(Urgency::Medium),
            "High" => Some(Urgency::High),
            "Critical" => Some(Urgency::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PaymentMethod {
    Insurance,
    #[serde(rename = "Self-Pay")]
    SelfPay,
    Medicare,
    Medicaid,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Insurance => "Insurance",
            PaymentMethod::SelfPay => "Self-Pay",
            PaymentMethod::Medicare => "Medicare",
            PaymentMethod::Medicaid => "Medicaid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Insurance" => Some(PaymentMethod::Insurance),
            "Self-Pay" => Some(PaymentMethod::SelfPay),
            "Medicare" => Some(PaymentMethod::Medicare),
            "Medicaid" => Some(PaymentMethod::Medicaid),
            _ => None,
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Convert integer cents to dollars for display and averages
pub fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// A validated appointment event
///
/// Amounts are integer cents so that aggregate corrections subtract exactly
/// what was previously added. `version` orders successive updates of the same
/// `appointment_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentEvent {
    pub appointment_id: String,
    pub version: i64,
    pub status: AppointmentStatus,
    pub department: String,
    pub urgency: Urgency,
    pub cost_cents: i64,
    pub copay_cents: i64,
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub payment_method: PaymentMethod,
}

impl AppointmentEvent {
    pub fn cost(&self) -> f64 {
        cents_to_dollars(self.cost_cents)
    }

    pub fn copay(&self) -> f64 {
        cents_to_dollars(self.copay_cents)
    }
}

/// An event as stored in the durable store, plus storage metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub event: AppointmentEvent,
    /// First successful upsert of this appointment_id
    pub inserted_at: DateTime<Utc>,
    /// Last replacement (equals `inserted_at` until the record is updated)
    pub updated_at: DateTime<Utc>,
}

/// Broker-assigned position within one partition
///
/// Only used for resume-on-restart. `offset` follows the consumer-group
/// convention: a committed offset names the next record to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub partition: u32,
    pub offset: u64,
}

impl StreamPosition {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Raw record handed out by an event source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Position of this record
    pub position: StreamPosition,
    /// Offset to commit once this record is fully processed
    pub next_offset: u64,
    pub payload: Vec<u8>,
}

impl SourceRecord {
    pub fn next_position(&self) -> StreamPosition {
        StreamPosition::new(self.position.partition, self.next_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_wire_names_round_trip() {
        for status in AppointmentStatus::all() {
            assert_eq!(AppointmentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AppointmentStatus::from_str("No-Show"), Some(AppointmentStatus::NoShow));
        assert_eq!(AppointmentStatus::from_str("NoShow"), None);
        assert_eq!(PaymentMethod::from_str("Self-Pay"), Some(PaymentMethod::SelfPay));
        assert_eq!(Urgency::from_str("critical"), None);
    }

    #[test]
    fn test_serde_uses_dashboard_labels() {
        let json = serde_json::to_string(&AppointmentStatus::NoShow).unwrap();
        assert_eq!(json, "\"No-Show\"");
        let json = serde_json::to_string(&PaymentMethod::SelfPay).unwrap();
        assert_eq!(json, "\"Self-Pay\"");
    }

    #[test]
    fn test_next_position() {
        let record = SourceRecord {
            position: StreamPosition::new(2, 40),
            next_offset: 97,
            payload: b"{}".to_vec(),
        };
        assert_eq!(record.next_position(), StreamPosition::new(2, 97));
        assert_eq!(record.next_position().to_string(), "2@97");
    }
}
