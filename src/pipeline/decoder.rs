//! Decoder/validator: raw JSON record -> `AppointmentEvent`
//!
//! Accepts the producer's wire format:
//!
//! ```json
//! {"appointment_id": "a1b2c3d4", "status": "Scheduled", "department": "Cardiology",
//!  "urgency": "High", "cost": 412.5, "copay": 25.0,
//!  "timestamp": "2024-05-01T10:15:30.123456", "city": "Boston",
//!  "payment_method": "Insurance"}
//! ```
//!
//! `version` is optional. When absent the event-time timestamp (microseconds)
//! stands in as the version.

use super::error::DecodeError;
use super::types::{AppointmentEvent, AppointmentStatus, PaymentMethod, Urgency};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

/// Upper bound for identifier and categorical string fields
pub const MAX_FIELD_LEN: usize = 64;

/// Largest accepted cost or copay, in cents ($1 billion)
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000_000;

/// Wire shape with every field optional, so missing fields get a precise reason
#[derive(Debug, Deserialize)]
struct RawAppointment {
    appointment_id: Option<String>,
    status: Option<String>,
    department: Option<String>,
    urgency: Option<String>,
    cost: Option<f64>,
    copay: Option<f64>,
    timestamp: Option<String>,
    city: Option<String>,
    payment_method: Option<String>,
    version: Option<i64>,
}

/// Decode and validate a single raw record
pub fn decode(raw: &[u8]) -> Result<AppointmentEvent, DecodeError> {
    let parsed: RawAppointment =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let appointment_id = bounded_text("appointment_id", parsed.appointment_id)?;

    let status_str = parsed.status.ok_or(DecodeError::MissingField("status"))?;
    let status = AppointmentStatus::from_str(&status_str).ok_or(DecodeError::UnknownVariant {
        field: "status",
        value: status_str,
    })?;

    let urgency_str = parsed.urgency.ok_or(DecodeError::MissingField("urgency"))?;
    let urgency = Urgency::from_str(&urgency_str).ok_or(DecodeError::UnknownVariant {
        field: "urgency",
        value: urgency_str,
    })?;

    let payment_str = parsed
        .payment_method
        .ok_or(DecodeError::MissingField("payment_method"))?;
    let payment_method = PaymentMethod::from_str(&payment_str).ok_or(DecodeError::UnknownVariant {
        field: "payment_method",
        value: payment_str,
    })?;

    let department = bounded_text("department", parsed.department)?;
    let city = bounded_text("city", parsed.city)?;

    let cost = amount("cost", parsed.cost)?;
    let copay = amount("copay", parsed.copay)?;
    let cost_cents = to_cents(cost);
    let copay_cents = to_cents(copay);
    if copay_cents > cost_cents {
        return Err(DecodeError::CopayExceedsCost { cost, copay });
    }

    let timestamp_str = parsed.timestamp.ok_or(DecodeError::MissingField("timestamp"))?;
    let timestamp = parse_timestamp(&timestamp_str)?;

    let version = match parsed.version {
        Some(v) if v < 0 => {
            return Err(DecodeError::InvalidField {
                field: "version",
                reason: format!("must be non-negative, got {}", v),
            })
        }
        Some(v) => v,
        None => timestamp.timestamp_micros(),
    };

    Ok(AppointmentEvent {
        appointment_id,
        version,
        status,
        department,
        urgency,
        cost_cents,
        copay_cents,
        timestamp,
        city,
        payment_method,
    })
}

/// Parse an ISO-8601 timestamp
///
/// RFC 3339 (with offset) is accepted as is; naive timestamps, as emitted by
/// the producer, are taken to be UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeError::InvalidField {
            field: "timestamp",
            reason: format!("`{}`: {}", s, e),
        })
}

fn bounded_text(field: &'static str, value: Option<String>) -> Result<String, DecodeError> {
    let value = value.ok_or(DecodeError::MissingField(field))?;
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(DecodeError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if trimmed.chars().count() > MAX_FIELD_LEN {
        return Err(DecodeError::InvalidField {
            field,
            reason: format!("longer than {} characters", MAX_FIELD_LEN),
        });
    }

    Ok(trimmed.to_string())
}

fn amount(field: &'static str, value: Option<f64>) -> Result<f64, DecodeError> {
    let value = value.ok_or(DecodeError::MissingField(field))?;
    if !value.is_finite() {
        return Err(DecodeError::InvalidField {
            field,
            reason: "must be a finite number".to_string(),
        });
    }
    if value < 0.0 {
        return Err(DecodeError::NegativeAmount { field, value });
    }
    if value * 100.0 > MAX_AMOUNT_CENTS as f64 {
        return Err(DecodeError::InvalidField {
            field,
            reason: format!("exceeds the maximum of {} cents", MAX_AMOUNT_CENTS),
        });
    }
    Ok(value)
}

fn to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn producer_record() -> serde_json::Value {
        serde_json::json!({
            "appointment_id": "3f2a9c1b",
            "status": "Scheduled",
            "department": "Cardiology",
            "urgency": "High",
            "cost": 512.34,
            "timestamp": "2024-05-01T10:15:30.123456",
            "city": "Boston",
            "payment_method": "Insurance",
            "copay": 25.5
        })
    }

    fn decode_value(value: &serde_json::Value) -> Result<AppointmentEvent, DecodeError> {
        decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_producer_record() {
        let event = decode_value(&producer_record()).unwrap();

        assert_eq!(event.appointment_id, "3f2a9c1b");
        assert_eq!(event.status, AppointmentStatus::Scheduled);
        assert_eq!(event.urgency, Urgency::High);
        assert_eq!(event.payment_method, PaymentMethod::Insurance);
        assert_eq!(event.cost_cents, 51234);
        assert_eq!(event.copay_cents, 2550);
        assert_eq!(event.city, "Boston");

        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(event.timestamp, expected);
        // No explicit version: timestamp stands in
        assert_eq!(event.version, expected.timestamp_micros());
    }

    #[test]
    fn test_explicit_version_and_rfc3339() {
        let mut value = producer_record();
        value["version"] = serde_json::json!(7);
        value["timestamp"] = serde_json::json!("2024-05-01T12:15:30+02:00");

        let event = decode_value(&value).unwrap();
        assert_eq!(event.version, 7);
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap());
    }

    #[test]
    fn test_copay_above_cost_rejected() {
        let mut value = producer_record();
        value["cost"] = serde_json::json!(100.0);
        value["copay"] = serde_json::json!(150.0);

        let err = decode_value(&value).unwrap_err();
        assert_eq!(err, DecodeError::CopayExceedsCost { cost: 100.0, copay: 150.0 });
    }

    #[test]
    fn test_self_pay_zero_copay_accepted() {
        let mut value = producer_record();
        value["payment_method"] = serde_json::json!("Self-Pay");
        value["copay"] = serde_json::json!(0);

        let event = decode_value(&value).unwrap();
        assert_eq!(event.payment_method, PaymentMethod::SelfPay);
        assert_eq!(event.copay_cents, 0);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut value = producer_record();
        value["status"] = serde_json::json!("Rescheduled");

        let err = decode_value(&value).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownVariant { field: "status", value: "Rescheduled".to_string() }
        );
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut value = producer_record();
        value["cost"] = serde_json::json!(-1.0);

        let err = decode_value(&value).unwrap_err();
        assert!(matches!(err, DecodeError::NegativeAmount { field: "cost", .. }));
    }

    #[test]
    fn test_oversized_amount_rejected() {
        // Test: amounts past the bound never reach the cent conversion
        let mut record = producer_record();
        record["cost"] = serde_json::json!(1e17);
        assert!(matches!(
            decode_value(&record),
            Err(DecodeError::InvalidField { field: "cost", .. })
        ));

        let mut at_limit = producer_record();
        at_limit["cost"] = serde_json::json!(MAX_AMOUNT_CENTS as f64 / 100.0);
        let event = decode_value(&at_limit).unwrap();
        assert_eq!(event.cost_cents, MAX_AMOUNT_CENTS);
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut value = producer_record();
        value.as_object_mut().unwrap().remove("department");

        assert_eq!(decode_value(&value).unwrap_err(), DecodeError::MissingField("department"));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(b"{\"cost\": \"cheap\"}"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_bad_timestamp_and_blank_city() {
        let mut value = producer_record();
        value["timestamp"] = serde_json::json!("yesterday");
        assert!(matches!(
            decode_value(&value),
            Err(DecodeError::InvalidField { field: "timestamp", .. })
        ));

        let mut value = producer_record();
        value["city"] = serde_json::json!("   ");
        assert!(matches!(
            decode_value(&value),
            Err(DecodeError::InvalidField { field: "city", .. })
        ));
    }
}
