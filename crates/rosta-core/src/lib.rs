//! Core domain model for rosta: canonical ingest bundles and receipts.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rosta-core";

/// Booking lifecycle state, derived solely from the cancellation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Active,
    Canceled,
}

impl BookingStatus {
    /// Total function of the cancellation timestamp; there is no third state.
    pub fn from_canceled_at(canceled_at: Option<DateTime<Utc>>) -> Self {
        if canceled_at.is_some() {
            BookingStatus::Canceled
        } else {
            BookingStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Canceled => "canceled",
        }
    }
}

/// Split a full name on the first whitespace run: first name plus the
/// remainder as last name, or no last name when the input is one word.
pub fn split_full_name(full: &str) -> (Option<String>, Option<String>) {
    let mut parts = full.split_whitespace();
    let first = parts.next().map(String::from);
    let rest: Vec<&str> = parts.collect();
    let last = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    (first, last)
}

/// UTC + fixed-local-zone views of one source instant.
///
/// Both fields come out of a single parse so the pair can never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPair {
    pub utc: DateTime<Utc>,
    pub local: DateTime<FixedOffset>,
}

/// Structured single-line US address; unmatched input survives in `raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleBooking {
    pub external_booking_id: Option<i64>,
    pub external_cuid: Option<String>,
    pub reference: String,
    pub status: BookingStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleStudent {
    pub external_student_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Lower-cased and trimmed; secondary natural key.
    pub email: Option<String>,
    pub phone_e164: Option<String>,
    pub phone_raw: Option<String>,
    pub external_account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSession {
    /// Primary natural key; a bundle without one is never constructed.
    pub external_session_id: String,
    pub course_name: Option<String>,
    pub course_format: Option<String>,
    pub agency_name: Option<String>,
    pub start: Option<TimestampPair>,
    pub location_name: Option<String>,
    pub address: Address,
    pub instructor_name: Option<String>,
    pub instructor_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleOrder {
    pub external_order_id: String,
    pub order_number: Option<String>,
    pub status: Option<String>,
    /// Integer minor-currency units, never a float.
    pub amount_cents: Option<i64>,
    pub currency_code: Option<String>,
    pub ordered_at: Option<TimestampPair>,
}

/// One normalized snapshot of a located booking record, consumed by the
/// resolution engine and then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBundle {
    pub booking: BundleBooking,
    pub student: BundleStudent,
    pub session: BundleSession,
    pub order: BundleOrder,
}

/// Normalized certificate record, shared by the persisted and ephemeral
/// serialization paths. The 90-day skills-session override is already
/// applied by the time one of these exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDraft {
    pub cert_id: String,
    pub course_name: Option<String>,
    pub course_code: Option<String>,
    pub format: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub issuer_org: Option<String>,
    pub instructor_name: Option<String>,
}

/// Plain data record handed to an external notifier after a successful
/// commit. This crate never formats or sends messages itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub run_id: Uuid,
    pub booking_reference: String,
    pub booking_id: i64,
    pub student_id: i64,
    pub session_id: i64,
    pub order_id: i64,
    pub booking_created: bool,
    pub certificates: Vec<CertificateDraft>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn booking_status_is_a_total_function_of_canceled_at() {
        assert_eq!(
            BookingStatus::from_canceled_at(None),
            BookingStatus::Active
        );
        let ts = Utc.with_ymd_and_hms(2025, 12, 7, 19, 30, 0).single();
        assert_eq!(
            BookingStatus::from_canceled_at(ts),
            BookingStatus::Canceled
        );
    }

    #[test]
    fn name_split_takes_first_whitespace_run() {
        assert_eq!(
            split_full_name("Ann Lee"),
            (Some("Ann".into()), Some("Lee".into()))
        );
        assert_eq!(
            split_full_name("Mary Jo Van Der Berg"),
            (Some("Mary".into()), Some("Jo Van Der Berg".into()))
        );
        assert_eq!(split_full_name("Cher"), (Some("Cher".into()), None));
        assert_eq!(split_full_name("   "), (None, None));
    }

    #[test]
    fn booking_status_serializes_lowercase() {
        assert_eq!(BookingStatus::Active.as_str(), "active");
        assert_eq!(BookingStatus::Canceled.as_str(), "canceled");
        let json = serde_json::to_string(&BookingStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
    }
}
