//! Flight-payload extraction and normalization.
//!
//! Server-rendered admin pages embed a JSON dialect ("flight payload"):
//! ordinary JSON extended with `$D`-prefixed date strings and an
//! `$undefined` sentinel. This crate locates a named array inside the raw
//! page text, rewrites the dialect tokens into strict JSON, decodes it,
//! finds the target booking record, and normalizes it into a
//! [`CanonicalBundle`] ready for entity resolution.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use rosta_core::{
    split_full_name, Address, BookingStatus, BundleBooking, BundleOrder, BundleSession,
    BundleStudent, CanonicalBundle, CertificateDraft, TimestampPair,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "rosta-flight";

/// Array key holding booking records in a session/order page.
pub const BOOKINGS_KEY: &str = "bookings";
/// Array key holding class segments (time/place/modality detail).
pub const SEGMENTS_KEY: &str = "classes";

/// Segment modality that wins the tie-break: in-person delivery details
/// take precedence over any other modality for the same session.
pub const INSTRUCTOR_LED: &str = "INSTRUCTOR_LED";

/// The receiving organization's local zone for stored timestamp pairs.
pub const LOCAL_TZ: Tz = chrono_tz::America::Chicago;

/// Course-name marker that forces a certificate's expiry to exactly
/// 90 days after its issue date.
pub const SKILLS_SESSION_MARKER: &str = "eligible for skills session within 90 days";

/// Characters of offending text carried by decode errors.
pub const DECODE_EXCERPT_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("key \"{key}\" not found in document")]
    KeyNotFound { key: String },
    #[error("unbalanced brackets in \"{key}\" array")]
    Unbalanced { key: String },
    #[error("invalid JSON in \"{key}\" array: {source}; excerpt: {excerpt}")]
    Decode {
        key: String,
        excerpt: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("\"{key}\" decoded to {found}, expected {expected}")]
    Shape {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("no booking with referenceNumber \"{reference}\" in bookings array")]
    BookingNotFound { reference: String },
    #[error("required field missing after normalization: {field}")]
    MissingField { field: &'static str },
}

// ------------------------------------------------------------------
// Block extraction
// ------------------------------------------------------------------

/// Return the balanced `[...]` substring assigned to `"key":` in `text`.
///
/// Single-pass scan with two states, in-string and not-in-string, honoring
/// backslash escapes so brackets inside string literals are never counted
/// as structural. Depth starts at 1 on the opening bracket and the scan
/// stops the instant it returns to 0. Byte-wise iteration is safe here:
/// every structural character is ASCII and multi-byte UTF-8 sequences
/// never contain ASCII bytes.
pub fn extract_array_block<'a>(text: &'a str, key: &str) -> Result<&'a str, FlightError> {
    let marker = format!("\"{key}\":[");
    let Some(marker_at) = text.find(&marker) else {
        return Err(FlightError::KeyNotFound {
            key: key.to_string(),
        });
    };
    let start = marker_at + marker.len() - 1;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    Err(FlightError::Unbalanced {
        key: key.to_string(),
    })
}

// ------------------------------------------------------------------
// Token sanitization
// ------------------------------------------------------------------

fn date_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([:\[,])"\$D([^"]*)""#).expect("static regex"))
}

fn quoted_undefined_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([:\[,])"\$undefined""#).expect("static regex"))
}

fn bare_undefined_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([:\[,])\$undefined"#).expect("static regex"))
}

/// Rewrite flight-dialect tokens into strict JSON.
///
/// Replacements are scoped to value position (immediately after `:`, `[`
/// or `,`) so a legitimate string that merely contains a sentinel
/// substring is never corrupted. Idempotent: re-applying the rewrite to
/// its own output is a no-op.
pub fn sanitize_flight_tokens(raw: &str) -> String {
    let pass = date_marker_re().replace_all(raw, "${1}\"${2}\"");
    let pass = quoted_undefined_re().replace_all(&pass, "${1}null");
    bare_undefined_re().replace_all(&pass, "${1}null").into_owned()
}

// ------------------------------------------------------------------
// Structural decoding
// ------------------------------------------------------------------

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(DECODE_EXCERPT_LEN).collect()
}

/// Parse sanitized text expecting a top-level array.
///
/// Parse failures surface the first 500 characters of the offending text;
/// a non-array top level is a shape error, never a silent empty result.
pub fn decode_array(text: &str, key: &str) -> Result<Vec<Value>, FlightError> {
    let value: Value = serde_json::from_str(text).map_err(|source| FlightError::Decode {
        key: key.to_string(),
        excerpt: excerpt(text),
        source,
    })?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(FlightError::Shape {
            key: key.to_string(),
            expected: "array",
            found: value_kind(&other),
        }),
    }
}

/// Extract, sanitize and decode the named array from a raw document.
pub fn decode_named_array(document: &str, key: &str) -> Result<Vec<Value>, FlightError> {
    let block = extract_array_block(document, key)?;
    let cleaned = sanitize_flight_tokens(block);
    decode_array(&cleaned, key)
}

// ------------------------------------------------------------------
// Record location
// ------------------------------------------------------------------

/// First booking whose `referenceNumber` equals the target; the miss is a
/// lookup failure, distinct from extraction failures.
pub fn find_booking<'a>(bookings: &'a [Value], reference: &str) -> Result<&'a Value, FlightError> {
    bookings
        .iter()
        .find(|b| json_str(b, &["referenceNumber"]) == Some(reference))
        .ok_or_else(|| FlightError::BookingNotFound {
            reference: reference.to_string(),
        })
}

/// Pick the most relevant class segment for a session.
///
/// Collect segments linked by `courseSessionId`; none is not an error
/// (session detail is optional). Among candidates, an `INSTRUCTOR_LED`
/// segment wins, otherwise the first in original array order.
pub fn find_session_segment(segments: &[Value], course_session_id: i64) -> Option<&Value> {
    let candidates: Vec<&Value> = segments
        .iter()
        .filter(|s| json_i64(s, &["courseSessionId"]) == Some(course_session_id))
        .collect();
    candidates
        .iter()
        .find(|s| json_str(s, &["modality"]) == Some(INSTRUCTOR_LED))
        .copied()
        .or_else(|| candidates.first().copied())
}

// ------------------------------------------------------------------
// JSON path helpers
// ------------------------------------------------------------------

fn json_get<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    json_get(value, path)?.as_str()
}

fn json_i64(value: &Value, path: &[&str]) -> Option<i64> {
    json_get(value, path)?.as_i64()
}

/// External ids appear as numbers or strings depending on the page; both
/// normalize to their string form.
fn json_id(value: &Value, path: &[&str]) -> Option<String> {
    match json_get(value, path)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn nonempty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

// ------------------------------------------------------------------
// Field normalization
// ------------------------------------------------------------------

/// Split `"Maria Del Rio, RN"` into the instructor's full name and an
/// optional title after the first comma.
pub fn split_name_and_title(raw: &str) -> (Option<String>, Option<String>) {
    match raw.split_once(',') {
        Some((name, title)) => (nonempty(Some(name)), nonempty(Some(title))),
        None => (nonempty(Some(raw)), None),
    }
}

/// Normalize a US phone number to E.164, or `None` when it does not carry
/// ten national digits. Callers keep the raw string alongside; a bad
/// phone never rejects a bundle.
pub fn normalize_phone_us(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        11 if digits.starts_with('1') => &digits[1..],
        10 => digits.as_str(),
        _ => return None,
    };
    Some(format!("+1{national}"))
}

/// Parse a money string into integer minor units: strip currency symbols
/// and thousands separators, then combine the dollar and (floored)
/// two-digit cent parts digit-wise, avoiding float drift. Unparseable
/// input yields `None`, never an error.
pub fn parse_money_cents(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let (dollars, fraction) = match cleaned.split_once('.') {
        Some((d, f)) => (d, f),
        None => (cleaned.as_str(), ""),
    };
    if dollars.is_empty() && fraction.is_empty() {
        return None;
    }
    if !dollars.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let whole: i64 = if dollars.is_empty() {
        0
    } else {
        dollars.parse().ok()?
    };
    // Truncating past two fractional digits floors the amount.
    let mut cents = 0i64;
    let mut frac = fraction.chars();
    for place in [10i64, 1] {
        cents += place * frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
    }
    Some(whole * 100 + cents)
}

fn money_cents_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_money_cents(s),
        // Route numbers through the string parser so 129.99 cannot lose a
        // cent to binary floating point.
        Value::Number(n) => parse_money_cents(&n.to_string()),
        _ => None,
    }
}

/// Parse one ISO-8601 instant. Offset-less inputs are taken as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Derive the UTC + fixed-local-zone pair from a single source instant.
/// A missing input yields both outputs missing; the two fields are never
/// independently parsed.
pub fn timestamp_pair(raw: Option<&str>) -> Option<TimestampPair> {
    let utc = parse_instant(raw?)?;
    Some(TimestampPair {
        utc,
        local: utc.with_timezone(&LOCAL_TZ).fixed_offset(),
    })
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?)\s+([A-Za-z ]+),\s*([A-Z]{2})\s+(\d{5})").expect("static regex")
    })
}

/// Parse a single-line `<street> <city>, <ST> <ZIP>` address. On no
/// match the whole raw string is kept as the street rather than
/// discarding the address.
pub fn parse_address(raw: &str) -> Address {
    match address_re().captures(raw) {
        Some(caps) => Address {
            street: Some(caps[1].trim().to_string()),
            city: Some(caps[2].trim().to_string()),
            state: Some(caps[3].trim().to_string()),
            postal_code: Some(caps[4].trim().to_string()),
            raw: Some(raw.to_string()),
        },
        None => Address {
            street: Some(raw.to_string()),
            city: None,
            state: None,
            postal_code: None,
            raw: Some(raw.to_string()),
        },
    }
}

// ------------------------------------------------------------------
// Bundle normalization
// ------------------------------------------------------------------

fn normalize_student(booking: &Value) -> Result<BundleStudent, FlightError> {
    let student = booking.get("student").cloned().unwrap_or(Value::Null);

    let email = nonempty(json_str(&student, &["email"])).map(|e| e.to_lowercase());
    let external_student_id = json_id(&student, &["id"]);
    if external_student_id.is_none() && email.is_none() {
        return Err(FlightError::MissingField {
            field: "student id or email",
        });
    }

    let (first_name, last_name) = match (
        nonempty(json_str(&student, &["firstName"])),
        nonempty(json_str(&student, &["lastName"])),
    ) {
        (None, None) => match nonempty(json_str(&student, &["name"])) {
            Some(full) => split_full_name(&full),
            None => (None, None),
        },
        split => split,
    };

    let phone_raw = nonempty(json_str(&student, &["phoneNumber"]));
    let phone_e164 = phone_raw.as_deref().and_then(normalize_phone_us);

    Ok(BundleStudent {
        external_student_id,
        first_name,
        last_name,
        email,
        phone_e164,
        phone_raw,
        external_account_id: json_id(&student, &["accountId"]),
    })
}

fn normalize_session(
    booking: &Value,
    segment: Option<&Value>,
) -> Result<BundleSession, FlightError> {
    let external_session_id = json_id(booking, &["courseSessionId"]).ok_or(
        FlightError::MissingField {
            field: "courseSessionId",
        },
    )?;

    let seg = segment.cloned().unwrap_or(Value::Null);
    let location = seg.get("location").cloned().unwrap_or(Value::Null);

    let mut address = nonempty(json_str(&location, &["formattedAddress"]))
        .or_else(|| nonempty(json_str(&location, &["address1"])))
        .map(|raw| parse_address(&raw))
        .unwrap_or_default();
    // Structured location fields take precedence over the parsed line.
    if let Some(city) = nonempty(json_str(&location, &["city"])) {
        address.city = Some(city);
    }
    if let Some(state) = nonempty(json_str(&location, &["state"])) {
        address.state = Some(state);
    }
    if let Some(postal) = nonempty(json_str(&location, &["postalCode"])) {
        address.postal_code = Some(postal);
    }

    let instructor_raw = nonempty(json_str(&seg, &["instructor", "name"]))
        .or_else(|| nonempty(json_str(&seg, &["instructorName"])));
    let (instructor_name, instructor_title) = match instructor_raw {
        Some(raw) => split_name_and_title(&raw),
        None => (None, None),
    };

    Ok(BundleSession {
        external_session_id,
        course_name: nonempty(json_str(&seg, &["course", "name"]))
            .or_else(|| nonempty(json_str(&seg, &["name"]))),
        course_format: nonempty(json_str(&seg, &["course", "format"]))
            .or_else(|| nonempty(json_str(&seg, &["modality"]))),
        agency_name: nonempty(json_str(&seg, &["agency", "name"]))
            .or_else(|| nonempty(json_str(booking, &["serviceProvider", "name"]))),
        start: timestamp_pair(json_str(&seg, &["startsAt"])),
        location_name: nonempty(json_str(&location, &["label"])),
        address,
        instructor_name,
        instructor_title,
    })
}

fn normalize_order(booking: &Value) -> Result<BundleOrder, FlightError> {
    let item = booking.get("courseOrderItem").cloned().unwrap_or(Value::Null);
    let order = item.get("order").cloned().unwrap_or(Value::Null);

    let external_order_id = json_id(&item, &["orderId"])
        .or_else(|| json_id(&order, &["id"]))
        .ok_or(FlightError::MissingField { field: "orderId" })?;

    let amount_cents = json_get(&order, &["totalPrice"])
        .and_then(money_cents_from_value)
        .or_else(|| json_get(&item, &["price"]).and_then(money_cents_from_value));
    let currency_code = amount_cents.map(|_| "USD".to_string());

    let ordered_at_raw = json_str(&order, &["paidAt"]).or_else(|| json_str(&order, &["createdAt"]));

    Ok(BundleOrder {
        external_order_id,
        order_number: nonempty(json_str(&order, &["referenceNumber"])),
        status: nonempty(json_str(&order, &["status"])),
        amount_cents,
        currency_code,
        ordered_at: timestamp_pair(ordered_at_raw),
    })
}

/// Pure mapping from one located raw booking record (plus an optional
/// matched class segment) into a canonical flat bundle. Field-level soft
/// failures degrade to `None`; a missing required natural key aborts the
/// bundle here, before any storage write.
pub fn normalize_bundle(
    booking: &Value,
    segment: Option<&Value>,
) -> Result<CanonicalBundle, FlightError> {
    let reference = nonempty(json_str(booking, &["referenceNumber"])).ok_or(
        FlightError::MissingField {
            field: "referenceNumber",
        },
    )?;

    let canceled_at = json_str(booking, &["canceledAt"]).and_then(parse_instant);

    Ok(CanonicalBundle {
        booking: BundleBooking {
            external_booking_id: json_i64(booking, &["id"]),
            external_cuid: nonempty(json_str(booking, &["cuid"])),
            reference,
            status: BookingStatus::from_canceled_at(canceled_at),
            created_at: json_str(booking, &["createdAt"]).and_then(parse_instant),
            updated_at: json_str(booking, &["updatedAt"]).and_then(parse_instant),
            canceled_at,
            verified_at: json_str(booking, &["verifiedAt"]).and_then(parse_instant),
        },
        student: normalize_student(booking)?,
        session: normalize_session(booking, segment)?,
        order: normalize_order(booking)?,
    })
}

/// Parse a raw admin page for the booking with the given reference and
/// return its canonical bundle.
///
/// The `classes` array is optional detail: an absent key yields no
/// segment, but a present-and-corrupt one still fails loudly with its
/// decode context.
pub fn parse_booking_document(
    document: &str,
    reference: &str,
) -> Result<CanonicalBundle, FlightError> {
    let bookings = decode_named_array(document, BOOKINGS_KEY)?;
    let segments = match decode_named_array(document, SEGMENTS_KEY) {
        Ok(segments) => segments,
        Err(FlightError::KeyNotFound { .. }) => Vec::new(),
        Err(err) => return Err(err),
    };

    let booking = find_booking(&bookings, reference)?;
    let segment = json_i64(booking, &["courseSessionId"])
        .and_then(|id| find_session_segment(&segments, id));

    normalize_bundle(booking, segment)
}

// ------------------------------------------------------------------
// Certificates
// ------------------------------------------------------------------

/// Certificate record as scraped upstream, prior to normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCertificate {
    pub cert_id: Option<String>,
    pub course_name: Option<String>,
    pub course_code: Option<String>,
    pub format: Option<String>,
    pub issue_date: Option<String>,
    pub expiry_date: Option<String>,
    pub issuer_org: Option<String>,
    pub agency_org_name: Option<String>,
    pub org_name: Option<String>,
    pub instructor_name: Option<String>,
}

/// Certificate dates arrive in a handful of US formats.
pub fn parse_cert_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    for format in ["%m/%d/%Y", "%b %d, %Y", "%b %d, %y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

/// Normalize one scraped certificate; `None` when it has no id.
///
/// The 90-day skills-session override is applied here so every consumer,
/// persisted or ephemeral, sees the same expiry.
pub fn normalize_certificate(raw: &RawCertificate) -> Option<CertificateDraft> {
    let cert_id = nonempty(raw.cert_id.as_deref())?;
    let issue_date = raw.issue_date.as_deref().and_then(parse_cert_date);
    let mut expiry_date = raw.expiry_date.as_deref().and_then(parse_cert_date);

    let course_name = nonempty(raw.course_name.as_deref());
    let skills_window = course_name
        .as_deref()
        .map(|name| name.to_lowercase().contains(SKILLS_SESSION_MARKER))
        .unwrap_or(false);
    if skills_window {
        if let Some(issued) = issue_date {
            expiry_date = Some(issued + Duration::days(90));
        }
    }

    Some(CertificateDraft {
        cert_id,
        course_name,
        course_code: nonempty(raw.course_code.as_deref()),
        format: nonempty(raw.format.as_deref()),
        issue_date,
        expiry_date,
        issuer_org: nonempty(raw.issuer_org.as_deref())
            .or_else(|| nonempty(raw.agency_org_name.as_deref()))
            .or_else(|| nonempty(raw.org_name.as_deref())),
        instructor_name: nonempty(raw.instructor_name.as_deref()),
    })
}
