//! Entity resolution and Postgres persistence for canonical bundles.
//!
//! One [`CanonicalBundle`] fans out into up to eight entities, resolved
//! against natural keys in a fixed dependency order: agency, then course,
//! location and instructor, then student, session, order and finally the
//! booking. Create and merge paths converge on the same field-assignment
//! functions so an entity ends up identical whether it was just created
//! or matched an existing row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rosta_core::{
    split_full_name, BookingStatus, BundleBooking, BundleOrder, BundleSession, BundleStudent,
    CanonicalBundle, CertificateDraft,
};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

pub const CRATE_NAME: &str = "rosta-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    /// Transient faults a caller may retry; constraint and shape errors
    /// are permanent and must surface.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Timeout(_) => true,
            StorageError::Database(sqlx::Error::PoolTimedOut) => true,
            StorageError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

/// Apply all pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ------------------------------------------------------------------
// Rows
// ------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct StudentRow {
    pub id: i64,
    pub external_student_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone_e164: Option<String>,
    pub phone_raw: Option<String>,
    pub external_account_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct AgencyRow {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct CourseRow {
    pub id: i64,
    pub name: String,
    pub format: Option<String>,
    pub agency_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct LocationRow {
    pub id: i64,
    pub name: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub raw_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct InstructorRow {
    pub id: i64,
    pub full_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub external_session_id: String,
    pub course_id: Option<i64>,
    pub agency_id: Option<i64>,
    pub location_id: Option<i64>,
    pub instructor_id: Option<i64>,
    pub start_utc: Option<DateTime<Utc>>,
    pub start_local: Option<NaiveDateTime>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct OrderRow {
    pub id: i64,
    pub external_order_id: String,
    pub order_number: Option<String>,
    pub student_id: Option<i64>,
    pub status: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency_code: Option<String>,
    pub ordered_at_utc: Option<DateTime<Utc>>,
    pub ordered_at_local: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct BookingRow {
    pub id: i64,
    pub reference: String,
    pub external_booking_id: Option<i64>,
    pub external_cuid: Option<String>,
    pub student_id: i64,
    pub session_id: i64,
    pub order_id: i64,
    pub status: String,
    pub canceled_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct CertificateRow {
    pub cert_id: String,
    pub student_id: i64,
    pub course_name: Option<String>,
    pub course_code: Option<String>,
    pub format: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub issuer_org: Option<String>,
    pub instructor_name: Option<String>,
}

// ------------------------------------------------------------------
// Store trait
// ------------------------------------------------------------------

/// Natural-key lookups and writes for every resolved entity.
///
/// The resolution engine is generic over this trait so its merge rules
/// can be exercised against an in-memory store as well as Postgres.
#[async_trait]
pub trait BundleStore {
    async fn find_student_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<StudentRow>, StorageError>;
    async fn find_student_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<StudentRow>, StorageError>;
    async fn insert_student(&mut self, row: &StudentRow) -> Result<StudentRow, StorageError>;
    async fn update_student(&mut self, row: &StudentRow) -> Result<(), StorageError>;

    async fn find_agency_by_name(
        &mut self,
        name: &str,
    ) -> Result<Option<AgencyRow>, StorageError>;
    async fn insert_agency(&mut self, name: &str) -> Result<AgencyRow, StorageError>;

    async fn find_course(
        &mut self,
        name: &str,
        format: Option<&str>,
        agency_id: Option<i64>,
    ) -> Result<Option<CourseRow>, StorageError>;
    async fn insert_course(&mut self, row: &CourseRow) -> Result<CourseRow, StorageError>;

    async fn find_location(
        &mut self,
        name: Option<&str>,
        street: Option<&str>,
        city: Option<&str>,
        state: Option<&str>,
        postal_code: Option<&str>,
    ) -> Result<Option<LocationRow>, StorageError>;
    async fn insert_location(&mut self, row: &LocationRow) -> Result<LocationRow, StorageError>;

    async fn find_instructor_by_name(
        &mut self,
        full_name: &str,
    ) -> Result<Option<InstructorRow>, StorageError>;
    async fn insert_instructor(
        &mut self,
        row: &InstructorRow,
    ) -> Result<InstructorRow, StorageError>;
    async fn update_instructor(&mut self, row: &InstructorRow) -> Result<(), StorageError>;

    async fn find_session_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<SessionRow>, StorageError>;
    async fn insert_session(&mut self, row: &SessionRow) -> Result<SessionRow, StorageError>;
    async fn update_session(&mut self, row: &SessionRow) -> Result<(), StorageError>;

    async fn find_order_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<OrderRow>, StorageError>;
    async fn insert_order(&mut self, row: &OrderRow) -> Result<OrderRow, StorageError>;
    async fn update_order(&mut self, row: &OrderRow) -> Result<(), StorageError>;

    async fn find_booking_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<BookingRow>, StorageError>;
    async fn insert_booking(&mut self, row: &BookingRow) -> Result<BookingRow, StorageError>;
    async fn update_booking(&mut self, row: &BookingRow) -> Result<(), StorageError>;

    async fn find_certificate(
        &mut self,
        cert_id: &str,
    ) -> Result<Option<CertificateRow>, StorageError>;
    async fn insert_certificate(
        &mut self,
        row: &CertificateRow,
    ) -> Result<CertificateRow, StorageError>;
    async fn update_certificate(&mut self, row: &CertificateRow) -> Result<(), StorageError>;
}

// ------------------------------------------------------------------
// Field assignment, shared by create and merge
// ------------------------------------------------------------------

/// External id is write-once; the phone pair moves together so a raw
/// number can never sit next to a stale E.164 form. Everything else is a
/// present-value overwrite that never clears existing data.
pub fn apply_student_fields(row: &mut StudentRow, src: &BundleStudent) {
    if row.external_student_id.is_none() {
        row.external_student_id = src.external_student_id.clone();
    }
    if src.first_name.is_some() {
        row.first_name = src.first_name.clone();
    }
    if src.last_name.is_some() {
        row.last_name = src.last_name.clone();
    }
    if src.email.is_some() {
        row.email = src.email.clone();
    }
    if src.phone_raw.is_some() {
        row.phone_raw = src.phone_raw.clone();
        row.phone_e164 = src.phone_e164.clone();
    }
    if src.external_account_id.is_some() {
        row.external_account_id = src.external_account_id.clone();
    }
}

/// Only the title follows later snapshots; the stored name split stays as
/// it was computed at creation.
pub fn apply_instructor_fields(row: &mut InstructorRow, title: Option<&str>) {
    if let Some(title) = title {
        row.title = Some(title.to_string());
    }
}

/// Links are present-value only so a sparse re-ingest (no matched class
/// segment) never detaches a session from its course or location.
pub fn apply_session_fields(
    row: &mut SessionRow,
    src: &BundleSession,
    course_id: Option<i64>,
    agency_id: Option<i64>,
    location_id: Option<i64>,
    instructor_id: Option<i64>,
) {
    if course_id.is_some() {
        row.course_id = course_id;
    }
    if agency_id.is_some() {
        row.agency_id = agency_id;
    }
    if location_id.is_some() {
        row.location_id = location_id;
    }
    if instructor_id.is_some() {
        row.instructor_id = instructor_id;
    }
    if let Some(pair) = src.start {
        row.start_utc = Some(pair.utc);
        row.start_local = Some(pair.local.naive_local());
    }
    if src.course_format.is_some() {
        row.format = src.course_format.clone();
    }
}

/// The amount and its currency code move together.
pub fn apply_order_fields(row: &mut OrderRow, src: &BundleOrder, student_id: i64) {
    row.student_id = Some(student_id);
    if src.order_number.is_some() {
        row.order_number = src.order_number.clone();
    }
    if src.status.is_some() {
        row.status = src.status.clone();
    }
    if src.amount_cents.is_some() {
        row.amount_cents = src.amount_cents;
        row.currency_code = src.currency_code.clone();
    }
    if let Some(pair) = src.ordered_at {
        row.ordered_at_utc = Some(pair.utc);
        row.ordered_at_local = Some(pair.local.naive_local());
    }
}

/// Entity links always follow the latest snapshot. `canceled_at` is
/// assigned unconditionally, including back to `None`, and the status is
/// recomputed from it so a reactivated booking flips back to active.
pub fn apply_booking_fields(
    row: &mut BookingRow,
    src: &BundleBooking,
    student_id: i64,
    session_id: i64,
    order_id: i64,
) {
    row.student_id = student_id;
    row.session_id = session_id;
    row.order_id = order_id;
    if row.external_booking_id.is_none() {
        row.external_booking_id = src.external_booking_id;
    }
    if row.external_cuid.is_none() {
        row.external_cuid = src.external_cuid.clone();
    }
    row.canceled_at = src.canceled_at;
    row.status = BookingStatus::from_canceled_at(src.canceled_at)
        .as_str()
        .to_string();
    if src.verified_at.is_some() {
        row.verified_at = src.verified_at;
    }
    if src.created_at.is_some() {
        row.source_created_at = src.created_at;
    }
    if src.updated_at.is_some() {
        row.source_updated_at = src.updated_at;
    }
}

/// Certificates are keyed by their upstream id and fully refreshed.
pub fn apply_certificate_fields(row: &mut CertificateRow, src: &CertificateDraft) {
    row.course_name = src.course_name.clone();
    row.course_code = src.course_code.clone();
    row.format = src.format.clone();
    row.issue_date = src.issue_date;
    row.expiry_date = src.expiry_date;
    row.issuer_org = src.issuer_org.clone();
    row.instructor_name = src.instructor_name.clone();
}

// ------------------------------------------------------------------
// Resolution engine
// ------------------------------------------------------------------

/// Surrogate ids produced by one bundle resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBundle {
    pub student_id: i64,
    pub agency_id: Option<i64>,
    pub course_id: Option<i64>,
    pub location_id: Option<i64>,
    pub instructor_id: Option<i64>,
    pub session_id: i64,
    pub order_id: i64,
    pub booking_id: i64,
    /// True when the booking row did not exist before this resolution.
    pub booking_created: bool,
}

/// Resolve one canonical bundle against the store.
///
/// Idempotent: replaying the same bundle matches every natural key and
/// re-applies the same field values, so no second row ever appears.
pub async fn resolve_bundle<S: BundleStore + ?Sized>(
    store: &mut S,
    bundle: &CanonicalBundle,
) -> Result<ResolvedBundle, StorageError> {
    let session_src = &bundle.session;

    let agency_id = match &session_src.agency_name {
        Some(name) => Some(match store.find_agency_by_name(name).await? {
            Some(row) => row.id,
            None => {
                let row = store.insert_agency(name).await?;
                debug!(agency = %name, id = row.id, "created agency");
                row.id
            }
        }),
        None => None,
    };

    let course_id = match &session_src.course_name {
        Some(name) => {
            let format = session_src.course_format.as_deref();
            match store.find_course(name, format, agency_id).await? {
                Some(row) => Some(row.id),
                None => {
                    let row = store
                        .insert_course(&CourseRow {
                            id: 0,
                            name: name.clone(),
                            format: format.map(String::from),
                            agency_id,
                        })
                        .await?;
                    debug!(course = %name, id = row.id, "created course");
                    Some(row.id)
                }
            }
        }
        None => None,
    };

    let addr = &session_src.address;
    let has_location = session_src.location_name.is_some()
        || addr.street.is_some()
        || addr.raw.is_some();
    let location_id = if has_location {
        let found = store
            .find_location(
                session_src.location_name.as_deref(),
                addr.street.as_deref(),
                addr.city.as_deref(),
                addr.state.as_deref(),
                addr.postal_code.as_deref(),
            )
            .await?;
        Some(match found {
            Some(row) => row.id,
            None => {
                let row = store
                    .insert_location(&LocationRow {
                        id: 0,
                        name: session_src.location_name.clone(),
                        street: addr.street.clone(),
                        city: addr.city.clone(),
                        state: addr.state.clone(),
                        postal_code: addr.postal_code.clone(),
                        raw_address: addr.raw.clone(),
                    })
                    .await?;
                debug!(id = row.id, "created location");
                row.id
            }
        })
    } else {
        None
    };

    let instructor_id = match &session_src.instructor_name {
        Some(name) => Some(match store.find_instructor_by_name(name).await? {
            Some(mut row) => {
                apply_instructor_fields(&mut row, session_src.instructor_title.as_deref());
                store.update_instructor(&row).await?;
                row.id
            }
            None => {
                let (first_name, last_name) = split_full_name(name);
                let row = store
                    .insert_instructor(&InstructorRow {
                        id: 0,
                        full_name: name.clone(),
                        first_name,
                        last_name,
                        title: session_src.instructor_title.clone(),
                    })
                    .await?;
                debug!(instructor = %name, id = row.id, "created instructor");
                row.id
            }
        }),
        None => None,
    };

    // External id match wins over email; an email match backfills a
    // missing external id through the write-once rule.
    let mut existing_student = match &bundle.student.external_student_id {
        Some(external_id) => store.find_student_by_external_id(external_id).await?,
        None => None,
    };
    if existing_student.is_none() {
        if let Some(email) = &bundle.student.email {
            existing_student = store.find_student_by_email(email).await?;
        }
    }
    let student_id = match existing_student {
        Some(mut row) => {
            apply_student_fields(&mut row, &bundle.student);
            store.update_student(&row).await?;
            row.id
        }
        None => {
            let mut row = StudentRow::default();
            apply_student_fields(&mut row, &bundle.student);
            let row = store.insert_student(&row).await?;
            debug!(id = row.id, "created student");
            row.id
        }
    };

    let session_id = match store
        .find_session_by_external_id(&session_src.external_session_id)
        .await?
    {
        Some(mut row) => {
            apply_session_fields(
                &mut row,
                session_src,
                course_id,
                agency_id,
                location_id,
                instructor_id,
            );
            store.update_session(&row).await?;
            row.id
        }
        None => {
            let mut row = SessionRow {
                external_session_id: session_src.external_session_id.clone(),
                ..SessionRow::default()
            };
            apply_session_fields(
                &mut row,
                session_src,
                course_id,
                agency_id,
                location_id,
                instructor_id,
            );
            let row = store.insert_session(&row).await?;
            debug!(session = %row.external_session_id, id = row.id, "created session");
            row.id
        }
    };

    let order_id = match store
        .find_order_by_external_id(&bundle.order.external_order_id)
        .await?
    {
        Some(mut row) => {
            apply_order_fields(&mut row, &bundle.order, student_id);
            store.update_order(&row).await?;
            row.id
        }
        None => {
            let mut row = OrderRow {
                external_order_id: bundle.order.external_order_id.clone(),
                ..OrderRow::default()
            };
            apply_order_fields(&mut row, &bundle.order, student_id);
            let row = store.insert_order(&row).await?;
            debug!(order = %row.external_order_id, id = row.id, "created order");
            row.id
        }
    };

    let (booking_id, booking_created) = match store
        .find_booking_by_reference(&bundle.booking.reference)
        .await?
    {
        Some(mut row) => {
            apply_booking_fields(&mut row, &bundle.booking, student_id, session_id, order_id);
            store.update_booking(&row).await?;
            (row.id, false)
        }
        None => {
            let mut row = BookingRow {
                reference: bundle.booking.reference.clone(),
                ..BookingRow::default()
            };
            apply_booking_fields(&mut row, &bundle.booking, student_id, session_id, order_id);
            let row = store.insert_booking(&row).await?;
            debug!(reference = %row.reference, id = row.id, "created booking");
            (row.id, true)
        }
    };

    Ok(ResolvedBundle {
        student_id,
        agency_id,
        course_id,
        location_id,
        instructor_id,
        session_id,
        order_id,
        booking_id,
        booking_created,
    })
}

/// Upsert normalized certificates for a resolved student. Returns the
/// number of certificates written.
pub async fn resolve_certificates<S: BundleStore + ?Sized>(
    store: &mut S,
    student_id: i64,
    drafts: &[CertificateDraft],
) -> Result<usize, StorageError> {
    for draft in drafts {
        match store.find_certificate(&draft.cert_id).await? {
            Some(mut row) => {
                apply_certificate_fields(&mut row, draft);
                store.update_certificate(&row).await?;
            }
            None => {
                let mut row = CertificateRow {
                    cert_id: draft.cert_id.clone(),
                    student_id,
                    ..CertificateRow::default()
                };
                apply_certificate_fields(&mut row, draft);
                store.insert_certificate(&row).await?;
                debug!(cert_id = %draft.cert_id, "created certificate");
            }
        }
    }
    Ok(drafts.len())
}

// ------------------------------------------------------------------
// Keyed locks
// ------------------------------------------------------------------

/// Per-key async mutexes: concurrent resolutions of the same booking
/// reference serialize, distinct references proceed in parallel.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// ------------------------------------------------------------------
// Postgres store
// ------------------------------------------------------------------

/// [`BundleStore`] over one borrowed connection, so a whole resolution
/// rides a single transaction owned by the caller.
pub struct PgStore<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgStore<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

const STUDENT_COLS: &str =
    "id, external_student_id, first_name, last_name, email, phone_e164, phone_raw, external_account_id";
const SESSION_COLS: &str = "id, external_session_id, course_id, agency_id, location_id, instructor_id, start_utc, start_local, format";
const ORDER_COLS: &str = "id, external_order_id, order_number, student_id, status, amount_cents, currency_code, ordered_at_utc, ordered_at_local";
const BOOKING_COLS: &str = "id, reference, external_booking_id, external_cuid, student_id, session_id, order_id, status, canceled_at, verified_at, source_created_at, source_updated_at";
const CERT_COLS: &str = "cert_id, student_id, course_name, course_code, format, issue_date, expiry_date, issuer_org, instructor_name";

#[async_trait]
impl BundleStore for PgStore<'_> {
    async fn find_student_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<StudentRow>, StorageError> {
        let sql = format!("SELECT {STUDENT_COLS} FROM students WHERE external_student_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn find_student_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<StudentRow>, StorageError> {
        let sql = format!(
            "SELECT {STUDENT_COLS} FROM students WHERE lower(email) = lower($1) \
             ORDER BY id LIMIT 1"
        );
        Ok(sqlx::query_as(&sql)
            .bind(email)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_student(&mut self, row: &StudentRow) -> Result<StudentRow, StorageError> {
        let sql = format!(
            "INSERT INTO students (external_student_id, first_name, last_name, email, \
             phone_e164, phone_raw, external_account_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {STUDENT_COLS}"
        );
        Ok(sqlx::query_as(&sql)
            .bind(&row.external_student_id)
            .bind(&row.first_name)
            .bind(&row.last_name)
            .bind(&row.email)
            .bind(&row.phone_e164)
            .bind(&row.phone_raw)
            .bind(&row.external_account_id)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn update_student(&mut self, row: &StudentRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE students SET external_student_id = $2, first_name = $3, last_name = $4, \
             email = $5, phone_e164 = $6, phone_raw = $7, external_account_id = $8, \
             updated_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.external_student_id)
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(&row.email)
        .bind(&row.phone_e164)
        .bind(&row.phone_raw)
        .bind(&row.external_account_id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn find_agency_by_name(
        &mut self,
        name: &str,
    ) -> Result<Option<AgencyRow>, StorageError> {
        Ok(sqlx::query_as("SELECT id, name FROM agencies WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_agency(&mut self, name: &str) -> Result<AgencyRow, StorageError> {
        // Conflict target makes concurrent first-inserts converge on one row.
        Ok(sqlx::query_as(
            "INSERT INTO agencies (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id, name",
        )
        .bind(name)
        .fetch_one(&mut *self.conn)
        .await?)
    }

    async fn find_course(
        &mut self,
        name: &str,
        format: Option<&str>,
        agency_id: Option<i64>,
    ) -> Result<Option<CourseRow>, StorageError> {
        Ok(sqlx::query_as(
            "SELECT id, name, format, agency_id FROM courses \
             WHERE name = $1 AND format IS NOT DISTINCT FROM $2 \
             AND agency_id IS NOT DISTINCT FROM $3",
        )
        .bind(name)
        .bind(format)
        .bind(agency_id)
        .fetch_optional(&mut *self.conn)
        .await?)
    }

    async fn insert_course(&mut self, row: &CourseRow) -> Result<CourseRow, StorageError> {
        Ok(sqlx::query_as(
            "INSERT INTO courses (name, format, agency_id) VALUES ($1, $2, $3) \
             ON CONFLICT (name, format, agency_id) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id, name, format, agency_id",
        )
        .bind(&row.name)
        .bind(&row.format)
        .bind(row.agency_id)
        .fetch_one(&mut *self.conn)
        .await?)
    }

    async fn find_location(
        &mut self,
        name: Option<&str>,
        street: Option<&str>,
        city: Option<&str>,
        state: Option<&str>,
        postal_code: Option<&str>,
    ) -> Result<Option<LocationRow>, StorageError> {
        Ok(sqlx::query_as(
            "SELECT id, name, street, city, state, postal_code, raw_address FROM locations \
             WHERE name IS NOT DISTINCT FROM $1 AND street IS NOT DISTINCT FROM $2 \
             AND city IS NOT DISTINCT FROM $3 AND state IS NOT DISTINCT FROM $4 \
             AND postal_code IS NOT DISTINCT FROM $5",
        )
        .bind(name)
        .bind(street)
        .bind(city)
        .bind(state)
        .bind(postal_code)
        .fetch_optional(&mut *self.conn)
        .await?)
    }

    async fn insert_location(&mut self, row: &LocationRow) -> Result<LocationRow, StorageError> {
        Ok(sqlx::query_as(
            "INSERT INTO locations (name, street, city, state, postal_code, raw_address) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (name, street, city, state, postal_code) \
             DO UPDATE SET raw_address = EXCLUDED.raw_address \
             RETURNING id, name, street, city, state, postal_code, raw_address",
        )
        .bind(&row.name)
        .bind(&row.street)
        .bind(&row.city)
        .bind(&row.state)
        .bind(&row.postal_code)
        .bind(&row.raw_address)
        .fetch_one(&mut *self.conn)
        .await?)
    }

    async fn find_instructor_by_name(
        &mut self,
        full_name: &str,
    ) -> Result<Option<InstructorRow>, StorageError> {
        Ok(sqlx::query_as(
            "SELECT id, full_name, first_name, last_name, title FROM instructors \
             WHERE full_name = $1",
        )
        .bind(full_name)
        .fetch_optional(&mut *self.conn)
        .await?)
    }

    async fn insert_instructor(
        &mut self,
        row: &InstructorRow,
    ) -> Result<InstructorRow, StorageError> {
        Ok(sqlx::query_as(
            "INSERT INTO instructors (full_name, first_name, last_name, title) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (full_name) DO UPDATE SET full_name = EXCLUDED.full_name \
             RETURNING id, full_name, first_name, last_name, title",
        )
        .bind(&row.full_name)
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(&row.title)
        .fetch_one(&mut *self.conn)
        .await?)
    }

    async fn update_instructor(&mut self, row: &InstructorRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE instructors SET title = $2, updated_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.title)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn find_session_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<SessionRow>, StorageError> {
        let sql = format!("SELECT {SESSION_COLS} FROM sessions WHERE external_session_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_session(&mut self, row: &SessionRow) -> Result<SessionRow, StorageError> {
        let sql = format!(
            "INSERT INTO sessions (external_session_id, course_id, agency_id, location_id, \
             instructor_id, start_utc, start_local, format) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (external_session_id) \
             DO UPDATE SET external_session_id = EXCLUDED.external_session_id \
             RETURNING {SESSION_COLS}"
        );
        Ok(sqlx::query_as(&sql)
            .bind(&row.external_session_id)
            .bind(row.course_id)
            .bind(row.agency_id)
            .bind(row.location_id)
            .bind(row.instructor_id)
            .bind(row.start_utc)
            .bind(row.start_local)
            .bind(&row.format)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn update_session(&mut self, row: &SessionRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE sessions SET course_id = $2, agency_id = $3, location_id = $4, \
             instructor_id = $5, start_utc = $6, start_local = $7, format = $8, \
             updated_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .bind(row.course_id)
        .bind(row.agency_id)
        .bind(row.location_id)
        .bind(row.instructor_id)
        .bind(row.start_utc)
        .bind(row.start_local)
        .bind(&row.format)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn find_order_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<OrderRow>, StorageError> {
        let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE external_order_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_order(&mut self, row: &OrderRow) -> Result<OrderRow, StorageError> {
        let sql = format!(
            "INSERT INTO orders (external_order_id, order_number, student_id, status, \
             amount_cents, currency_code, ordered_at_utc, ordered_at_local) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (external_order_id) \
             DO UPDATE SET external_order_id = EXCLUDED.external_order_id \
             RETURNING {ORDER_COLS}"
        );
        Ok(sqlx::query_as(&sql)
            .bind(&row.external_order_id)
            .bind(&row.order_number)
            .bind(row.student_id)
            .bind(&row.status)
            .bind(row.amount_cents)
            .bind(&row.currency_code)
            .bind(row.ordered_at_utc)
            .bind(row.ordered_at_local)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn update_order(&mut self, row: &OrderRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE orders SET order_number = $2, student_id = $3, status = $4, \
             amount_cents = $5, currency_code = $6, ordered_at_utc = $7, \
             ordered_at_local = $8, updated_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.order_number)
        .bind(row.student_id)
        .bind(&row.status)
        .bind(row.amount_cents)
        .bind(&row.currency_code)
        .bind(row.ordered_at_utc)
        .bind(row.ordered_at_local)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn find_booking_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<BookingRow>, StorageError> {
        let sql = format!("SELECT {BOOKING_COLS} FROM bookings WHERE reference = $1");
        Ok(sqlx::query_as(&sql)
            .bind(reference)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_booking(&mut self, row: &BookingRow) -> Result<BookingRow, StorageError> {
        let sql = format!(
            "INSERT INTO bookings (reference, external_booking_id, external_cuid, student_id, \
             session_id, order_id, status, canceled_at, verified_at, source_created_at, \
             source_updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {BOOKING_COLS}"
        );
        Ok(sqlx::query_as(&sql)
            .bind(&row.reference)
            .bind(row.external_booking_id)
            .bind(&row.external_cuid)
            .bind(row.student_id)
            .bind(row.session_id)
            .bind(row.order_id)
            .bind(&row.status)
            .bind(row.canceled_at)
            .bind(row.verified_at)
            .bind(row.source_created_at)
            .bind(row.source_updated_at)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn update_booking(&mut self, row: &BookingRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE bookings SET external_booking_id = $2, external_cuid = $3, student_id = $4, \
             session_id = $5, order_id = $6, status = $7, canceled_at = $8, verified_at = $9, \
             source_created_at = $10, source_updated_at = $11, updated_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .bind(row.external_booking_id)
        .bind(&row.external_cuid)
        .bind(row.student_id)
        .bind(row.session_id)
        .bind(row.order_id)
        .bind(&row.status)
        .bind(row.canceled_at)
        .bind(row.verified_at)
        .bind(row.source_created_at)
        .bind(row.source_updated_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn find_certificate(
        &mut self,
        cert_id: &str,
    ) -> Result<Option<CertificateRow>, StorageError> {
        let sql = format!("SELECT {CERT_COLS} FROM certificates WHERE cert_id = $1");
        Ok(sqlx::query_as(&sql)
            .bind(cert_id)
            .fetch_optional(&mut *self.conn)
            .await?)
    }

    async fn insert_certificate(
        &mut self,
        row: &CertificateRow,
    ) -> Result<CertificateRow, StorageError> {
        let sql = format!(
            "INSERT INTO certificates (cert_id, student_id, course_name, course_code, format, \
             issue_date, expiry_date, issuer_org, instructor_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (cert_id) DO UPDATE SET cert_id = EXCLUDED.cert_id \
             RETURNING {CERT_COLS}"
        );
        Ok(sqlx::query_as(&sql)
            .bind(&row.cert_id)
            .bind(row.student_id)
            .bind(&row.course_name)
            .bind(&row.course_code)
            .bind(&row.format)
            .bind(row.issue_date)
            .bind(row.expiry_date)
            .bind(&row.issuer_org)
            .bind(&row.instructor_name)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn update_certificate(&mut self, row: &CertificateRow) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE certificates SET course_name = $2, course_code = $3, format = $4, \
             issue_date = $5, expiry_date = $6, issuer_org = $7, instructor_name = $8, \
             updated_at = now() WHERE cert_id = $1",
        )
        .bind(&row.cert_id)
        .bind(&row.course_name)
        .bind(&row.course_code)
        .bind(&row.format)
        .bind(row.issue_date)
        .bind(row.expiry_date)
        .bind(&row.issuer_org)
        .bind(&row.instructor_name)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rosta_core::{Address, TimestampPair};

    #[derive(Default)]
    struct MemStore {
        next_id: i64,
        students: Vec<StudentRow>,
        agencies: Vec<AgencyRow>,
        courses: Vec<CourseRow>,
        locations: Vec<LocationRow>,
        instructors: Vec<InstructorRow>,
        sessions: Vec<SessionRow>,
        orders: Vec<OrderRow>,
        bookings: Vec<BookingRow>,
        certificates: Vec<CertificateRow>,
    }

    impl MemStore {
        fn next(&mut self) -> i64 {
            self.next_id += 1;
            self.next_id
        }
    }

    #[async_trait]
    impl BundleStore for MemStore {
        async fn find_student_by_external_id(
            &mut self,
            external_id: &str,
        ) -> Result<Option<StudentRow>, StorageError> {
            Ok(self
                .students
                .iter()
                .find(|s| s.external_student_id.as_deref() == Some(external_id))
                .cloned())
        }

        async fn find_student_by_email(
            &mut self,
            email: &str,
        ) -> Result<Option<StudentRow>, StorageError> {
            Ok(self
                .students
                .iter()
                .find(|s| s.email.as_deref() == Some(email))
                .cloned())
        }

        async fn insert_student(&mut self, row: &StudentRow) -> Result<StudentRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.students.push(row.clone());
            Ok(row)
        }

        async fn update_student(&mut self, row: &StudentRow) -> Result<(), StorageError> {
            if let Some(slot) = self.students.iter_mut().find(|s| s.id == row.id) {
                *slot = row.clone();
            }
            Ok(())
        }

        async fn find_agency_by_name(
            &mut self,
            name: &str,
        ) -> Result<Option<AgencyRow>, StorageError> {
            Ok(self.agencies.iter().find(|a| a.name == name).cloned())
        }

        async fn insert_agency(&mut self, name: &str) -> Result<AgencyRow, StorageError> {
            let row = AgencyRow {
                id: self.next(),
                name: name.to_string(),
            };
            self.agencies.push(row.clone());
            Ok(row)
        }

        async fn find_course(
            &mut self,
            name: &str,
            format: Option<&str>,
            agency_id: Option<i64>,
        ) -> Result<Option<CourseRow>, StorageError> {
            Ok(self
                .courses
                .iter()
                .find(|c| {
                    c.name == name && c.format.as_deref() == format && c.agency_id == agency_id
                })
                .cloned())
        }

        async fn insert_course(&mut self, row: &CourseRow) -> Result<CourseRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.courses.push(row.clone());
            Ok(row)
        }

        async fn find_location(
            &mut self,
            name: Option<&str>,
            street: Option<&str>,
            city: Option<&str>,
            state: Option<&str>,
            postal_code: Option<&str>,
        ) -> Result<Option<LocationRow>, StorageError> {
            Ok(self
                .locations
                .iter()
                .find(|l| {
                    l.name.as_deref() == name
                        && l.street.as_deref() == street
                        && l.city.as_deref() == city
                        && l.state.as_deref() == state
                        && l.postal_code.as_deref() == postal_code
                })
                .cloned())
        }

        async fn insert_location(
            &mut self,
            row: &LocationRow,
        ) -> Result<LocationRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.locations.push(row.clone());
            Ok(row)
        }

        async fn find_instructor_by_name(
            &mut self,
            full_name: &str,
        ) -> Result<Option<InstructorRow>, StorageError> {
            Ok(self
                .instructors
                .iter()
                .find(|i| i.full_name == full_name)
                .cloned())
        }

        async fn insert_instructor(
            &mut self,
            row: &InstructorRow,
        ) -> Result<InstructorRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.instructors.push(row.clone());
            Ok(row)
        }

        async fn update_instructor(&mut self, row: &InstructorRow) -> Result<(), StorageError> {
            if let Some(slot) = self.instructors.iter_mut().find(|i| i.id == row.id) {
                *slot = row.clone();
            }
            Ok(())
        }

        async fn find_session_by_external_id(
            &mut self,
            external_id: &str,
        ) -> Result<Option<SessionRow>, StorageError> {
            Ok(self
                .sessions
                .iter()
                .find(|s| s.external_session_id == external_id)
                .cloned())
        }

        async fn insert_session(&mut self, row: &SessionRow) -> Result<SessionRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.sessions.push(row.clone());
            Ok(row)
        }

        async fn update_session(&mut self, row: &SessionRow) -> Result<(), StorageError> {
            if let Some(slot) = self.sessions.iter_mut().find(|s| s.id == row.id) {
                *slot = row.clone();
            }
            Ok(())
        }

        async fn find_order_by_external_id(
            &mut self,
            external_id: &str,
        ) -> Result<Option<OrderRow>, StorageError> {
            Ok(self
                .orders
                .iter()
                .find(|o| o.external_order_id == external_id)
                .cloned())
        }

        async fn insert_order(&mut self, row: &OrderRow) -> Result<OrderRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.orders.push(row.clone());
            Ok(row)
        }

        async fn update_order(&mut self, row: &OrderRow) -> Result<(), StorageError> {
            if let Some(slot) = self.orders.iter_mut().find(|o| o.id == row.id) {
                *slot = row.clone();
            }
            Ok(())
        }

        async fn find_booking_by_reference(
            &mut self,
            reference: &str,
        ) -> Result<Option<BookingRow>, StorageError> {
            Ok(self
                .bookings
                .iter()
                .find(|b| b.reference == reference)
                .cloned())
        }

        async fn insert_booking(&mut self, row: &BookingRow) -> Result<BookingRow, StorageError> {
            let mut row = row.clone();
            row.id = self.next();
            self.bookings.push(row.clone());
            Ok(row)
        }

        async fn update_booking(&mut self, row: &BookingRow) -> Result<(), StorageError> {
            if let Some(slot) = self.bookings.iter_mut().find(|b| b.id == row.id) {
                *slot = row.clone();
            }
            Ok(())
        }

        async fn find_certificate(
            &mut self,
            cert_id: &str,
        ) -> Result<Option<CertificateRow>, StorageError> {
            Ok(self
                .certificates
                .iter()
                .find(|c| c.cert_id == cert_id)
                .cloned())
        }

        async fn insert_certificate(
            &mut self,
            row: &CertificateRow,
        ) -> Result<CertificateRow, StorageError> {
            self.certificates.push(row.clone());
            Ok(row.clone())
        }

        async fn update_certificate(&mut self, row: &CertificateRow) -> Result<(), StorageError> {
            if let Some(slot) = self
                .certificates
                .iter_mut()
                .find(|c| c.cert_id == row.cert_id)
            {
                *slot = row.clone();
            }
            Ok(())
        }
    }

    fn pair(y: i32, mo: u32, d: u32, h: u32) -> TimestampPair {
        let utc = Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).single().unwrap();
        TimestampPair {
            utc,
            local: utc.fixed_offset(),
        }
    }

    fn sample_bundle() -> CanonicalBundle {
        CanonicalBundle {
            booking: BundleBooking {
                external_booking_id: Some(101),
                external_cuid: Some("ck_abc".into()),
                reference: "brn_A1".into(),
                status: BookingStatus::Active,
                created_at: Some(pair(2025, 11, 1, 10).utc),
                updated_at: Some(pair(2025, 11, 2, 10).utc),
                canceled_at: None,
                verified_at: None,
            },
            student: BundleStudent {
                external_student_id: Some("9001".into()),
                first_name: Some("Ann".into()),
                last_name: Some("Lee".into()),
                email: Some("ann.lee@example.com".into()),
                phone_e164: Some("+18475550123".into()),
                phone_raw: Some("(847) 555-0123".into()),
                external_account_id: Some("77".into()),
            },
            session: BundleSession {
                external_session_id: "55".into(),
                course_name: Some("Adult CPR/AED".into()),
                course_format: Some("INSTRUCTOR_LED".into()),
                agency_name: Some("Heartline Training".into()),
                start: Some(pair(2025, 12, 7, 19)),
                location_name: Some("Glenview Center".into()),
                address: Address {
                    street: Some("2331 Willow Rd".into()),
                    city: Some("Glenview".into()),
                    state: Some("IL".into()),
                    postal_code: Some("60025".into()),
                    raw: Some("2331 Willow Rd Glenview, IL 60025".into()),
                },
                instructor_name: Some("Maria Del Rio".into()),
                instructor_title: None,
            },
            order: BundleOrder {
                external_order_id: "3003".into(),
                order_number: Some("ord_777".into()),
                status: Some("PAID".into()),
                amount_cents: Some(123450),
                currency_code: Some("USD".into()),
                ordered_at: Some(pair(2025, 11, 1, 10)),
            },
        }
    }

    #[tokio::test]
    async fn resolving_the_same_bundle_twice_is_idempotent() {
        let mut store = MemStore::default();
        let bundle = sample_bundle();

        let first = resolve_bundle(&mut store, &bundle).await.unwrap();
        assert!(first.booking_created);

        let second = resolve_bundle(&mut store, &bundle).await.unwrap();
        assert!(!second.booking_created);
        assert_eq!(first.student_id, second.student_id);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(first.booking_id, second.booking_id);

        assert_eq!(store.students.len(), 1);
        assert_eq!(store.agencies.len(), 1);
        assert_eq!(store.courses.len(), 1);
        assert_eq!(store.locations.len(), 1);
        assert_eq!(store.instructors.len(), 1);
        assert_eq!(store.sessions.len(), 1);
        assert_eq!(store.orders.len(), 1);
        assert_eq!(store.bookings.len(), 1);
    }

    #[tokio::test]
    async fn email_match_backfills_missing_external_student_id() {
        let mut store = MemStore::default();

        let mut anonymous = sample_bundle();
        anonymous.student.external_student_id = None;
        resolve_bundle(&mut store, &anonymous).await.unwrap();
        assert_eq!(store.students[0].external_student_id, None);

        let resolved = resolve_bundle(&mut store, &sample_bundle()).await.unwrap();
        assert_eq!(store.students.len(), 1);
        assert_eq!(store.students[0].id, resolved.student_id);
        assert_eq!(
            store.students[0].external_student_id.as_deref(),
            Some("9001")
        );
    }

    #[tokio::test]
    async fn external_student_id_is_write_once() {
        let mut store = MemStore::default();
        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();

        let mut row = store.students[0].clone();
        let mut src = sample_bundle().student;
        src.external_student_id = Some("9999".into());
        apply_student_fields(&mut row, &src);
        assert_eq!(row.external_student_id.as_deref(), Some("9001"));
    }

    #[tokio::test]
    async fn cancellation_and_reactivation_recompute_status() {
        let mut store = MemStore::default();
        let mut canceled = sample_bundle();
        canceled.booking.canceled_at = Some(pair(2025, 11, 3, 8).utc);
        canceled.booking.status = BookingStatus::Canceled;

        resolve_bundle(&mut store, &canceled).await.unwrap();
        assert_eq!(store.bookings[0].status, "canceled");
        assert!(store.bookings[0].canceled_at.is_some());

        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();
        assert_eq!(store.bookings[0].status, "active");
        assert_eq!(store.bookings[0].canceled_at, None);
    }

    #[tokio::test]
    async fn sparse_reingest_keeps_session_links() {
        let mut store = MemStore::default();
        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();
        let linked_course = store.sessions[0].course_id;
        assert!(linked_course.is_some());

        // Same session seen again without any class-segment detail.
        let mut sparse = sample_bundle();
        sparse.session.course_name = None;
        sparse.session.agency_name = None;
        sparse.session.location_name = None;
        sparse.session.address = Address::default();
        sparse.session.instructor_name = None;
        sparse.session.start = None;

        resolve_bundle(&mut store, &sparse).await.unwrap();
        assert_eq!(store.sessions.len(), 1);
        assert_eq!(store.sessions[0].course_id, linked_course);
        assert!(store.sessions[0].location_id.is_some());
        assert!(store.sessions[0].start_utc.is_some());
    }

    #[tokio::test]
    async fn instructor_title_updates_without_resplitting_name() {
        let mut store = MemStore::default();
        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();
        assert_eq!(store.instructors[0].first_name.as_deref(), Some("Maria"));
        assert_eq!(store.instructors[0].title, None);

        let mut titled = sample_bundle();
        titled.session.instructor_title = Some("RN".into());
        resolve_bundle(&mut store, &titled).await.unwrap();

        assert_eq!(store.instructors.len(), 1);
        assert_eq!(store.instructors[0].title.as_deref(), Some("RN"));
        assert_eq!(store.instructors[0].first_name.as_deref(), Some("Maria"));
        assert_eq!(
            store.instructors[0].last_name.as_deref(),
            Some("Del Rio")
        );
    }

    #[tokio::test]
    async fn same_venue_name_at_new_address_is_a_new_location() {
        let mut store = MemStore::default();
        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();

        let mut moved = sample_bundle();
        moved.session.address.street = Some("900 Lake St".into());
        moved.session.address.raw = Some("900 Lake St Glenview, IL 60025".into());
        resolve_bundle(&mut store, &moved).await.unwrap();

        assert_eq!(store.locations.len(), 2);
    }

    #[tokio::test]
    async fn order_amount_and_currency_refresh_together() {
        let mut store = MemStore::default();
        let mut unpriced = sample_bundle();
        unpriced.order.amount_cents = None;
        unpriced.order.currency_code = None;
        resolve_bundle(&mut store, &unpriced).await.unwrap();
        assert_eq!(store.orders[0].amount_cents, None);

        resolve_bundle(&mut store, &sample_bundle()).await.unwrap();
        assert_eq!(store.orders.len(), 1);
        assert_eq!(store.orders[0].amount_cents, Some(123450));
        assert_eq!(store.orders[0].currency_code.as_deref(), Some("USD"));
    }

    #[tokio::test]
    async fn certificates_upsert_by_cert_id() {
        let mut store = MemStore::default();
        let resolved = resolve_bundle(&mut store, &sample_bundle()).await.unwrap();

        let mut draft = CertificateDraft {
            cert_id: "RC123".into(),
            course_name: Some("Adult First Aid/CPR".into()),
            course_code: Some("FA-100".into()),
            format: Some("blended".into()),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 15),
            expiry_date: NaiveDate::from_ymd_opt(2027, 1, 15),
            issuer_org: Some("Heartline Training".into()),
            instructor_name: Some("Maria Del Rio".into()),
        };
        resolve_certificates(&mut store, resolved.student_id, &[draft.clone()])
            .await
            .unwrap();
        assert_eq!(store.certificates.len(), 1);

        draft.expiry_date = NaiveDate::from_ymd_opt(2025, 4, 15);
        resolve_certificates(&mut store, resolved.student_id, &[draft])
            .await
            .unwrap();
        assert_eq!(store.certificates.len(), 1);
        assert_eq!(
            store.certificates[0].expiry_date,
            NaiveDate::from_ymd_opt(2025, 4, 15)
        );
        assert_eq!(store.certificates[0].student_id, resolved.student_id);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_only_same_key() {
        let locks = KeyedLocks::new();
        let guard_a = locks.acquire("brn_A1").await;
        // A different key must not block.
        let _guard_b = locks.acquire("brn_B2").await;
        drop(guard_a);
        let _guard_a2 = locks.acquire("brn_A1").await;
    }

    #[test]
    fn timeouts_and_io_faults_are_retryable() {
        assert!(StorageError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_retryable());
    }
}
