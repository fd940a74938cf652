//! Ingest orchestration: fetch a booking page, normalize it, resolve it
//! inside one transaction, then sync certificates and notify.
//!
//! Fetching is behind [`DocumentSource`] so the pipeline runs the same
//! against a live scraper or a directory of page snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rosta_core::IngestReceipt;
use rosta_flight::{normalize_certificate, parse_booking_document, FlightError, RawCertificate};
use rosta_storage::{
    resolve_bundle, resolve_certificates, KeyedLocks, PgStore, StorageError,
};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rosta-sync";

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/rosta";
pub const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 30;

/// Runtime configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub snapshot_dir: PathBuf,
    pub tx_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let snapshot_dir = std::env::var("ROSTA_SNAPSHOT_DIR")
            .unwrap_or_else(|_| DEFAULT_SNAPSHOT_DIR.to_string());
        let tx_timeout_secs = match std::env::var("ROSTA_TX_TIMEOUT_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid ROSTA_TX_TIMEOUT_SECS: {raw:?}"))?,
            Err(_) => DEFAULT_TX_TIMEOUT_SECS,
        };
        Ok(SyncConfig {
            database_url,
            snapshot_dir: PathBuf::from(snapshot_dir),
            tx_timeout: Duration::from_secs(tx_timeout_secs),
        })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error(transparent)]
    Parse(#[from] FlightError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Fetch and transient storage faults may be retried; a parse failure
    /// means the page itself is bad and a retry would see it again.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Fetch(_) => true,
            IngestError::Parse(_) => false,
            IngestError::Storage(err) => err.is_retryable(),
        }
    }
}

/// Raw booking page text by reference.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_booking_page(&self, reference: &str) -> anyhow::Result<String>;
}

/// Scraped certificate records for one student email.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn certificates_for_email(&self, email: &str) -> anyhow::Result<Vec<RawCertificate>>;
}

/// Receives the receipt after a committed ingest. Failures here never
/// roll anything back.
#[async_trait]
pub trait IngestNotifier: Send + Sync {
    async fn notify(&self, receipt: &IngestReceipt) -> anyhow::Result<()>;
}

/// Serves `<reference>.html` files out of a snapshot directory.
pub struct FileDocumentSource {
    dir: PathBuf,
}

impl FileDocumentSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl DocumentSource for FileDocumentSource {
    async fn fetch_booking_page(&self, reference: &str) -> anyhow::Result<String> {
        let path = self.dir.join(format!("{reference}.html"));
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))
    }
}

/// Certificate source for deployments that only ingest bookings.
pub struct NoCertificates;

#[async_trait]
impl CertificateSource for NoCertificates {
    async fn certificates_for_email(&self, _email: &str) -> anyhow::Result<Vec<RawCertificate>> {
        Ok(Vec::new())
    }
}

/// Notifier that just logs the receipt.
pub struct LogNotifier;

#[async_trait]
impl IngestNotifier for LogNotifier {
    async fn notify(&self, receipt: &IngestReceipt) -> anyhow::Result<()> {
        info!(
            reference = %receipt.booking_reference,
            booking_id = receipt.booking_id,
            created = receipt.booking_created,
            certificates = receipt.certificates.len(),
            "ingest receipt"
        );
        Ok(())
    }
}

pub struct IngestPipeline {
    pool: PgPool,
    documents: Arc<dyn DocumentSource>,
    certificates: Arc<dyn CertificateSource>,
    notifier: Arc<dyn IngestNotifier>,
    locks: KeyedLocks,
    tx_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        pool: PgPool,
        documents: Arc<dyn DocumentSource>,
        certificates: Arc<dyn CertificateSource>,
        notifier: Arc<dyn IngestNotifier>,
        tx_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            documents,
            certificates,
            notifier,
            locks: KeyedLocks::new(),
            tx_timeout,
        }
    }

    /// Ingest one booking by reference.
    ///
    /// The whole entity resolution rides a single transaction under a
    /// per-reference lock, so two ingests of the same reference can never
    /// interleave. Certificate sync runs after the commit and is
    /// best-effort: its failure leaves the booking in place.
    pub async fn run_for_reference(&self, reference: &str) -> Result<IngestReceipt, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, reference);
        self.run_inner(run_id, reference).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        reference: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let page = self
            .documents
            .fetch_booking_page(reference)
            .await
            .map_err(IngestError::Fetch)?;
        let bundle = parse_booking_document(&page, reference)?;

        let _guard = self.locks.acquire(reference).await;

        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let resolved = {
            let mut store = PgStore::new(&mut tx);
            match tokio::time::timeout(self.tx_timeout, resolve_bundle(&mut store, &bundle)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(StorageError::Timeout(self.tx_timeout).into()),
            }
        };
        tx.commit().await.map_err(StorageError::from)?;

        let mut certificates = Vec::new();
        if let Some(email) = &bundle.student.email {
            match self.certificates.certificates_for_email(email).await {
                Ok(raw) => {
                    certificates = raw.iter().filter_map(normalize_certificate).collect();
                    if !certificates.is_empty() {
                        if let Err(err) = self
                            .sync_certificates(resolved.student_id, &certificates)
                            .await
                        {
                            warn!(%err, "certificate sync failed after booking commit");
                        }
                    }
                }
                Err(err) => warn!(%err, "certificate fetch failed"),
            }
        }

        let receipt = IngestReceipt {
            run_id,
            booking_reference: reference.to_string(),
            booking_id: resolved.booking_id,
            student_id: resolved.student_id,
            session_id: resolved.session_id,
            order_id: resolved.order_id,
            booking_created: resolved.booking_created,
            certificates,
            finished_at: Utc::now(),
        };
        if let Err(err) = self.notifier.notify(&receipt).await {
            warn!(%err, "notifier failed");
        }
        info!(
            booking_id = receipt.booking_id,
            created = receipt.booking_created,
            "ingest complete"
        );
        Ok(receipt)
    }

    async fn sync_certificates(
        &self,
        student_id: i64,
        drafts: &[rosta_core::CertificateDraft],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut store = PgStore::new(&mut tx);
        resolve_certificates(&mut store, student_id, drafts).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ingest a batch sequentially; one bad reference never stops the
    /// rest.
    pub async fn run_many(
        &self,
        references: &[String],
    ) -> Vec<(String, Result<IngestReceipt, IngestError>)> {
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            let result = self.run_for_reference(reference).await;
            if let Err(err) = &result {
                warn!(reference = %reference, %err, retryable = err.is_retryable(), "ingest failed");
            }
            results.push((reference.clone(), result));
        }
        results
    }
}
