use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rosta_sync::{
    FileDocumentSource, IngestPipeline, LogNotifier, NoCertificates, SyncConfig,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rosta-cli")]
#[command(about = "Roster sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest bookings by reference from a snapshot directory.
    Ingest {
        /// Booking references to ingest.
        references: Vec<String>,
        /// File with one booking reference per line.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Snapshot directory; overrides ROSTA_SNAPSHOT_DIR.
        #[arg(long)]
        snapshots: Option<PathBuf>,
    },
    /// Parse one snapshot and print the canonical bundle as JSON.
    Parse {
        reference: String,
        html_path: PathBuf,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Ingest {
            references,
            file,
            snapshots,
        } => {
            let mut references = references;
            if let Some(path) = file {
                let listed = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading reference list {}", path.display()))?;
                references.extend(
                    listed
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(String::from),
                );
            }
            if references.is_empty() {
                anyhow::bail!("no booking references given");
            }

            let snapshot_dir = snapshots.unwrap_or_else(|| config.snapshot_dir.clone());
            let pool = PgPoolOptions::new()
                .connect(&config.database_url)
                .await
                .context("connecting to database")?;
            rosta_storage::run_migrations(&pool).await?;

            let pipeline = IngestPipeline::new(
                pool,
                Arc::new(FileDocumentSource::new(snapshot_dir)),
                Arc::new(NoCertificates),
                Arc::new(LogNotifier),
                config.tx_timeout,
            );

            let results = pipeline.run_many(&references).await;
            let mut failed = 0usize;
            for (reference, result) in &results {
                match result {
                    Ok(receipt) => println!(
                        "{reference}: booking_id={} created={}",
                        receipt.booking_id, receipt.booking_created
                    ),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{reference}: {err}");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} ingests failed", results.len());
            }
        }
        Commands::Parse {
            reference,
            html_path,
        } => {
            let page = std::fs::read_to_string(&html_path)
                .with_context(|| format!("reading {}", html_path.display()))?;
            let bundle = rosta_flight::parse_booking_document(&page, &reference)?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
        Commands::Migrate => {
            let pool = PgPoolOptions::new()
                .connect(&config.database_url)
                .await
                .context("connecting to database")?;
            rosta_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
