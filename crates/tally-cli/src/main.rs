//! Tally operator CLI.
//!
//! Reads the same environment as the engine (DATABASE_URL, AUDIT_SIGNING_SECRET, ...).
//! `score` works offline; every other command needs the database.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tally_cli::{media_type_for_path, render_quarantine_row, render_report, score_bytes};
use tally_core::{AdmissionConfig, IntakeConfig};
use tally_db::{connect, run_migrations, CounterRepository, PgCounterRepository, QuarantineRepository};
use tally_infra::{init_telemetry, LogFormat};
use tally_services::{AuditSigner, AuditTrail, Stores};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tally", about = "Tally intake engine operator tools")]
struct Cli {
    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the admission checks on an image and print its quality report
    Score {
        /// Path to the image
        file: PathBuf,
        /// Declared media type; guessed from the extension when omitted
        #[arg(long)]
        media_type: Option<String>,
    },
    /// Apply database migrations
    Migrate,
    /// Re-verify the signatures of a tenant's audit entries
    VerifyAudit {
        #[arg(long, value_name = "UUID")]
        tenant: Uuid,
        /// Maximum number of entries to check, oldest first
        #[arg(long, default_value = "100000")]
        limit: i64,
    },
    /// List pending quarantine records for a tenant
    Quarantine {
        #[arg(long, value_name = "UUID")]
        tenant: Uuid,
    },
    /// Drop expired rate-limit counter buckets
    PurgeCounters,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("tally-cli", LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Score { file, media_type } => {
            let admission = match IntakeConfig::from_env() {
                Ok(config) => config.admission,
                Err(e) => {
                    tracing::debug!(error = %e, "Engine configuration incomplete, scoring with defaults");
                    AdmissionConfig::default()
                }
            };
            let media_type = match media_type {
                Some(declared) => declared,
                None => media_type_for_path(&file)
                    .map(str::to_string)
                    .with_context(|| format!("Cannot infer media type of {}; pass --media-type", file.display()))?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let report = score_bytes(&data, &media_type, &admission)
                .map_err(|e| anyhow::anyhow!("{} ({})", e, e.reason_code()))?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{}", render_report(&report));
            }
        }
        Commands::Migrate => {
            let config = IntakeConfig::from_env()?;
            let pool = connect(&config.base).await?;
            run_migrations(&pool).await?;
            println!("Migrations applied");
        }
        Commands::VerifyAudit { tenant, limit } => {
            let config = IntakeConfig::from_env()?;
            let pool = connect(&config.base).await?;
            let stores = Stores::postgres(pool, config.ledger.commit_lock_timeout_ms);
            let signer = AuditSigner::new(&config.base.audit_signing_secret)?;
            let trail = AuditTrail::new(stores.audit.clone(), signer);

            let verification = trail.verify_tenant(tenant, limit).await?;
            if cli.json {
                print_json(&verification)?;
            } else {
                println!("Checked {} audit entries for tenant {}", verification.checked, tenant);
                for id in &verification.invalid {
                    println!("  INVALID SIGNATURE  {}", id);
                }
            }
            if !verification.is_intact() {
                bail!(
                    "{} of {} audit entries failed verification",
                    verification.invalid.len(),
                    verification.checked
                );
            }
        }
        Commands::Quarantine { tenant } => {
            let config = IntakeConfig::from_env()?;
            let pool = connect(&config.base).await?;
            let stores = Stores::postgres(pool, config.ledger.commit_lock_timeout_ms);

            let records = stores.quarantine.list_pending_quarantine(tenant).await?;
            if cli.json {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("No pending quarantine records");
            } else {
                for record in &records {
                    println!("{}", render_quarantine_row(record));
                }
            }
        }
        Commands::PurgeCounters => {
            let config = IntakeConfig::from_env()?;
            let pool = connect(&config.base).await?;
            let removed = PgCounterRepository::new(pool).purge_expired(Utc::now()).await?;
            if cli.json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {} expired counter buckets", removed);
            }
        }
    }

    Ok(())
}
