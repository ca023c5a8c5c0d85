use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod allocator;
mod calendar;
mod config;
mod db;
mod drain;
mod engine;
mod error;
mod escalation;
mod intake;
mod lifecycle;
mod mapping;
mod models;
mod notify;
mod reconcile;
mod report;
mod retry;
mod store;

use crate::config::Config;
use crate::drain::{Drain, DrainOutcome, OutboxTransport};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::notify::NotificationQueue;
use crate::retry::RetryingLedger;

#[derive(Parser)]
#[command(name = "behaviour-tracker")]
#[command(about = "Daily behaviour incident and detention tracker", long_about = None)]
struct Cli {
    /// JSON run configuration
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a sheet (header row included) from a CSV file
    Import {
        #[arg(long)]
        sheet: String,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the daily incident export and detention lifecycle
    Process {
        /// Reported incidents as JSON or CSV
        #[arg(long)]
        incidents: PathBuf,
        /// Override today's date (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Deliver queued emails, following chained triggers
    Drain,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { sheet, csv } => {
            let store = db::PgLedger::new(pool.clone());
            let imported = db::import_csv(&store, &sheet, &csv).await?;
            println!("Imported {imported} rows into {sheet} from {}.", csv.display());
        }
        Commands::Process { incidents, today } => {
            let config = Config::load(&cli.config)?;
            let batch = intake::read_batch(&incidents)?;
            let today = today.unwrap_or_else(|| Utc::now().date_naive());

            let store = RetryingLedger::new(db::PgLedger::new(pool.clone()), config.retry);
            let queue = db::PgQueue::new(pool.clone());
            let engine = Engine::new(&config, &store, &queue, &calendar::LogCalendar);

            match engine.run(batch, today).await {
                Ok(summary) => println!(
                    "Processed {} rows: {} resolved, {} escalated, {} cancelled, {} detentions allocated, {} emails queued.",
                    summary.scanned_rows,
                    summary.resolved,
                    summary.escalated,
                    summary.cancelled,
                    summary.allocated,
                    summary.emails_queued
                ),
                Err(EngineError::AlreadyRun { last_exported }) => {
                    println!("Export has already run today (last exported {last_exported}).");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Drain => {
            let config = Config::load(&cli.config)?;
            let queue = db::PgQueue::new(pool.clone());
            let outbox = config.outbox_dir.clone().unwrap_or_else(|| PathBuf::from("outbox"));
            let transport = OutboxTransport::new(outbox);
            let gate = Semaphore::new(1);
            let drain = Drain::new(&queue, &transport, &gate, config.drain, &config.sender_email);

            let mut sent = 0;
            while queue.pop_trigger().await? {
                match drain.run().await? {
                    DrainOutcome::Busy => break,
                    DrainOutcome::Drained { processed } | DrainOutcome::Chained { processed } => {
                        sent += processed
                    }
                }
            }
            info!(sent, "drain complete");
            println!("Processed {sent} queued emails.");
        }
    }

    Ok(())
}
