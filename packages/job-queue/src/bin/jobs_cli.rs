//! Operator CLI for the job queue.
//!
//! Prints JSON on stdout; logs go to stderr (`RUST_LOG` controls verbosity).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use job_queue::{Config, HistoryFilter, JobTable, JobsRepository, Page};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "jobs_cli")]
#[command(about = "Inspect and maintain the job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the queue schema
    Migrate,

    /// List known queues
    Queues,

    /// Show the next pending jobs of a queue
    Pending {
        #[arg(long, default_value = "Default")]
        queue: String,
    },

    /// Show KPIs and derived stats of a queue
    Stats {
        #[arg(long, default_value = "Default")]
        queue: String,
    },

    /// List worker pools with a recent heartbeat
    Pools,

    /// List registered schedules
    Schedules,

    /// List finished jobs
    History {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Delete a pending job
    Delete { job_id: Uuid },

    /// Move a pending job to a new run time (RFC 3339)
    Reschedule {
        job_id: Uuid,
        #[arg(long)]
        at: DateTime<Utc>,
    },

    /// Delete history older than the given number of days
    Prune {
        #[arg(long)]
        days: i64,
    },

    /// Drop payloads of history older than the given number of days
    PrunePayload {
        #[arg(long, default_value = "Default")]
        queue: String,
        #[arg(long)]
        days: i64,
    },

    /// Reclaim storage of a queue table (jobs, history, pools, schedules)
    Vacuum { table: JobTable },

    /// Show table sizes
    Sizes,
}

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct HistoryPage {
    total: i64,
    records: Vec<job_queue::HistoryRecord>,
}

fn output<T: Serialize>(data: T) -> Result<()> {
    let response = Response {
        success: true,
        message: None,
        data: Some(data),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn output_message(success: bool, message: impl Into<String>) -> Result<()> {
    let response: Response<()> = Response {
        success,
        message: Some(message.into()),
        data: None,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,job_queue=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let pool = get_pool().await?;

    match run(pool, cli.command).await {
        Ok(()) => Ok(()),
        Err(e) => output_message(false, format!("{e:#}")),
    }
}

async fn get_pool() -> Result<PgPool> {
    let config = Config::from_env().context("Failed to load configuration")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}

/// `now - days`, rejecting spans chrono cannot represent.
fn cutoff(days: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_days(days)
        .and_then(|span| Utc::now().checked_sub_signed(span))
        .ok_or_else(|| anyhow!("--days {days} is out of range"))
}

async fn run(pool: PgPool, command: Commands) -> Result<()> {
    let repo = JobsRepository::new(pool.clone());
    match command {
        Commands::Migrate => {
            job_queue::migrate(&pool)
                .await
                .context("Failed to run migrations")?;
            output_message(true, "migrations applied")
        }
        Commands::Queues => output(repo.queues().await?),
        Commands::Pending { queue } => output(repo.pending_jobs(&queue).await?),
        Commands::Stats { queue } => output(repo.queue_stats(&queue).await?),
        Commands::Pools => output(repo.worker_pools().await?),
        Commands::Schedules => output(repo.schedules().await?),
        Commands::History {
            queue,
            job_type,
            limit,
            offset,
        } => {
            let filter = HistoryFilter { queue, job_type };
            let total = repo.finished_jobs_total(&filter).await?;
            let records = repo.finished_jobs(&filter, Page { limit, offset }).await?;
            output(HistoryPage { total, records })
        }
        Commands::Delete { job_id } => {
            repo.delete_job(job_id).await?;
            output_message(true, format!("deleted job {job_id}"))
        }
        Commands::Reschedule { job_id, at } => {
            repo.reschedule_job(job_id, at).await?;
            output_message(true, format!("job {job_id} runs at {at}"))
        }
        Commands::Prune { days } => {
            let removed = repo.prune_history(cutoff(days)?).await?;
            output(serde_json::json!({ "removed": removed }))
        }
        Commands::PrunePayload { queue, days } => {
            let pruned = repo
                .prune_history_payload(&queue, cutoff(days)?)
                .await?;
            output(serde_json::json!({ "pruned": pruned }))
        }
        Commands::Vacuum { table } => {
            repo.vacuum(table).await?;
            output_message(true, format!("vacuumed {}", table.table_name()))
        }
        Commands::Sizes => output(repo.table_sizes().await?),
    }
}
