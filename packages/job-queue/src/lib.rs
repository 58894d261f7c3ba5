//! Durable job queue backed by PostgreSQL.
//!
//! Jobs are rows in `queue_jobs`. A pool of workers locks one row at a time
//! with `FOR UPDATE SKIP LOCKED`, runs the registered handler inside a
//! savepoint and records every attempt in `queue_jobs_history`. Recurring
//! work is declared with cron specs and materialized into the same table up
//! to a rolling horizon.
//!
//! ```ignore
//! use job_queue::{JobOptions, JobQueue, PostgresJobQueue, QueueConfig};
//!
//! let queue = PostgresJobQueue::new(pool, QueueConfig::default());
//! queue
//!     .register_job_func(|_ctx, job: SendReceipt| async move {
//!         mailer::send(job.order_id).await
//!     })
//!     .await?;
//! queue.enqueue(SendReceipt { order_id }, JobOptions::default()).await?;
//! queue.shutdown().await?;
//! ```

pub mod common;
pub mod config;
pub mod error;
pub mod jobs;

pub use config::{Config, QueueConfig};
pub use error::{JobError, Result};
pub use jobs::{
    Backoff, HistoryFilter, HistoryRecord, IntoJobPayloads, Job, JobContext, JobOptions,
    JobPayload, JobQueue, JobTable, JobsRepository, MemoryQueue, NoopJobQueue, Page,
    PayloadContext, PendingJob, PersistencePayload, PollStrategy, PostgresJobQueue, QueueKpis,
    QueueStats, ScheduleRecord, ScheduleSpec, TableSizes, WorkerPool, DEFAULT_QUEUE_NAME,
};

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::PgPool;

/// Schema for the queue tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply the queue schema to the given database.
pub async fn migrate(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
