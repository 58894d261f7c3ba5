//! Dispatch loop.
//!
//! Each worker repeats one cycle until the pool is cancelled:
//!
//! ```text
//! BEGIN
//!   lock next row (FOR UPDATE SKIP LOCKED)      none → ROLLBACK, sleep poll_interval
//!   stamp gitHashProcessed, open history record
//!   SAVEPOINT queue_handler
//!   handler(JobContext, job)                    panics are caught
//!   ok  → RELEASE, DELETE row, close history    RELEASE fails → treated as err
//!   err → ROLLBACK TO, bump error_count + run_at, close history
//! COMMIT
//! ```
//!
//! Cancellation is checked between cycles only; a running handler always
//! finishes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::context::{JobContext, SharedTx};
use super::history;
use super::job::{self, PendingJob};
use super::payload::PersistencePayload;
use super::registry::JobRegistry;
use crate::common::telemetry;
use crate::error::JobError;

const MAX_BACKOFF: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Order in which eligible rows are picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollStrategy {
    /// Lowest priority value first, then earliest `run_at`.
    #[default]
    PriorityFirst,
    /// Earliest `run_at` first, then lowest priority value.
    RunAtFirst,
}

impl PollStrategy {
    pub(crate) fn order_by(self) -> &'static str {
        match self {
            PollStrategy::PriorityFirst => "priority, run_at",
            PollStrategy::RunAtFirst => "run_at, priority",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown poll strategy {0:?}, expected \"priority\" or \"run_at\"")]
pub struct UnknownPollStrategy(String);

impl FromStr for PollStrategy {
    type Err = UnknownPollStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" | "priority_first" => Ok(PollStrategy::PriorityFirst),
            "run_at" | "run_at_first" => Ok(PollStrategy::RunAtFirst),
            _ => Err(UnknownPollStrategy(s.to_string())),
        }
    }
}

/// Delay before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// `error_count^4 + 3` seconds, capped at 30 days.
    #[default]
    Exponential,
    Fixed(Duration),
    /// Retry on the next poll.
    None,
}

impl Backoff {
    /// `error_count` includes the attempt that just failed.
    pub fn delay(&self, error_count: i32) -> Duration {
        match self {
            Backoff::Exponential => {
                let n = u64::try_from(error_count).unwrap_or(0);
                Duration::from_secs(n.saturating_pow(4).saturating_add(3)).min(MAX_BACKOFF)
            }
            Backoff::Fixed(delay) => *delay,
            Backoff::None => Duration::ZERO,
        }
    }
}

/// State shared by every worker of one running pool.
pub(crate) struct PoolContext {
    pub pool: PgPool,
    pub queue: String,
    pub git_hash: String,
    pub strategy: PollStrategy,
    pub backoff: Backoff,
    pub poll_interval: Duration,
    pub registry: JobRegistry,
    pub job_types: Vec<String>,
    pub shutdown: CancellationToken,
}

pub(crate) struct Worker {
    id: usize,
    pool: Arc<PoolContext>,
}

type LockTx = Transaction<'static, Postgres>;

impl Worker {
    pub(crate) fn new(id: usize, pool: Arc<PoolContext>) -> Self {
        Self { id, pool }
    }

    pub(crate) async fn run(self) -> Result<(), JobError> {
        debug!(worker = self.id, queue = %self.pool.queue, "worker started");

        while !self.pool.shutdown.is_cancelled() {
            let worked = match self.work_one().await {
                Ok(worked) => worked,
                Err(e) => {
                    error!(worker = self.id, error = %e, "job dispatch cycle failed");
                    false
                }
            };
            if worked {
                continue;
            }

            tokio::select! {
                _ = self.pool.shutdown.cancelled() => break,
                _ = sleep(self.pool.poll_interval) => {}
            }
        }

        debug!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// Run one job if one is eligible. Returns whether a row was locked.
    async fn work_one(&self) -> sqlx::Result<bool> {
        let ctx = &self.pool;
        let mut tx = ctx.pool.begin().await?;

        let Some(job) = job::lock_next(&mut tx, &ctx.queue, &ctx.job_types, ctx.strategy).await?
        else {
            tx.rollback().await?;
            return Ok(false);
        };
        let run_count = job.error_count;

        let decoded = PersistencePayload::from_args(&job.args).map(|mut payload| {
            payload.git_hash_processed = ctx.git_hash.clone();
            payload
        });
        let args = match &decoded {
            Ok(payload) => serde_json::to_value(payload).unwrap_or_else(|_| job.args.clone()),
            Err(_) => job.args.clone(),
        };

        job::update_args(&mut tx, job.job_id, &args).await?;
        history::record_started(&mut tx, &job, &args).await?;
        sqlx::query("SAVEPOINT queue_handler")
            .execute(&mut *tx)
            .await?;

        let started = Instant::now();
        let shared: SharedTx = Arc::new(Mutex::new(Some(tx)));
        let outcome = match decoded {
            Ok(payload) => self.run_handler(&shared, &job, payload).await,
            Err(e) => Err(format!("invalid job payload: {e}")),
        };
        let elapsed = started.elapsed();

        // Clones of the context that outlive the handler see a closed transaction.
        let Some(mut tx) = shared.lock().await.take() else {
            error!(job_id = %job.job_id, "lock transaction missing after handler");
            return Ok(true);
        };

        let outcome = match outcome {
            Ok(()) => match sqlx::query("RELEASE SAVEPOINT queue_handler")
                .execute(&mut *tx)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("job left its transaction aborted: {e}")),
            },
            Err(message) => Err(message),
        };

        let outcome_label = match outcome {
            Ok(()) => {
                let written = self.finish_succeeded(&mut tx, &job).await;
                match settle(tx, written).await {
                    Ok(()) => {
                        debug!(
                            job_id = %job.job_id,
                            job_type = %job.job_type,
                            run_count,
                            "job succeeded"
                        );
                        "success"
                    }
                    Err(e) => {
                        let error = JobError::WorkerFailed(format!("could not complete job: {e}"));
                        self.record_failure(&job, &args, &error.to_string()).await?;
                        "failure"
                    }
                }
            }
            Err(message) => {
                let error = JobError::WorkerFailed(message).to_string();
                let written = self.finish_failed(&mut tx, &job, &error).await;
                match settle(tx, written).await {
                    Ok(()) => warn!(
                        job_id = %job.job_id,
                        job_type = %job.job_type,
                        run_count,
                        retry_in_secs = self.retry_in(&job).as_secs_f64(),
                        error = %error,
                        "job failed"
                    ),
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "lock transaction lost while recording failure");
                        self.record_failure(&job, &args, &error).await?;
                    }
                }
                "failure"
            }
        };

        metrics::counter!(
            "jobs_processed_total",
            "queue" => job.queue.clone(),
            "job_type" => job.job_type.clone(),
            "outcome" => outcome_label
        )
        .increment(1);
        metrics::histogram!(
            "job_duration_seconds",
            "queue" => job.queue.clone(),
            "job_type" => job.job_type.clone()
        )
        .record(elapsed.as_secs_f64());

        Ok(true)
    }

    async fn finish_succeeded(&self, tx: &mut LockTx, job: &PendingJob) -> sqlx::Result<()> {
        job::delete(tx, job.job_id).await?;
        history::record_finished(tx, job.job_id, job.error_count, None).await
    }

    /// Roll the handler's writes back and push the row out by the backoff.
    async fn finish_failed(
        &self,
        tx: &mut LockTx,
        job: &PendingJob,
        error: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("ROLLBACK TO SAVEPOINT queue_handler")
            .execute(&mut **tx)
            .await?;
        job::mark_failed(tx, job.job_id, error, self.retry_in(job)).await?;
        history::record_finished(tx, job.job_id, job.error_count, Some(error)).await
    }

    /// Record a failed attempt in a fresh transaction after the lock
    /// transaction was lost. Skips the row if another worker already holds it.
    async fn record_failure(
        &self,
        job: &PendingJob,
        args: &serde_json::Value,
        error: &str,
    ) -> sqlx::Result<()> {
        let mut tx = self.pool.pool.begin().await?;
        if job::lock_by_id(&mut tx, job.job_id).await?.is_none() {
            tx.rollback().await?;
            return Ok(());
        }

        history::record_started(&mut tx, job, args).await?;
        job::mark_failed(&mut tx, job.job_id, error, self.retry_in(job)).await?;
        history::record_finished(&mut tx, job.job_id, job.error_count, Some(error)).await?;
        tx.commit().await?;

        warn!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            run_count = job.error_count,
            error = %error,
            "job failed"
        );
        Ok(())
    }

    fn retry_in(&self, job: &PendingJob) -> Duration {
        self.pool.backoff.delay(job.error_count.saturating_add(1))
    }

    /// Run the handler with the lock transaction shared through its context.
    async fn run_handler(
        &self,
        tx: &SharedTx,
        job: &PendingJob,
        payload: PersistencePayload,
    ) -> Result<(), String> {
        let ctx = JobContext {
            job_id: job.job_id,
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority,
            run_count: job.error_count,
            run_at: job.run_at,
            user_id: payload.ctx.user_id.clone(),
            tx: tx.clone(),
            shutdown: self.pool.shutdown.clone(),
        };

        let span = info_span!(
            "job",
            job_id = %job.job_id,
            queue = %job.queue,
            job_type = %job.job_type,
            priority = job.priority,
            run_count = job.error_count,
            run_at = %job.run_at,
            otel.status_code = field::Empty,
            otel.status_message = field::Empty
        );
        span.set_parent(telemetry::extract(&payload.ctx.carrier));

        let handler = self
            .pool
            .registry
            .execute(&job.job_type, ctx, payload.job_data)
            .instrument(span.clone());
        let result = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("job panicked: {}", panic_message(&*panic))),
        };

        if let Err(message) = &result {
            mark_span_failed(&span, message);
        }
        result
    }
}

/// Commit if `written` succeeded, otherwise roll back so the row lock is
/// released before the caller retries elsewhere.
async fn settle(tx: LockTx, written: sqlx::Result<()>) -> sqlx::Result<()> {
    match written {
        Ok(()) => tx.commit().await,
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "rollback after failed write");
            }
            Err(e)
        }
    }
}

/// Flag the span as failed for the OpenTelemetry exporter.
fn mark_span_failed(span: &Span, message: &str) {
    span.record("otel.status_code", "ERROR");
    span.record("otel.status_message", message);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
