use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{JobError, Result};

pub(crate) type SharedTx = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Everything a handler knows about the attempt it is running.
///
/// The transaction is the one the row was locked under. Writes made through
/// [`JobContext::tx`] commit together with the job's removal and are rolled
/// back if the handler fails. Once the handler returns the worker takes the
/// transaction back; clones of the context kept past that point get
/// [`JobError::TransactionClosed`] from [`JobContext::tx`].
///
/// ```ignore
/// queue
///     .register_job_func(|ctx: JobContext, job: ArchiveOrder| async move {
///         let mut tx = ctx.tx().await?;
///         sqlx::query("UPDATE orders SET archived = true WHERE id = $1")
///             .bind(job.order_id)
///             .execute(&mut **tx)
///             .await?;
///         Ok(())
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct JobContext {
    pub(crate) job_id: Uuid,
    pub(crate) queue: String,
    pub(crate) job_type: String,
    pub(crate) priority: i16,
    pub(crate) run_count: i32,
    pub(crate) run_at: DateTime<Utc>,
    pub(crate) user_id: Option<String>,
    pub(crate) tx: SharedTx,
    pub(crate) shutdown: CancellationToken,
}

impl JobContext {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    /// Zero for the first attempt, incremented on every retry.
    pub fn run_count(&self) -> i32 {
        self.run_count
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    /// Actor that enqueued the job, if one was given.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The transaction the job row is locked under.
    ///
    /// Fails once the attempt is over, and always for queues without a
    /// store.
    pub async fn tx(&self) -> Result<MappedMutexGuard<'_, Transaction<'static, Postgres>>> {
        let guard = self.tx.lock().await;
        MutexGuard::try_map(guard, |tx| tx.as_mut())
            .map_err(|_| JobError::TransactionClosed(self.job_id))
    }

    /// Cancelled when the pool starts shutting down. Running handlers are
    /// never interrupted; long handlers may watch this to finish early.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("run_count", &self.run_count)
            .field("run_at", &self.run_at)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
