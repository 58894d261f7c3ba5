use thiserror::Error;
use uuid::Uuid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the queue, the worker pool and the reporting repository.
#[derive(Debug, Error)]
pub enum JobError {
    /// The enqueued value is not a named record (or the collection is empty).
    #[error("invalid job type: {0}")]
    InvalidJobType(String),

    /// The handler cannot be registered, usually because its job type is taken.
    #[error("invalid job func: {0}")]
    InvalidJobFunc(String),

    #[error("could not enqueue job: {0}")]
    EnqueueFailed(#[source] BoxError),

    #[error("could not schedule job: {0}")]
    ScheduleFailed(#[source] BoxError),

    /// A handler returned an error or panicked.
    #[error("job failed: {0}")]
    WorkerFailed(String),

    /// The row is held by a running worker and the bounded wait elapsed.
    #[error("job {0} is locked by a running worker")]
    JobLocked(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// The attempt is over, or the job never ran under a transaction.
    #[error("transaction of job {0} is closed")]
    TransactionClosed(Uuid),

    /// A pool task ended abnormally while draining.
    #[error("worker pool task failed: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl JobError {
    pub(crate) fn enqueue(err: impl Into<BoxError>) -> Self {
        Self::EnqueueFailed(err.into())
    }

    pub(crate) fn schedule(err: impl Into<BoxError>) -> Self {
        Self::ScheduleFailed(err.into())
    }
}

pub type Result<T, E = JobError> = std::result::Result<T, E>;
