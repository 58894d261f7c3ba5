//! Job queue engine.
//!
//! - [`PostgresJobQueue`] - enqueue, handler registration, schedules, shutdown
//! - [`JobsRepository`] - read-only reporting and maintenance over the same tables
//! - [`NoopJobQueue`] - validates and discards, for hosts without a store
//! - [`MemoryQueue`] - runs handlers in process, or holds jobs for inspection in tests
//!
//! # Architecture
//!
//! ```text
//! enqueue(job) / enqueue_tx(conn, job)
//!     │
//!     └─► INSERT queue_jobs (own tx or caller's tx)
//!
//! register_job_func(handler)
//!     │
//!     └─► debounce timer (poll_interval) ─► start pool
//!
//! Worker pool (JoinSet + CancellationToken)
//!     │
//!     ├─► Worker × pool_size
//!     │       ├─► lock next row (FOR UPDATE SKIP LOCKED)
//!     │       ├─► open history record
//!     │       ├─► SAVEPOINT ─► handler(JobContext, job)
//!     │       └─► success: delete row │ failure: rollback savepoint, bump error_count
//!     ├─► Scheduler ─► materialize cron occurrences up to the horizon
//!     └─► Heartbeat ─► upsert queue_worker_pools + queue_schedules
//! ```

mod context;
mod heartbeat;
mod history;
mod job;
mod memory;
mod noop;
mod payload;
mod queue;
mod registry;
mod repository;
mod scheduler;
mod worker;

pub use context::JobContext;
pub use history::HistoryRecord;
pub use job::PendingJob;
pub use memory::MemoryQueue;
pub use noop::NoopJobQueue;
pub use payload::{IntoJobPayloads, Job, JobPayload, PayloadContext, PersistencePayload};
pub use queue::{JobOptions, JobQueue, PostgresJobQueue};
pub use registry::JobRegistry;
pub use repository::{
    HistoryFilter, JobTable, JobsRepository, Page, QueueKpis, QueueStats, ScheduleRecord,
    TableSizes, WorkerPool, DEFAULT_QUEUE_NAME,
};
pub use scheduler::ScheduleSpec;
pub use worker::{Backoff, PollStrategy};
