//! In-process queue.
//!
//! Jobs live in memory and run on a single task that picks one eligible job
//! per tick, lowest priority first. Nothing survives a restart and handlers
//! get a [`JobContext`] without a transaction.
//!
//! A queue that was never started doubles as a test double: enqueued jobs
//! stay put and can be inspected with [`MemoryQueue::queued`] and friends.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::JobContext;
use super::payload::{IntoJobPayloads, Job, JobPayload};
use super::queue::{JobOptions, JobQueue};
use super::registry::JobRegistry;
use super::scheduler::{ScheduleEntry, ScheduleSpec};
use super::worker::{panic_message, Backoff};
use crate::error::{JobError, Result};

const MEMORY_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct QueuedJob {
    job_id: Uuid,
    payload: JobPayload,
    priority: i16,
    run_at: DateTime<Utc>,
    user_id: Option<String>,
    run_count: i32,
}

struct Running {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

#[derive(Default)]
struct MemoryInner {
    jobs: Mutex<VecDeque<QueuedJob>>,
    registry: RwLock<JobRegistry>,
    schedules: Mutex<Vec<ScheduleEntry>>,
    backoff: Backoff,
    running: tokio::sync::Mutex<Option<Running>>,
}

/// Queue without a store.
///
/// ```ignore
/// let queue = MemoryQueue::new();
/// queue.register_job_func(send_receipt).await?;
/// queue.start().await;
/// queue.enqueue(SendReceipt { order_id }, JobOptions::default()).await?;
/// ```
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryQueue {
    /// A stopped queue with immediate retries.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stopped queue that delays failed jobs by `backoff`.
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                backoff,
                ..MemoryInner::default()
            }),
        }
    }

    /// Start the dispatch task and one task per schedule. Idempotent.
    pub async fn start(&self) {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch(Arc::downgrade(&self.inner), shutdown.clone()));
        for entry in self.inner.schedules() {
            tasks.spawn(materialize(
                Arc::downgrade(&self.inner),
                entry,
                shutdown.clone(),
            ));
        }

        info!(job_types = ?self.registered_types(), "started in-memory queue");
        *running = Some(Running { shutdown, tasks });
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Number of queued jobs of all types.
    pub fn queued_total(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Number of queued jobs of type `J`.
    pub fn queued<J: Job>(&self) -> usize {
        let job_type = J::job_type();
        self.inner
            .jobs()
            .iter()
            .filter(|job| job.payload.job_type() == job_type)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs().is_empty()
    }

    /// Queued jobs of type `J` in enqueue order.
    pub fn jobs<J: Job>(&self) -> Vec<J> {
        let job_type = J::job_type();
        self.inner
            .jobs()
            .iter()
            .filter(|job| job.payload.job_type() == job_type)
            .filter_map(|job| serde_json::from_value(job.payload.data().clone()).ok())
            .collect()
    }

    /// Every queued payload in enqueue order.
    pub fn payloads(&self) -> Vec<JobPayload> {
        self.inner
            .jobs()
            .iter()
            .map(|job| job.payload.clone())
            .collect()
    }

    /// Drop every queued job.
    pub fn reset(&self) {
        self.inner.jobs().clear();
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.registry().registered_types()
    }
}

impl MemoryInner {
    fn jobs(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> JobRegistry {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn schedules(&self) -> Vec<ScheduleEntry> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, payload: JobPayload, options: &JobOptions) {
        self.jobs().push_back(QueuedJob {
            job_id: Uuid::now_v7(),
            payload,
            priority: options.priority,
            run_at: options.run_at.unwrap_or_else(Utc::now),
            user_id: options.user_id.clone(),
            run_count: 0,
        });
    }

    /// Remove the next eligible job: due, handled, lowest priority, earliest
    /// `run_at`, then enqueue order.
    fn take_next(&self, registry: &JobRegistry) -> Option<QueuedJob> {
        let now = Utc::now();
        let mut jobs = self.jobs();
        let index = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.run_at <= now && registry.is_registered(job.payload.job_type()))
            .min_by_key(|(index, job)| (job.priority, job.run_at, *index))
            .map(|(index, _)| index)?;
        jobs.remove(index)
    }

    async fn run(&self, registry: &JobRegistry, mut job: QueuedJob, shutdown: &CancellationToken) {
        let ctx = JobContext {
            job_id: job.job_id,
            queue: String::new(),
            job_type: job.payload.job_type().to_string(),
            priority: job.priority,
            run_count: job.run_count,
            run_at: job.run_at,
            user_id: job.user_id.clone(),
            tx: Arc::new(tokio::sync::Mutex::new(None)),
            shutdown: shutdown.clone(),
        };
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            job_type = %job.payload.job_type(),
            run_count = job.run_count
        );

        let handler = registry
            .execute(job.payload.job_type(), ctx, job.payload.data().clone())
            .instrument(span);
        let result = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("job panicked: {}", panic_message(&*panic))),
        };

        match result {
            Ok(()) => debug!(job_id = %job.job_id, job_type = %job.payload.job_type(), "job succeeded"),
            Err(message) => {
                job.run_count = job.run_count.saturating_add(1);
                let retry_in = self.backoff.delay(job.run_count);
                job.run_at = chrono::Duration::from_std(retry_in)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or_else(Utc::now);
                warn!(
                    job_id = %job.job_id,
                    job_type = %job.payload.job_type(),
                    run_count = job.run_count,
                    error = %JobError::WorkerFailed(message),
                    "job failed"
                );
                self.jobs().push_back(job);
            }
        }
    }
}

/// Run one eligible job per tick until cancelled or the queue is dropped.
async fn dispatch(inner: Weak<MemoryInner>, shutdown: CancellationToken) {
    let mut tick = interval(MEMORY_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let registry = inner.registry();
        if let Some(job) = inner.take_next(&registry) {
            inner.run(&registry, job, &shutdown).await;
        }
    }
}

/// Enqueue the schedule's job at each occurrence.
async fn materialize(inner: Weak<MemoryInner>, entry: ScheduleEntry, shutdown: CancellationToken) {
    loop {
        let now = Utc::now();
        let Some(next) = entry.spec.next_after(now) else {
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(wait) => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(spec = %entry.spec_text, at = %next, "schedule fired");
        inner.push(entry.payload.clone(), &JobOptions::default());
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue<P>(&self, jobs: P, options: JobOptions) -> Result<()>
    where
        P: IntoJobPayloads + Send,
    {
        for payload in jobs.into_job_payloads()? {
            self.inner.push(payload, &options);
        }
        Ok(())
    }

    async fn register_job_func<J, F, Fut>(&self, handler: F) -> Result<()>
    where
        J: Job,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register::<J, F, Fut>(handler)?;
        Ok(())
    }

    async fn schedule<J: Job>(&self, spec: &str, job: J) -> Result<()> {
        let entry = ScheduleEntry {
            spec_text: spec.trim().to_string(),
            spec: ScheduleSpec::parse(spec)?,
            payload: JobPayload::new(&job).map_err(JobError::schedule)?,
        };
        self.inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());

        if let Some(running) = self.inner.running.lock().await.as_mut() {
            running.tasks.spawn(materialize(
                Arc::downgrade(&self.inner),
                entry,
                running.shutdown.clone(),
            ));
        }
        Ok(())
    }

    /// Stop dispatching. Queued jobs stay in memory; a running handler
    /// finishes first.
    async fn shutdown(&self) -> Result<()> {
        let Some(mut running) = self.inner.running.lock().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        let mut first_error = None;
        while let Some(joined) = running.tasks.join_next().await {
            if let Err(e) = joined {
                first_error.get_or_insert(JobError::Shutdown(e.to_string()));
            }
        }
        info!(queued = self.queued_total(), "stopped in-memory queue");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
