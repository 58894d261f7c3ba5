//! PostgreSQL-backed job queue.
//!
//! Handlers are collected by [`PostgresJobQueue::register_job_func`]. The pool
//! does not start on the first registration: each registration re-arms a
//! debounce timer of `poll_interval`, and the pool starts once the timer
//! fires with every handler registered so far. Registering after the pool is
//! running drains it and starts it again with the larger handler set.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use super::context::JobContext;
use super::heartbeat::{self, HeartbeatTask, PoolRegistration};
use super::job::{self, NewJob};
use super::payload::{IntoJobPayloads, Job, JobPayload, PayloadContext, PersistencePayload};
use super::registry::JobRegistry;
use super::repository::JobsRepository;
use super::scheduler::{ScheduleEntry, ScheduleSpec, SchedulerTask, SharedSchedules};
use super::worker::{PoolContext, Worker};
use crate::common::telemetry;
use crate::config::QueueConfig;
use crate::error::{JobError, Result};

/// Per-call enqueue options.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct JobOptions {
    /// Lower runs first.
    #[builder(default)]
    pub priority: i16,
    /// Not eligible before this instant. Defaults to now.
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    /// Actor identity restored into the handler's [`JobContext`].
    #[builder(default, setter(strip_option, into))]
    pub user_id: Option<String>,
}

/// Queue contract shared by the Postgres queue, [`MemoryQueue`](super::MemoryQueue) and
/// [`NoopJobQueue`](super::NoopJobQueue).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue one job or a batch. A batch is written all-or-nothing.
    async fn enqueue<P>(&self, jobs: P, options: JobOptions) -> Result<()>
    where
        P: IntoJobPayloads + Send;

    /// Register the handler for `J`'s job type.
    async fn register_job_func<J, F, Fut>(&self, handler: F) -> Result<()>
    where
        J: Job,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static;

    /// Run `job` on every occurrence of `spec`.
    async fn schedule<J: Job>(&self, spec: &str, job: J) -> Result<()>;

    /// Stop the pool and wait for running handlers. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Job queue and worker pool over one PostgreSQL database.
///
/// Cheap to clone; clones share the pool and its handlers.
#[derive(Clone)]
pub struct PostgresJobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pool: PgPool,
    config: QueueConfig,
    state: Mutex<QueueState>,
    schedules: SharedSchedules,
    schedule_wake: Arc<Notify>,
}

#[derive(Default)]
struct QueueState {
    registry: JobRegistry,
    start_timer: Option<JoinHandle<()>>,
    running: Option<RunningPool>,
}

struct RunningPool {
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
    registration: PoolRegistration,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pool,
                config,
                state: Mutex::new(QueueState::default()),
                schedules: Arc::new(RwLock::new(Vec::new())),
                schedule_wake: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Reporting over the same database.
    pub fn repository(&self) -> JobsRepository {
        JobsRepository::new(self.inner.pool.clone())
    }

    /// Enqueue inside the caller's transaction. Nothing is written if that
    /// transaction rolls back.
    ///
    /// ```ignore
    /// let mut tx = pool.begin().await?;
    /// create_order(&mut tx, &order).await?;
    /// queue.enqueue_tx(&mut tx, SendReceipt { order_id: order.id }, JobOptions::default()).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn enqueue_tx<P>(
        &self,
        conn: &mut PgConnection,
        jobs: P,
        options: JobOptions,
    ) -> Result<()>
    where
        P: IntoJobPayloads,
    {
        let rows = self.build_rows(jobs.into_job_payloads()?, &options)?;
        job::insert_batch(conn, &rows)
            .await
            .map_err(JobError::enqueue)?;
        self.record_enqueued(&rows);
        Ok(())
    }

    /// Whether the worker pool is currently running.
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running.is_some()
    }

    fn build_rows(&self, payloads: Vec<JobPayload>, options: &JobOptions) -> Result<Vec<NewJob>> {
        let config = &self.inner.config;
        let ctx = PayloadContext {
            user_id: options.user_id.clone(),
            carrier: telemetry::inject_current_span(),
        };
        let run_at = options.run_at.unwrap_or_else(Utc::now);

        payloads
            .iter()
            .map(|payload| {
                let args = serde_json::to_value(PersistencePayload::new(
                    payload,
                    &config.git_hash,
                    ctx.clone(),
                ))
                .map_err(JobError::enqueue)?;
                Ok(NewJob::builder()
                    .queue(config.queue.as_str())
                    .job_type(payload.job_type())
                    .priority(options.priority)
                    .run_at(run_at)
                    .args(args)
                    .build())
            })
            .collect()
    }

    fn record_enqueued(&self, rows: &[NewJob]) {
        for row in rows {
            metrics::counter!(
                "jobs_enqueued_total",
                "queue" => row.queue.clone(),
                "job_type" => row.job_type.clone()
            )
            .increment(1);
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue<P>(&self, jobs: P, options: JobOptions) -> Result<()>
    where
        P: IntoJobPayloads + Send,
    {
        let rows = self.build_rows(jobs.into_job_payloads()?, &options)?;

        let mut tx = self.inner.pool.begin().await.map_err(JobError::enqueue)?;
        job::insert_batch(&mut tx, &rows)
            .await
            .map_err(JobError::enqueue)?;
        tx.commit().await.map_err(JobError::enqueue)?;

        self.record_enqueued(&rows);
        Ok(())
    }

    async fn register_job_func<J, F, Fut>(&self, handler: F) -> Result<()>
    where
        J: Job,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut state = self.inner.state.lock().await;

        let job_type = J::job_type();
        if state.registry.is_registered(&job_type) {
            return Err(JobError::InvalidJobFunc(format!(
                "job type {job_type} already registered"
            )));
        }

        if state.running.is_some() {
            info!(job_type = %job_type, "restart workers");
            if let Err(e) = self.inner.stop(&mut state).await {
                warn!(error = %e, "worker pool stopped with an error, restarting anyway");
            }
        }

        state.registry.register::<J, F, Fut>(handler)?;
        self.inner.arm_start_timer(&mut state);
        Ok(())
    }

    async fn schedule<J: Job>(&self, spec: &str, job: J) -> Result<()> {
        let parsed = ScheduleSpec::parse(spec)?;
        let payload = JobPayload::new(&job).map_err(JobError::schedule)?;

        self.inner
            .schedules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScheduleEntry {
                spec_text: spec.trim().to_string(),
                spec: parsed,
                payload,
            });
        self.inner.schedule_wake.notify_one();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.start_timer.take() {
            timer.abort();
        }
        self.inner.stop(&mut state).await
    }
}

impl QueueInner {
    fn arm_start_timer(self: &Arc<Self>, state: &mut QueueState) {
        if let Some(timer) = state.start_timer.take() {
            timer.abort();
        }

        let inner: Weak<Self> = Arc::downgrade(self);
        let delay = self.config.poll_interval;
        state.start_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.start_workers().await;
            }
        }));
    }

    async fn start_workers(&self) {
        let mut state = self.state.lock().await;
        state.start_timer = None;
        if state.running.is_some() || state.registry.is_empty() {
            return;
        }

        let config = &self.config;
        let shutdown = CancellationToken::new();
        let job_types = state.registry.registered_types();
        let pool_size = config.pool_size.max(1);
        let registration = PoolRegistration {
            id: config.pool_name.clone(),
            queue: config.queue.clone(),
            workers: i16::try_from(pool_size).unwrap_or(i16::MAX),
            git_hash: config.git_hash.clone(),
            job_types: job_types.clone(),
        };

        let context = Arc::new(PoolContext {
            pool: self.pool.clone(),
            queue: config.queue.clone(),
            git_hash: config.git_hash.clone(),
            strategy: config.poll_strategy,
            backoff: config.backoff,
            poll_interval: config.poll_interval,
            registry: state.registry.clone(),
            job_types: job_types.clone(),
            shutdown: shutdown.clone(),
        });

        let mut tasks = JoinSet::new();
        for id in 0..pool_size {
            tasks.spawn(Worker::new(id, context.clone()).run());
        }
        tasks.spawn(
            SchedulerTask {
                pool: self.pool.clone(),
                queue: config.queue.clone(),
                git_hash: config.git_hash.clone(),
                horizon: config.schedule_horizon,
                interval: config.schedule_interval,
                schedules: self.schedules.clone(),
                wake: self.schedule_wake.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );
        tasks.spawn(
            HeartbeatTask {
                pool: self.pool.clone(),
                registration: registration.clone(),
                interval: config.heartbeat_interval,
                schedules: self.schedules.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        info!(
            pool = %config.pool_name,
            queue = %config.queue,
            workers = pool_size,
            job_types = ?job_types,
            "started worker pool"
        );

        state.running = Some(RunningPool {
            shutdown,
            tasks,
            registration,
        });
    }

    /// Cancel the running pool, wait for every task and mark the pool offline.
    async fn stop(&self, state: &mut QueueState) -> Result<()> {
        let Some(mut running) = state.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        let mut first_error = None;
        while let Some(joined) = running.tasks.join_next().await {
            let result = joined
                .map_err(|e| JobError::Shutdown(e.to_string()))
                .and_then(|result| result);
            if let Err(e) = result {
                error!(pool = %running.registration.id, error = %e, "worker pool task failed");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = heartbeat::register_pool(&self.pool, &running.registration.offline()).await
        {
            warn!(
                pool = %running.registration.id,
                error = %e,
                "could not mark worker pool offline"
            );
        }
        info!(pool = %running.registration.id, "stopped worker pool");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
