//! Reporting and maintenance over the queue tables.
//!
//! Read-only views for dashboards and operators, plus the few writes an
//! operator needs: deleting or rescheduling a pending job, pruning history
//! and reclaiming storage. The empty queue name is presented as
//! [`DEFAULT_QUEUE_NAME`] and accepted back in that form.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::history::{HistoryRecord, HISTORY_COLUMNS};
use super::job::PendingJob;
use crate::error::{JobError, Result};

pub const DEFAULT_QUEUE_NAME: &str = "Default";

const PENDING_JOBS_LIMIT: i64 = 100;

/// Pools that heartbeated within this window are listed.
const WORKER_POOL_WINDOW_SECS: f64 = 120.0;

/// Only pools that heartbeated within this window count as available workers.
const AVAILABLE_WORKERS_WINDOW_SECS: f64 = 60.0;

/// Lock wait for delete and reschedule before giving up with `JobLocked`.
const ROW_LOCK_TIMEOUT: &str = "1s";

/// Liveness row of a worker pool.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerPool {
    pub id: String,
    pub queue: String,
    pub workers: i16,
    pub git_hash: String,
    pub job_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub queue: String,
    pub spec: String,
    pub job_type: String,
    pub args: serde_json::Value,
    pub materialized_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueKpis {
    pub pending_jobs: i64,
    /// Pending rows with at least one failed attempt.
    pub failed_jobs: i64,
    /// Attempts recorded in history.
    pub processed_jobs: i64,
    pub average_duration: Duration,
    pub pending_per_type: BTreeMap<String, i64>,
    /// Worker capacity of pools with a recent heartbeat.
    pub available_workers: i64,
}

/// Derived view of [`QueueKpis`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub kpis: QueueKpis,
    /// Failed pending jobs as a percentage of all pending jobs.
    pub error_rate: f64,
    pub estimated_until_empty: Duration,
}

impl QueueStats {
    /// Error rate is `failed * 100 / pending` in floating point, `0.0` when
    /// nothing is pending. The drain estimate is `pending / workers` rounds of
    /// the average attempt duration, zero when no worker is available.
    pub fn from_kpis(queue: impl Into<String>, kpis: QueueKpis) -> Self {
        let error_rate = if kpis.pending_jobs > 0 {
            kpis.failed_jobs as f64 * 100.0 / kpis.pending_jobs as f64
        } else {
            0.0
        };

        let estimated_until_empty = if kpis.available_workers > 0 {
            let rounds = kpis.pending_jobs as f64 / kpis.available_workers as f64;
            Duration::try_from_secs_f64(kpis.average_duration.as_secs_f64() * rounds)
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        Self {
            queue: queue.into(),
            kpis,
            error_rate,
            estimated_until_empty,
        }
    }
}

/// Filter for finished jobs. `None` matches everything.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct HistoryFilter {
    #[builder(default, setter(strip_option, into))]
    pub queue: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Tables that may be vacuumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTable {
    Jobs,
    History,
    WorkerPools,
    Schedules,
}

impl JobTable {
    pub fn table_name(self) -> &'static str {
        match self {
            JobTable::Jobs => "queue_jobs",
            JobTable::History => "queue_jobs_history",
            JobTable::WorkerPools => "queue_worker_pools",
            JobTable::Schedules => "queue_schedules",
        }
    }
}

impl FromStr for JobTable {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "jobs" => Ok(JobTable::Jobs),
            "history" => Ok(JobTable::History),
            "pools" => Ok(JobTable::WorkerPools),
            "schedules" => Ok(JobTable::Schedules),
            other => Err(format!(
                "unknown table {other:?}, expected jobs, history, pools or schedules"
            )),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TableSizes {
    pub jobs: String,
    pub history: String,
}

/// Map the presentation name of the default queue back to its stored name.
fn queue_key(queue: &str) -> &str {
    if queue == DEFAULT_QUEUE_NAME {
        ""
    } else {
        queue
    }
}

fn queue_label(queue: String) -> String {
    if queue.is_empty() {
        DEFAULT_QUEUE_NAME.to_string()
    } else {
        queue
    }
}

fn lock_error(err: sqlx::Error, job_id: Uuid) -> JobError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03") => {
            JobError::JobLocked(job_id)
        }
        _ => JobError::Store(err),
    }
}

/// Reporting repository over a connection pool.
#[derive(Debug, Clone)]
pub struct JobsRepository {
    pool: PgPool,
}

impl JobsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Queue names seen in pending or finished jobs, sorted.
    pub async fn queues(&self) -> Result<Vec<String>> {
        let queues = sqlx::query_scalar::<_, String>(
            r#"
            SELECT queue FROM queue_jobs
            UNION
            SELECT queue FROM queue_jobs_history
            ORDER BY queue
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(queues.into_iter().map(queue_label).collect())
    }

    /// Next pending jobs of a queue in dispatch order.
    pub async fn pending_jobs(&self, queue: &str) -> Result<Vec<PendingJob>> {
        let jobs = sqlx::query_as::<_, PendingJob>(
            r#"
            SELECT job_id, queue, job_type, priority, run_at, args, error_count,
                   last_error, created_at, updated_at
            FROM queue_jobs
            WHERE queue = $1
            ORDER BY priority, run_at
            LIMIT $2
            "#,
        )
        .bind(queue_key(queue))
        .bind(PENDING_JOBS_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Job types seen in pending or finished jobs of a queue, sorted.
    pub async fn job_types(&self, queue: &str) -> Result<Vec<String>> {
        let types = sqlx::query_scalar::<_, String>(
            r#"
            SELECT job_type FROM queue_jobs WHERE queue = $1
            UNION
            SELECT job_type FROM queue_jobs_history WHERE queue = $1
            ORDER BY job_type
            "#,
        )
        .bind(queue_key(queue))
        .fetch_all(&self.pool)
        .await?;

        Ok(types)
    }

    pub async fn queue_kpis(&self, queue: &str) -> Result<QueueKpis> {
        let queue = queue_key(queue);

        let pending = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_jobs WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool);
        let failed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = $1 AND error_count > 0",
        )
        .bind(queue)
        .fetch_one(&self.pool);
        let processed =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_jobs_history WHERE queue = $1")
                .bind(queue)
                .fetch_one(&self.pool);
        let average = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT EXTRACT(EPOCH FROM AVG(finished_at - created_at))::float8
            FROM queue_jobs_history
            WHERE queue = $1 AND finished_at IS NOT NULL
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool);
        let per_type = sqlx::query_as::<_, (String, i64)>(
            "SELECT job_type, COUNT(*) FROM queue_jobs WHERE queue = $1 GROUP BY job_type",
        )
        .bind(queue)
        .fetch_all(&self.pool);
        let workers = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(workers), 0)::bigint
            FROM queue_worker_pools
            WHERE queue = $1
              AND updated_at > now() - make_interval(secs => $2)
            "#,
        )
        .bind(queue)
        .bind(AVAILABLE_WORKERS_WINDOW_SECS)
        .fetch_one(&self.pool);

        let (pending_jobs, failed_jobs, processed_jobs, average, per_type, available_workers) =
            tokio::try_join!(pending, failed, processed, average, per_type, workers)?;

        Ok(QueueKpis {
            pending_jobs,
            failed_jobs,
            processed_jobs,
            average_duration: average
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(Duration::ZERO),
            pending_per_type: per_type.into_iter().collect(),
            available_workers,
        })
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let kpis = self.queue_kpis(queue).await?;
        Ok(QueueStats::from_kpis(queue_label(queue_key(queue).to_string()), kpis))
    }

    /// Pools with a heartbeat in the last two minutes.
    pub async fn worker_pools(&self) -> Result<Vec<WorkerPool>> {
        let pools = sqlx::query_as::<_, WorkerPool>(
            r#"
            SELECT id, queue, workers, git_hash, job_types, created_at, updated_at
            FROM queue_worker_pools
            WHERE updated_at > now() - make_interval(secs => $1)
            ORDER BY queue, id
            "#,
        )
        .bind(WORKER_POOL_WINDOW_SECS)
        .fetch_all(&self.pool)
        .await?;

        Ok(pools)
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let schedules = sqlx::query_as::<_, ScheduleRecord>(
            r#"
            SELECT id, queue, spec, job_type, args, materialized_until, created_at, updated_at
            FROM queue_schedules
            ORDER BY queue, job_type, spec
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(schedules)
    }

    /// Finished attempts, newest first.
    pub async fn finished_jobs(&self, filter: &HistoryFilter, page: Page) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM queue_jobs_history
            WHERE finished_at IS NOT NULL
              AND ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY finished_at DESC, job_id, run_count
            LIMIT $3 OFFSET $4
            "#
        );

        let records = sqlx::query_as::<_, HistoryRecord>(&sql)
            .bind(filter.queue.as_deref().map(queue_key))
            .bind(filter.job_type.as_deref())
            .bind(page.limit.max(0))
            .bind(page.offset.max(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    pub async fn finished_jobs_total(&self, filter: &HistoryFilter) -> Result<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM queue_jobs_history
            WHERE finished_at IS NOT NULL
              AND ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR job_type = $2)
            "#,
        )
        .bind(filter.queue.as_deref().map(queue_key))
        .bind(filter.job_type.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// All attempts of one job, oldest first.
    pub async fn job_history(&self, job_id: Uuid) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM queue_jobs_history WHERE job_id = $1 ORDER BY run_count"
        );

        let records = sqlx::query_as::<_, HistoryRecord>(&sql)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Remove a pending job. Fails fast with [`JobError::JobLocked`] while a
    /// worker runs it.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{ROW_LOCK_TIMEOUT}'"))
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM queue_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| lock_error(e, job_id))?;
        if deleted.rows_affected() == 0 {
            return Err(JobError::JobNotFound(job_id));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Move a pending job to `run_at`. Fails fast with
    /// [`JobError::JobLocked`] while a worker runs it.
    pub async fn reschedule_job(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{ROW_LOCK_TIMEOUT}'"))
            .execute(&mut *tx)
            .await?;

        let updated =
            sqlx::query("UPDATE queue_jobs SET run_at = $2, updated_at = now() WHERE job_id = $1")
                .bind(job_id)
                .bind(run_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| lock_error(e, job_id))?;
        if updated.rows_affected() == 0 {
            return Err(JobError::JobNotFound(job_id));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete history records created before `before`. Returns the number removed.
    pub async fn prune_history(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_jobs_history WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Drop the payload of history records of `queue` created before
    /// `before`, keeping the records themselves.
    pub async fn prune_history_payload(&self, queue: &str, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs_history
            SET args = '{}'::jsonb,
                pruned_at = now()
            WHERE queue = $1
              AND created_at < $2
              AND pruned_at IS NULL
            "#,
        )
        .bind(queue_key(queue))
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// `VACUUM FULL` one of the queue tables. Takes an exclusive lock.
    pub async fn vacuum(&self, table: JobTable) -> Result<()> {
        sqlx::query(&format!("VACUUM FULL {}", table.table_name()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn table_sizes(&self) -> Result<TableSizes> {
        let sizes = sqlx::query_as::<_, TableSizes>(
            r#"
            SELECT pg_size_pretty(pg_total_relation_size('queue_jobs')) AS jobs,
                   pg_size_pretty(pg_total_relation_size('queue_jobs_history')) AS history
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(sizes)
    }
}
