//! Recurring jobs.
//!
//! A schedule is a spec plus a template job. While a pool runs, the scheduler
//! loop writes one ordinary `queue_jobs` row per occurrence up to
//! `now + horizon`. The schedule row carries `materialized_until` and is
//! locked while occurrences are written, so restarts and concurrent pools
//! never materialize the same occurrence twice.

use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use cron::Schedule;
use sqlx::{PgConnection, PgPool};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::job::{self, NewJob};
use super::payload::{JobPayload, PayloadContext, PersistencePayload};
use crate::error::{JobError, Result};

/// `@every` intervals below this are clamped.
const MIN_EVERY: Duration = Duration::from_secs(1);

/// Upper bound of occurrences written per schedule and refresh.
const MAX_OCCURRENCES: usize = 100_000;

/// A parsed schedule spec.
///
/// Accepted forms: `@every <duration>` (humantime syntax such as `90s` or
/// `1h 30m`), the descriptors `@yearly`,
/// `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`, `@hourly`,
/// five-field cron (minute precision) and six or seven-field cron with
/// seconds and an optional year.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Every(Duration),
    Cron(Box<Schedule>),
}

impl ScheduleSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();

        if let Some(every) = spec.strip_prefix("@every ") {
            let interval = humantime::parse_duration(every.trim())
                .map_err(|e| JobError::schedule(format!("invalid schedule spec {spec:?}: {e}")))?;
            return Ok(Self::Every(interval.max(MIN_EVERY)));
        }

        let expression = match spec {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            other if other.split_whitespace().count() == 5 => format!("0 {other}"),
            other => other.to_string(),
        };

        let schedule = Schedule::from_str(&expression)
            .map_err(|e| JobError::schedule(format!("invalid schedule spec {spec:?}: {e}")))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Occurrences in `(after, until]`, at most `limit` of them.
    pub fn occurrences(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        match self {
            ScheduleSpec::Every(interval) => {
                let Ok(step) = chrono::Duration::from_std(*interval) else {
                    return Vec::new();
                };
                let mut occurrences = Vec::new();
                let mut next = after.trunc_subsecs(0) + step;
                while next <= until && occurrences.len() < limit {
                    occurrences.push(next);
                    next += step;
                }
                occurrences
            }
            ScheduleSpec::Cron(schedule) => schedule
                .after(&after)
                .take_while(|t| *t <= until)
                .take(limit)
                .collect(),
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.occurrences(after, DateTime::<Utc>::MAX_UTC, 1)
            .into_iter()
            .next()
    }
}

/// A schedule registered on a queue instance.
#[derive(Debug, Clone)]
pub(crate) struct ScheduleEntry {
    pub spec_text: String,
    pub spec: ScheduleSpec,
    pub payload: JobPayload,
}

pub(crate) type SharedSchedules = Arc<RwLock<Vec<ScheduleEntry>>>;

pub(crate) fn snapshot(schedules: &RwLock<Vec<ScheduleEntry>>) -> Vec<ScheduleEntry> {
    schedules
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Assert the schedule row and return `(id, materialized_until)`.
///
/// Inside a transaction the row stays locked until commit.
pub(crate) async fn upsert(
    conn: &mut PgConnection,
    queue: &str,
    entry: &ScheduleEntry,
) -> sqlx::Result<(i64, Option<DateTime<Utc>>)> {
    sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
        r#"
        INSERT INTO queue_schedules (queue, spec, job_type, args)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (queue, spec, job_type, args)
        DO UPDATE SET updated_at = now()
        RETURNING id, materialized_until
        "#,
    )
    .bind(queue)
    .bind(&entry.spec_text)
    .bind(entry.payload.job_type())
    .bind(entry.payload.data())
    .fetch_one(conn)
    .await
}

/// Write the occurrences of one schedule that fall inside the horizon.
/// Returns how many rows were inserted.
pub(crate) async fn materialize(
    pool: &PgPool,
    queue: &str,
    git_hash: &str,
    horizon: Duration,
    entry: &ScheduleEntry,
) -> Result<usize> {
    let horizon = chrono::Duration::from_std(horizon).map_err(JobError::schedule)?;
    let mut tx = pool.begin().await?;

    let (schedule_id, materialized_until) = upsert(&mut tx, queue, entry).await?;
    let now = Utc::now();
    let from = materialized_until.map_or(now, |until| until.max(now));
    let until = now + horizon;
    if from >= until {
        tx.commit().await?;
        return Ok(0);
    }

    let occurrences = entry.spec.occurrences(from, until, MAX_OCCURRENCES);
    let reached = match occurrences.last() {
        Some(last) if occurrences.len() == MAX_OCCURRENCES => {
            warn!(
                spec = %entry.spec_text,
                job_type = %entry.payload.job_type(),
                "schedule produced too many occurrences, materializing in steps"
            );
            *last
        }
        _ => until,
    };

    let args = serde_json::to_value(PersistencePayload::new(
        &entry.payload,
        git_hash,
        PayloadContext::default(),
    ))
    .map_err(JobError::schedule)?;
    let jobs: Vec<NewJob> = occurrences
        .iter()
        .map(|run_at| {
            NewJob::builder()
                .queue(queue)
                .job_type(entry.payload.job_type())
                .run_at(*run_at)
                .args(args.clone())
                .build()
        })
        .collect();
    job::insert_batch(&mut tx, &jobs).await?;

    sqlx::query(
        "UPDATE queue_schedules SET materialized_until = $2, updated_at = now() WHERE id = $1",
    )
    .bind(schedule_id)
    .bind(reached)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(jobs.len())
}

/// Scheduler loop of a running pool.
pub(crate) struct SchedulerTask {
    pub pool: PgPool,
    pub queue: String,
    pub git_hash: String,
    pub horizon: Duration,
    pub interval: Duration,
    pub schedules: SharedSchedules,
    pub wake: Arc<Notify>,
    pub shutdown: CancellationToken,
}

impl SchedulerTask {
    pub(crate) async fn run(self) -> Result<()> {
        loop {
            self.refresh().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.interval) => {}
            }
        }
        Ok(())
    }

    async fn refresh(&self) {
        for entry in snapshot(&self.schedules) {
            match materialize(&self.pool, &self.queue, &self.git_hash, self.horizon, &entry).await
            {
                Ok(0) => {}
                Ok(inserted) => debug!(
                    spec = %entry.spec_text,
                    job_type = %entry.payload.job_type(),
                    inserted,
                    "materialized scheduled jobs"
                ),
                Err(e) => error!(
                    spec = %entry.spec_text,
                    job_type = %entry.payload.job_type(),
                    error = %e,
                    "could not materialize schedule"
                ),
            }
        }
    }
}
