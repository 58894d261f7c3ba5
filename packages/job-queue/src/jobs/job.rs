//! Pending job rows and the statements that move them through their lifecycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::worker::PollStrategy;

const PENDING_JOB_COLUMNS: &str = "job_id, queue, job_type, priority, run_at, args, error_count, \
                                   last_error, created_at, updated_at";

// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK: usize = 1_000;

/// A unit of work that has not yet run successfully.
///
/// Row presence is the state: a row exists from enqueue until its handler
/// succeeds; a failed attempt leaves it in place with `error_count` bumped.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PendingJob {
    pub job_id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub args: serde_json::Value,
    pub error_count: i32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row about to be inserted.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub(crate) struct NewJob {
    #[builder(default = Uuid::now_v7())]
    pub job_id: Uuid,
    pub queue: String,
    pub job_type: String,
    #[builder(default)]
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub args: serde_json::Value,
}

/// Insert all rows on the given connection. Callers own the transaction.
pub(crate) async fn insert_batch(conn: &mut PgConnection, jobs: &[NewJob]) -> sqlx::Result<()> {
    for chunk in jobs.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO queue_jobs (job_id, queue, job_type, priority, run_at, args) ",
        );
        builder.push_values(chunk, |mut row, job| {
            row.push_bind(job.job_id)
                .push_bind(job.queue.clone())
                .push_bind(job.job_type.clone())
                .push_bind(job.priority)
                .push_bind(job.run_at)
                .push_bind(job.args.clone());
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Lock the next eligible row for this queue, skipping rows other workers hold.
pub(crate) async fn lock_next(
    conn: &mut PgConnection,
    queue: &str,
    job_types: &[String],
    strategy: PollStrategy,
) -> sqlx::Result<Option<PendingJob>> {
    let sql = format!(
        r#"
        SELECT {PENDING_JOB_COLUMNS}
        FROM queue_jobs
        WHERE queue = $1
          AND run_at <= now()
          AND job_type = ANY($2)
        ORDER BY {}
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
        strategy.order_by()
    );

    sqlx::query_as::<_, PendingJob>(&sql)
        .bind(queue)
        .bind(job_types)
        .fetch_optional(conn)
        .await
}

/// Lock one row by id, skipping it if another worker holds it.
pub(crate) async fn lock_by_id(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> sqlx::Result<Option<PendingJob>> {
    let sql = format!(
        "SELECT {PENDING_JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1 FOR UPDATE SKIP LOCKED"
    );
    sqlx::query_as::<_, PendingJob>(&sql)
        .bind(job_id)
        .fetch_optional(conn)
        .await
}

pub(crate) async fn update_args(
    conn: &mut PgConnection,
    job_id: Uuid,
    args: &serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE queue_jobs SET args = $2, updated_at = now() WHERE job_id = $1")
        .bind(job_id)
        .bind(args)
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn delete(conn: &mut PgConnection, job_id: Uuid) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM queue_jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Record a failed attempt and make the row eligible again after `retry_in`.
pub(crate) async fn mark_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error: &str,
    retry_in: Duration,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE queue_jobs
        SET error_count = error_count + 1,
            last_error = $2,
            run_at = now() + make_interval(secs => $3),
            updated_at = now()
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(retry_in.as_secs_f64())
    .execute(conn)
    .await?;
    Ok(())
}
