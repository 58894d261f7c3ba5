//! Attempt history.
//!
//! A record is opened in the lock transaction before the handler runs and
//! closed after it returns. Both writes sit outside the handler savepoint, so
//! the audit trail survives a rolled back handler. Each write is guarded by
//! its own savepoint: a failed history write is logged and skipped without
//! poisoning the surrounding transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use tracing::warn;
use uuid::Uuid;

use super::job::PendingJob;

/// One execution attempt of a job, keyed by `(job_id, run_count)`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HistoryRecord {
    pub job_id: Uuid,
    pub run_count: i32,
    pub queue: String,
    pub job_type: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub args: serde_json::Value,
    pub run_error: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pruned_at: Option<DateTime<Utc>>,
}

pub(crate) const HISTORY_COLUMNS: &str = "job_id, run_count, queue, job_type, priority, run_at, \
                                          args, run_error, success, created_at, finished_at, \
                                          pruned_at";

/// Open the record for this attempt.
pub(crate) async fn record_started(
    conn: &mut PgConnection,
    job: &PendingJob,
    args: &serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query("SAVEPOINT queue_history").execute(&mut *conn).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO queue_jobs_history (job_id, run_count, queue, job_type, priority, run_at, args)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (job_id, run_count) DO NOTHING
        "#,
    )
    .bind(job.job_id)
    .bind(job.error_count)
    .bind(&job.queue)
    .bind(&job.job_type)
    .bind(job.priority)
    .bind(job.run_at)
    .bind(args)
    .execute(&mut *conn)
    .await;

    release_or_rollback(conn, inserted.map(|_| ()), job.job_id, "open").await
}

/// Close the open record for this attempt. `error` is `None` on success.
pub(crate) async fn record_finished(
    conn: &mut PgConnection,
    job_id: Uuid,
    run_count: i32,
    error: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query("SAVEPOINT queue_history").execute(&mut *conn).await?;

    let updated = sqlx::query(
        r#"
        UPDATE queue_jobs_history
        SET success = $3,
            run_error = $4,
            finished_at = now()
        WHERE job_id = $1
          AND run_count = $2
          AND finished_at IS NULL
        "#,
    )
    .bind(job_id)
    .bind(run_count)
    .bind(error.is_none())
    .bind(error.unwrap_or_default())
    .execute(&mut *conn)
    .await;

    release_or_rollback(conn, updated.map(|_| ()), job_id, "close").await
}

async fn release_or_rollback(
    conn: &mut PgConnection,
    result: sqlx::Result<()>,
    job_id: Uuid,
    action: &str,
) -> sqlx::Result<()> {
    match result {
        Ok(()) => {
            sqlx::query("RELEASE SAVEPOINT queue_history")
                .execute(&mut *conn)
                .await?;
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "could not {action} history record");
            sqlx::query("ROLLBACK TO SAVEPOINT queue_history")
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}
