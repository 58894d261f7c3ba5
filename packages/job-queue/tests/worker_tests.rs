//! Dispatch behavior of a running worker pool.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::{TimeDelta, Utc};
use common::{wait_until, TestHarness};
use job_queue::{
    Backoff, HistoryRecord, Job, JobContext, JobError, JobOptions, JobQueue, PollStrategy,
    PostgresJobQueue,
};
use serde::{Deserialize, Serialize};
use test_context::test_context;
use tokio::sync::Mutex;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Flaky {
    fail_times: usize,
}

impl Job for Flaky {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Explode {}

impl Job for Explode {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SwallowError {}

impl Job for SwallowError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ordered {
    label: i16,
}

impl Job for Ordered {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WriteNote {
    note: String,
    fail: bool,
}

impl Job for WriteNote {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Parent {
    id: i64,
}

impl Job for Parent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Child {
    parent_id: i64,
}

impl Job for Child {}

async fn explode(_ctx: JobContext, _job: Explode) -> anyhow::Result<()> {
    panic!("kaboom")
}

async fn history(ctx: &TestHarness) -> Vec<HistoryRecord> {
    sqlx::query_as("SELECT * FROM queue_jobs_history ORDER BY job_id, run_count")
        .fetch_all(&ctx.db_pool)
        .await
        .unwrap()
}

fn no_retry(ctx: &TestHarness) -> PostgresJobQueue {
    let mut config = ctx.config();
    config.backoff = Backoff::Fixed(Duration::from_secs(3600));
    PostgresJobQueue::new(ctx.db_pool.clone(), config)
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_failed_attempts_are_retried_and_recorded(ctx: &TestHarness) {
    let queue = ctx.queue();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .register_job_func(move |_ctx: JobContext, job: Flaky| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < job.fail_times {
                    bail!("boom");
                }
                Ok(())
            }
        })
        .await
        .unwrap();
    queue
        .enqueue(Flaky { fail_times: 2 }, JobOptions::default())
        .await
        .unwrap();

    let done = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs_history WHERE success")
            .await
            == 1
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);

    let records = history(ctx).await;
    let runs: Vec<(i32, bool)> = records.iter().map(|r| (r.run_count, r.success)).collect();
    assert_eq!(runs, vec![(0, false), (1, false), (2, true)]);
    assert_eq!(records[0].run_error, "job failed: boom");
    assert_eq!(records[2].run_error, "");
    assert!(records.iter().all(|r| r.finished_at.is_some()));
    assert_eq!(ctx.count("SELECT count(*) FROM queue_jobs").await, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_panics_are_contained_and_recorded(ctx: &TestHarness) {
    let queue = no_retry(ctx);
    queue
        .register_job_func(explode)
        .await
        .unwrap();
    queue.enqueue(Explode {}, JobOptions::default()).await.unwrap();

    let failed = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs WHERE error_count = 1")
            .await
            == 1
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(failed);

    let last_error: String = sqlx::query_scalar("SELECT last_error FROM queue_jobs")
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(last_error, "job failed: job panicked: kaboom");

    let records = history(ctx).await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].run_error, last_error);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_lower_priority_runs_first(ctx: &TestHarness) {
    let queue = ctx.queue();
    for label in [3, 1, 2] {
        queue
            .enqueue(Ordered { label }, JobOptions::builder().priority(label).build())
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue
        .register_job_func(move |_ctx: JobContext, job: Ordered| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(job.label);
                Ok(())
            }
        })
        .await
        .unwrap();

    let done = wait_until(TIMEOUT, || {
        let seen = seen.clone();
        async move { seen.lock().await.len() == 3 }
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);
    assert_eq!(*seen.lock().await, vec![1, 2, 3]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_handler_writes_commit_only_on_success(ctx: &TestHarness) {
    sqlx::query("CREATE TABLE notes (note TEXT NOT NULL)")
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    let queue = no_retry(ctx);
    queue
        .register_job_func(|ctx: JobContext, job: WriteNote| async move {
            let mut tx = ctx.tx().await?;
            sqlx::query("INSERT INTO notes (note) VALUES ($1)")
                .bind(&job.note)
                .execute(&mut **tx)
                .await?;
            if job.fail {
                bail!("rejected {}", job.note);
            }
            anyhow::Ok(())
        })
        .await
        .unwrap();
    queue
        .enqueue(
            vec![
                WriteNote {
                    note: "kept".into(),
                    fail: false,
                },
                WriteNote {
                    note: "dropped".into(),
                    fail: true,
                },
            ],
            JobOptions::default(),
        )
        .await
        .unwrap();

    let settled = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs_history WHERE finished_at IS NOT NULL")
            .await
            == 2
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(settled);

    let notes: Vec<String> = sqlx::query_scalar("SELECT note FROM notes")
        .fetch_all(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(notes, vec!["kept".to_string()]);

    let last_error: String = sqlx::query_scalar("SELECT last_error FROM queue_jobs")
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(last_error, "job failed: rejected dropped");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_handler_sees_job_context(ctx: &TestHarness) {
    let queue = ctx.queue();
    let seen = Arc::new(Mutex::new(None));

    let sink = seen.clone();
    queue
        .register_job_func(move |ctx: JobContext, _job: Ordered| {
            let sink = sink.clone();
            async move {
                *sink.lock().await = Some((
                    ctx.job_type().to_string(),
                    ctx.priority(),
                    ctx.run_count(),
                    ctx.user_id().map(str::to_string),
                ));
                Ok(())
            }
        })
        .await
        .unwrap();
    queue
        .enqueue(
            Ordered { label: 7 },
            JobOptions::builder().priority(7).user_id("user-1").build(),
        )
        .await
        .unwrap();

    let done = wait_until(TIMEOUT, || {
        let seen = seen.clone();
        async move { seen.lock().await.is_some() }
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);
    assert_eq!(
        *seen.lock().await,
        Some(("Ordered".to_string(), 7, 0, Some("user-1".to_string())))
    );

    let records = history(ctx).await;
    assert_eq!(records[0].args["gitHashProcessed"], "test");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_handlers_can_enqueue_in_their_transaction(ctx: &TestHarness) {
    let queue = ctx.queue();
    let children = Arc::new(Mutex::new(Vec::new()));

    let child_queue = queue.clone();
    queue
        .register_job_func(move |ctx: JobContext, job: Parent| {
            let queue = child_queue.clone();
            async move {
                let mut tx = ctx.tx().await?;
                queue
                    .enqueue_tx(&mut **tx, Child { parent_id: job.id }, JobOptions::default())
                    .await?;
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    let sink = children.clone();
    queue
        .register_job_func(move |_ctx: JobContext, job: Child| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(job.parent_id);
                Ok(())
            }
        })
        .await
        .unwrap();
    queue.enqueue(Parent { id: 9 }, JobOptions::default()).await.unwrap();

    let done = wait_until(TIMEOUT, || {
        let children = children.clone();
        async move { !children.lock().await.is_empty() }
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);
    assert_eq!(*children.lock().await, vec![9]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_shutdown_marks_the_pool_offline(ctx: &TestHarness) {
    let queue = ctx.queue();
    queue
        .register_job_func(|_ctx: JobContext, _job: Ordered| async { Ok(()) })
        .await
        .unwrap();

    let online = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_worker_pools WHERE id = 'testpool' AND workers = 1")
            .await
            == 1
    })
    .await;
    assert!(online);

    queue.shutdown().await.unwrap();
    queue.shutdown().await.unwrap();

    assert_eq!(
        ctx.count("SELECT count(*) FROM queue_worker_pools WHERE id = 'testpool' AND workers = 0")
            .await,
        1
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_registering_while_running_restarts_the_pool(ctx: &TestHarness) {
    let queue = ctx.queue();
    queue
        .register_job_func(|_ctx: JobContext, _job: Ordered| async { Ok(()) })
        .await
        .unwrap();
    let started = wait_until(TIMEOUT, || {
        let queue = queue.clone();
        async move { queue.is_running().await }
    })
    .await;
    assert!(started);

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    queue
        .register_job_func(move |_ctx: JobContext, _job: Child| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    queue.enqueue(Child { parent_id: 1 }, JobOptions::default()).await.unwrap();

    let done = wait_until(TIMEOUT, || {
        let ran = ran.load(Ordering::SeqCst);
        async move { ran == 1 }
    })
    .await;
    assert!(done);

    let registered = wait_until(TIMEOUT, || async move {
        ctx.count(
            "SELECT count(*) FROM queue_worker_pools \
             WHERE id = 'testpool' AND cardinality(job_types) = 2",
        )
        .await
            == 1
    })
    .await;
    assert!(registered);

    let job_types: Vec<String> =
        sqlx::query_scalar("SELECT job_types FROM queue_worker_pools WHERE id = 'testpool'")
            .fetch_one(&ctx.db_pool)
            .await
            .unwrap();
    queue.shutdown().await.unwrap();
    assert_eq!(job_types, vec!["Child".to_string(), "Ordered".to_string()]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_handler_leaving_its_transaction_aborted_fails_once(ctx: &TestHarness) {
    let queue = no_retry(ctx);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    queue
        .register_job_func(move |ctx: JobContext, _job: SwallowError| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut tx = ctx.tx().await?;
                let ignored = sqlx::query("SELECT * FROM no_such_table")
                    .execute(&mut **tx)
                    .await;
                assert!(ignored.is_err());
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    queue.enqueue(SwallowError {}, JobOptions::default()).await.unwrap();

    let failed = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs WHERE error_count = 1")
            .await
            == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.shutdown().await.unwrap();
    assert!(failed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let records = history(ctx).await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].finished_at.is_some());
    assert!(
        records[0]
            .run_error
            .starts_with("job failed: job left its transaction aborted"),
        "unexpected run_error {:?}",
        records[0].run_error
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_context_kept_after_the_handler_has_no_transaction(ctx: &TestHarness) {
    let queue = ctx.queue();
    let kept = Arc::new(Mutex::new(None));

    let sink = kept.clone();
    queue
        .register_job_func(move |ctx: JobContext, _job: Ordered| {
            let sink = sink.clone();
            async move {
                *sink.lock().await = Some(ctx);
                Ok(())
            }
        })
        .await
        .unwrap();
    queue.enqueue(Ordered { label: 1 }, JobOptions::default()).await.unwrap();

    let done = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs_history WHERE success")
            .await
            == 1
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);
    assert_eq!(ctx.count("SELECT count(*) FROM queue_jobs").await, 0);

    let kept = kept.lock().await.take().unwrap();
    match kept.tx().await {
        Err(JobError::TransactionClosed(id)) => assert_eq!(id, kept.job_id()),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("transaction still reachable after the attempt"),
    };
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_restart_survives_a_failed_offline_marking(ctx: &TestHarness) {
    let queue = ctx.queue();
    queue
        .register_job_func(|_ctx: JobContext, _job: Ordered| async { Ok(()) })
        .await
        .unwrap();
    let started = wait_until(TIMEOUT, || {
        let queue = queue.clone();
        async move { queue.is_running().await }
    })
    .await;
    assert!(started);

    sqlx::query("DROP TABLE queue_worker_pools")
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    queue
        .register_job_func(move |_ctx: JobContext, _job: Child| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    queue.enqueue(Child { parent_id: 2 }, JobOptions::default()).await.unwrap();

    let done = wait_until(TIMEOUT, || {
        let ran = ran.load(Ordering::SeqCst);
        async move { ran == 1 }
    })
    .await;
    assert!(done);
    assert!(queue.is_running().await);
    queue.shutdown().await.unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_concurrent_workers_run_each_job_once(ctx: &TestHarness) {
    const JOBS: i16 = 40;

    let mut config = ctx.config();
    config.pool_size = 4;
    let queue = PostgresJobQueue::new(ctx.db_pool.clone(), config);

    let jobs: Vec<Ordered> = (0..JOBS).map(|label| Ordered { label }).collect();
    queue.enqueue(jobs, JobOptions::default()).await.unwrap();

    let runs = Arc::new(Mutex::new(HashMap::new()));
    let sink = runs.clone();
    queue
        .register_job_func(move |_ctx: JobContext, job: Ordered| {
            let sink = sink.clone();
            async move {
                *sink.lock().await.entry(job.label).or_insert(0_usize) += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }
        })
        .await
        .unwrap();

    let done = wait_until(TIMEOUT, || async move {
        ctx.count("SELECT count(*) FROM queue_jobs_history WHERE success")
            .await
            == i64::from(JOBS)
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);

    let runs = runs.lock().await;
    assert_eq!(runs.len(), usize::try_from(JOBS).unwrap());
    assert!(runs.values().all(|&count| count == 1), "{runs:?}");
    assert_eq!(
        ctx.count("SELECT count(*) FROM queue_jobs_history").await,
        i64::from(JOBS)
    );
    assert_eq!(ctx.count("SELECT count(*) FROM queue_jobs").await, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_run_at_first_ignores_priority(ctx: &TestHarness) {
    let mut config = ctx.config();
    config.poll_strategy = PollStrategy::RunAtFirst;
    let queue = PostgresJobQueue::new(ctx.db_pool.clone(), config);

    let now = Utc::now();
    for (label, minutes_ago) in [(1, 1), (9, 60), (5, 30)] {
        queue
            .enqueue(
                Ordered { label },
                JobOptions::builder()
                    .priority(label)
                    .run_at(now - TimeDelta::minutes(minutes_ago))
                    .build(),
            )
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue
        .register_job_func(move |_ctx: JobContext, job: Ordered| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(job.label);
                Ok(())
            }
        })
        .await
        .unwrap();

    let done = wait_until(TIMEOUT, || {
        let seen = seen.clone();
        async move { seen.lock().await.len() == 3 }
    })
    .await;
    queue.shutdown().await.unwrap();
    assert!(done);
    assert_eq!(*seen.lock().await, vec![9, 5, 1]);
}
