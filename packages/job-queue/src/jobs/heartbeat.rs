//! Liveness registration of worker pools.
//!
//! A running pool upserts its `queue_worker_pools` row and re-asserts its
//! schedule rows every `heartbeat_interval`. Readers treat a row without a
//! recent heartbeat as stale; `workers = 0` marks a clean shutdown.

use std::time::Duration;

use sqlx::PgPool;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scheduler::{self, SharedSchedules};
use crate::error::Result;

/// The row a pool writes about itself.
#[derive(Debug, Clone)]
pub(crate) struct PoolRegistration {
    pub id: String,
    pub queue: String,
    pub workers: i16,
    pub git_hash: String,
    pub job_types: Vec<String>,
}

impl PoolRegistration {
    pub(crate) fn offline(&self) -> Self {
        Self {
            workers: 0,
            ..self.clone()
        }
    }
}

pub(crate) async fn register_pool(pool: &PgPool, registration: &PoolRegistration) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO queue_worker_pools (id, queue, workers, git_hash, job_types, updated_at)
        VALUES ($1, $2, $3, $4, $5, now())
        ON CONFLICT (id, queue) DO UPDATE
        SET workers = EXCLUDED.workers,
            git_hash = EXCLUDED.git_hash,
            job_types = EXCLUDED.job_types,
            updated_at = now()
        "#,
    )
    .bind(&registration.id)
    .bind(&registration.queue)
    .bind(registration.workers)
    .bind(&registration.git_hash)
    .bind(&registration.job_types)
    .execute(pool)
    .await?;
    Ok(())
}

/// Heartbeat loop of a running pool. Store errors are logged and retried on
/// the next tick.
pub(crate) struct HeartbeatTask {
    pub pool: PgPool,
    pub registration: PoolRegistration,
    pub interval: Duration,
    pub schedules: SharedSchedules,
    pub shutdown: CancellationToken,
}

impl HeartbeatTask {
    pub(crate) async fn run(self) -> Result<()> {
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }
        Ok(())
    }

    async fn beat(&self) {
        if let Err(e) = register_pool(&self.pool, &self.registration).await {
            warn!(pool = %self.registration.id, error = %e, "could not register worker pool");
        }

        let schedules = scheduler::snapshot(&self.schedules);
        if schedules.is_empty() {
            return;
        }
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pool = %self.registration.id, error = %e, "could not refresh schedules");
                return;
            }
        };
        for entry in &schedules {
            if let Err(e) = scheduler::upsert(&mut conn, &self.registration.queue, entry).await {
                warn!(spec = %entry.spec_text, error = %e, "could not refresh schedule");
            }
        }
        debug!(pool = %self.registration.id, schedules = schedules.len(), "heartbeat");
    }
}
