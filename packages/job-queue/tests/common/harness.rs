//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across all tests. Every test gets its own
//! freshly migrated database on that container, so worker pools in different
//! tests never see each other's rows.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use job_queue::{Backoff, QueueConfig};
use sqlx::{Connection, PgConnection, PgPool};
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Base URL without a database name.
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=job_queue=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=500"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        Ok(Self {
            server_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }

    /// Each test runs on its own runtime, so the admin connection is not shared.
    async fn fresh_database(&self) -> Result<String> {
        let mut admin = PgConnection::connect(&format!("{}/postgres", self.server_url))
            .await
            .context("Failed to connect to Postgres")?;
        let name = format!("jobs_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&mut admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await?;
        Ok(format!("{}/{}", self.server_url, name))
    }
}

/// Test harness that manages test infrastructure.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let queue = ctx.queue();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Pool on this test's private, migrated database.
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let url = infra.fresh_database().await?;

        let db_pool = PgPool::connect(&url)
            .await
            .context("Failed to connect to test database")?;
        job_queue::migrate(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { db_pool })
    }

    /// Fast settings: one worker, 10ms polling, immediate retries.
    pub fn config(&self) -> QueueConfig {
        QueueConfig::builder()
            .pool_name("testpool")
            .pool_size(1)
            .poll_interval(Duration::from_millis(10))
            .backoff(Backoff::None)
            .heartbeat_interval(Duration::from_millis(100))
            .schedule_interval(Duration::from_millis(100))
            .git_hash("test")
            .build()
    }

    pub fn queue(&self) -> job_queue::PostgresJobQueue {
        job_queue::PostgresJobQueue::new(self.db_pool.clone(), self.config())
    }

    pub fn repository(&self) -> job_queue::JobsRepository {
        job_queue::JobsRepository::new(self.db_pool.clone())
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(&self.db_pool)
            .await
            .expect("count query failed")
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
