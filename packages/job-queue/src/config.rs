use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use rand::Rng;
use typed_builder::TypedBuilder;

use crate::jobs::{Backoff, PollStrategy};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SCHEDULE_HORIZON: Duration = Duration::from_secs(60 * 60);

/// Settings for one queue instance and its worker pool.
///
/// ```ignore
/// let config = QueueConfig::builder()
///     .queue("mail")
///     .pool_size(4)
///     .poll_interval(Duration::from_secs(1))
///     .build();
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct QueueConfig {
    /// Queue name. The empty string is the default queue.
    #[builder(default, setter(into))]
    pub queue: String,
    /// Idle sleep between polls and the debounce before the pool starts.
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    #[builder(default = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,
    /// Identity reported in `queue_worker_pools`.
    #[builder(default = random_pool_name(), setter(into))]
    pub pool_name: String,
    #[builder(default)]
    pub poll_strategy: PollStrategy,
    #[builder(default)]
    pub backoff: Backoff,
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,
    #[builder(default = DEFAULT_SCHEDULE_INTERVAL)]
    pub schedule_interval: Duration,
    /// How far ahead recurring jobs are materialized.
    #[builder(default = DEFAULT_SCHEDULE_HORIZON)]
    pub schedule_horizon: Duration,
    /// Build identifier stamped on enqueued and processed jobs.
    #[builder(default = default_git_hash(), setter(into))]
    pub git_hash: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl QueueConfig {
    /// Load queue settings from `JOBS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(queue) = lookup("JOBS_QUEUE") {
            config.queue = queue;
        }
        if let Some(ms) = lookup("JOBS_POLL_INTERVAL_MS") {
            let ms: u64 = ms
                .parse()
                .context("JOBS_POLL_INTERVAL_MS must be a number of milliseconds")?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = lookup("JOBS_POOL_SIZE") {
            config.pool_size = size.parse().context("JOBS_POOL_SIZE must be a valid number")?;
        }
        if let Some(name) = lookup("JOBS_POOL_NAME") {
            config.pool_name = name;
        }
        if let Some(strategy) = lookup("JOBS_POLL_STRATEGY") {
            config.poll_strategy = strategy.parse()?;
        }
        if let Some(secs) = lookup("JOBS_HEARTBEAT_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .context("JOBS_HEARTBEAT_INTERVAL_SECS must be a number of seconds")?;
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("JOBS_SCHEDULE_HORIZON_SECS") {
            let secs: u64 = secs
                .parse()
                .context("JOBS_SCHEDULE_HORIZON_SECS must be a number of seconds")?;
            config.schedule_horizon = Duration::from_secs(secs);
        }
        if let Some(hash) = lookup("GIT_HASH") {
            config.git_hash = hash;
        }

        Ok(config)
    }
}

/// Configuration for the `jobs_cli` binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue: QueueConfig::from_env()?,
        })
    }
}

fn random_pool_name() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..5)
        .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
        .collect()
}

fn default_git_hash() -> String {
    option_env!("GIT_HASH").unwrap_or("unknown").to_string()
}
