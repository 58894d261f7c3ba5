use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::context::JobContext;
use super::payload::{IntoJobPayloads, Job, JobPayload};
use super::queue::{JobOptions, JobQueue};
use super::scheduler::ScheduleSpec;
use crate::error::{JobError, Result};

/// A queue that validates its input and discards it.
///
/// For hosts and tests that run without a database. Payload shape, duplicate
/// handlers and schedule specs are checked exactly like the Postgres queue.
#[derive(Debug, Default)]
pub struct NoopJobQueue {
    registered: Mutex<HashSet<String>>,
}

impl NoopJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for NoopJobQueue {
    async fn enqueue<P>(&self, jobs: P, _options: JobOptions) -> Result<()>
    where
        P: IntoJobPayloads + Send,
    {
        jobs.into_job_payloads()?;
        Ok(())
    }

    async fn register_job_func<J, F, Fut>(&self, _handler: F) -> Result<()>
    where
        J: Job,
        F: Fn(JobContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job_type = J::job_type();
        if job_type.is_empty() {
            return Err(JobError::InvalidJobType(format!(
                "{} has an empty job type",
                std::any::type_name::<J>()
            )));
        }

        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        if !registered.insert(job_type.clone()) {
            return Err(JobError::InvalidJobFunc(format!(
                "job type {job_type} already registered"
            )));
        }
        Ok(())
    }

    async fn schedule<J: Job>(&self, spec: &str, job: J) -> Result<()> {
        ScheduleSpec::parse(spec)?;
        JobPayload::new(&job).map_err(JobError::schedule)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
