//! Handler registry.
//!
//! Maps job type strings to type-erased handlers. The key is computed once at
//! registration; dispatch is a map lookup followed by deserializing the job
//! data into the handler's record type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use serde_json::Value;

use super::context::JobContext;
use super::payload::Job;
use crate::error::{JobError, Result};

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type BoxedHandler = Arc<dyn Fn(JobContext, Value) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct JobRegistration {
    handler: BoxedHandler,
}

/// Job type → handler. Cloned into each worker pool when it starts.
#[derive(Clone, Default)]
pub struct JobRegistry {
    registrations: HashMap<String, JobRegistration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `J`.
    ///
    /// Returns the derived job type. A second handler for the same type is
    /// rejected with [`JobError::InvalidJobFunc`] and the first stays active.
    pub fn register<J, F, Fut>(&mut self, handler: F) -> Result<String>
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
        if self.registrations.contains_key(&job_type) {
            return Err(JobError::InvalidJobFunc(format!(
                "job type {job_type} already registered"
            )));
        }

        let handler = Arc::new(handler);
        let name = job_type.clone();
        let boxed_handler: BoxedHandler = Arc::new(move |ctx: JobContext, data: Value| {
            let handler = handler.clone();
            let name = name.clone();
            let fut: HandlerFuture = Box::pin(async move {
                let job: J = serde_json::from_value(data)
                    .with_context(|| format!("failed to deserialize {name}"))?;
                (*handler)(ctx, job).await
            });
            fut
        });

        self.registrations.insert(
            job_type.clone(),
            JobRegistration {
                handler: boxed_handler,
            },
        );
        Ok(job_type)
    }

    /// Run the handler for `job_type` with the raw job data.
    pub(crate) async fn execute(
        &self,
        job_type: &str,
        ctx: JobContext,
        data: Value,
    ) -> anyhow::Result<()> {
        let registration = self
            .registrations
            .get(job_type)
            .ok_or_else(|| anyhow!("no handler registered for job type {job_type}"))?;
        (registration.handler)(ctx, data).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.registrations.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
