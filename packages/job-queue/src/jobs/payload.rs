//! Job payloads: naming, validation and the persisted envelope.

use std::any::type_name;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Carrier;
use crate::error::{JobError, Result};

/// A named record that can be enqueued and handled.
///
/// The job type defaults to the type's module path with the crate name,
/// a leading `contexts` module and the first `internal` module removed.
/// Override [`Job::job_type`] to pick a stable name of your own.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendReceipt { order_id: Uuid }
///
/// impl Job for SendReceipt {
///     fn job_type() -> String {
///         "billing.send_receipt".into()
///     }
/// }
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn job_type() -> String {
        job_type_from_path(type_name::<Self>())
    }
}

/// Derive a job type from a fully qualified Rust type path.
pub(crate) fn job_type_from_path(path: &str) -> String {
    let path = path.split('<').next().unwrap_or_default();
    let mut segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty()).collect();

    if segments.len() > 1 {
        segments.remove(0);
    }
    if segments.len() > 1 && segments[0] == "contexts" {
        segments.remove(0);
    }
    if let Some(pos) = segments[..segments.len().saturating_sub(1)]
        .iter()
        .position(|s| *s == "internal")
    {
        segments.remove(pos);
    }

    segments.join("::")
}

/// A job with its type erased, ready to be written as a row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPayload {
    job_type: String,
    struct_path: String,
    data: Value,
}

impl JobPayload {
    /// Serialize a job. Only records that encode as a JSON object are accepted.
    pub fn new<J: Job>(job: &J) -> Result<Self> {
        let job_type = J::job_type();
        if job_type.is_empty() {
            return Err(JobError::InvalidJobType(format!(
                "{} has an empty job type",
                type_name::<J>()
            )));
        }

        let data = serde_json::to_value(job).map_err(JobError::enqueue)?;
        if !data.is_object() {
            return Err(JobError::InvalidJobType(format!(
                "{job_type} does not serialize to a record"
            )));
        }

        Ok(Self {
            job_type,
            struct_path: type_name::<J>().to_string(),
            data,
        })
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn struct_path(&self) -> &str {
        &self.struct_path
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// Conversion of one or many jobs into payloads for a single enqueue call.
pub trait IntoJobPayloads {
    fn into_job_payloads(self) -> Result<Vec<JobPayload>>;
}

impl<J: Job> IntoJobPayloads for J {
    fn into_job_payloads(self) -> Result<Vec<JobPayload>> {
        Ok(vec![JobPayload::new(&self)?])
    }
}

impl<J: Job> IntoJobPayloads for Vec<J> {
    fn into_job_payloads(self) -> Result<Vec<JobPayload>> {
        non_empty(self.iter().map(JobPayload::new).collect::<Result<Vec<_>>>()?)
    }
}

impl IntoJobPayloads for JobPayload {
    fn into_job_payloads(self) -> Result<Vec<JobPayload>> {
        Ok(vec![self])
    }
}

/// Mixed job types, built with [`JobPayload::new`].
impl IntoJobPayloads for Vec<JobPayload> {
    fn into_job_payloads(self) -> Result<Vec<JobPayload>> {
        non_empty(self)
    }
}

fn non_empty(payloads: Vec<JobPayload>) -> Result<Vec<JobPayload>> {
    if payloads.is_empty() {
        return Err(JobError::InvalidJobType("empty job collection".into()));
    }
    Ok(payloads)
}

/// The `args` column of a job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistencePayload {
    #[serde(default)]
    pub job_data: Value,
    #[serde(default)]
    pub job_struct_path: String,
    #[serde(default)]
    pub git_hash_enqueued: String,
    #[serde(default)]
    pub git_hash_processed: String,
    #[serde(default)]
    pub ctx: PayloadContext,
}

/// Caller context captured at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub carrier: Carrier,
}

impl PersistencePayload {
    pub(crate) fn new(payload: &JobPayload, git_hash: &str, ctx: PayloadContext) -> Self {
        Self {
            job_data: payload.data.clone(),
            job_struct_path: payload.struct_path.clone(),
            git_hash_enqueued: git_hash.to_string(),
            git_hash_processed: String::new(),
            ctx,
        }
    }

    /// Decode the `args` column. Missing or null job data becomes `{}`.
    pub fn from_args(args: &Value) -> Result<Self, serde_json::Error> {
        let mut payload: Self = serde_json::from_value(args.clone())?;
        if payload.job_data.is_null() {
            payload.job_data = Value::Object(Default::default());
        }
        Ok(payload)
    }
}
