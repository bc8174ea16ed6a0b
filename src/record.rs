//! Wire records and their classification.
//!
//! Push events and database reads both deliver raw [`JobRecord`]s, and the
//! status query delivers a [`StatusReport`]. Both are resolved exactly once,
//! at the ingestion boundary, into the closed [`JobUpdate`] type:
//!
//! ```text
//!   JobRecord ──classify()──→ JobUpdate::SubJob   (non-empty sub_job_id)
//!                         └─→ JobUpdate::MainJob  (everything else)
//!
//!   StatusReport ──into_job()──→ Option<Job>      (None = nothing known yet)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::job::{Job, JobId, JobStatus, JobStep, SubJob};

/// Kind of change carried by a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
}

/// A raw job-or-sub-job row as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Row identifier. Its type is backend-defined.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub main_job_id: Option<String>,
    #[serde(default)]
    pub sub_job_id: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Some producers put the result next to the status.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Carries `steps` and `result` for the main job.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Returns the sub-job identifier when this record describes a stage.
    pub fn sub_job_id(&self) -> Option<&str> {
        self.sub_job_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A record resolved into the projection it updates.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    MainJob(Job),
    SubJob(SubJob),
}

impl JobUpdate {
    /// Classify a raw record.
    ///
    /// `tracked` fills in the job id when the record omits `main_job_id`.
    pub fn classify(record: JobRecord, tracked: &JobId) -> SyncResult<Self> {
        let status: JobStatus = record.status.parse()?;

        if let Some(sub_job_id) = record.sub_job_id() {
            return Ok(JobUpdate::SubJob(SubJob {
                sub_job_id: sub_job_id.to_string(),
                name: record.job_name.unwrap_or_default(),
                status,
                created_at: record.created_at,
                updated_at: record.updated_at,
                metadata: record.metadata,
            }));
        }

        let steps = match record.metadata.get("steps") {
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(steps) => serde_json::from_value::<Vec<JobStep>>(steps.clone())
                .map_err(|e| SyncError::InvalidRecord(format!("malformed steps: {e}")))?,
        };
        let result = record
            .metadata
            .get("result")
            .filter(|r| !r.is_null())
            .cloned()
            .or(record.result.filter(|r| !r.is_null()));

        let job = Job {
            job_id: record
                .main_job_id
                .map(JobId::new)
                .unwrap_or_else(|| tracked.clone()),
            symbol: record.symbol,
            job_name: record.job_name,
            status,
            result,
            error: record.error,
            steps,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        Ok(JobUpdate::MainJob(normalize(job)))
    }
}

/// Response of the status query.
///
/// A "no job found" reply carries only `completed = false` and a `message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReport {
    /// Project the report onto the tracked job.
    ///
    /// Returns `Ok(None)` when the report does not describe the job yet.
    /// A report without `updated_at` is stamped with `received_at`, the time
    /// it was fetched, so successive polls keep ordering forward.
    pub fn into_job(self, tracked: &JobId, received_at: DateTime<Utc>) -> SyncResult<Option<Job>> {
        let status = match self.status.as_deref() {
            Some(s) => s.parse()?,
            None if self.completed => JobStatus::Completed,
            None if self.error.is_some() => JobStatus::Failed,
            None => return Ok(None),
        };
        let updated_at = self.updated_at.unwrap_or(received_at);

        Ok(Some(normalize(Job {
            job_id: tracked.clone(),
            symbol: self.symbol,
            job_name: None,
            status,
            result: self.result.filter(|r| !r.is_null()),
            error: self.error,
            steps: self.steps,
            created_at: self.created_at,
            updated_at,
        })))
    }
}

/// `result` only accompanies `Completed`, `error` only accompanies `Failed`.
fn normalize(mut job: Job) -> Job {
    match job.status {
        JobStatus::Completed => job.error = None,
        JobStatus::Failed => {
            job.error = Some(job.failure_message());
            job.result = None;
        }
        JobStatus::Pending | JobStatus::Running => job.result = None,
    }
    job
}
