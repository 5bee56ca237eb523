//! Jobs, runs and steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Blob, JobId, JobStatus, RunId, RunStatus, StepId, StepStatus, empty_blob};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A submitted unit of work.
///
/// Mutated only by the orchestrator and by workers reporting progress. Once
/// terminal, only an owner-initiated retry moves it again, and that retry
/// adds a new run rather than rewriting old ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the workflow template that executes this job.
    pub workflow: String,
    pub status: JobStatus,
    pub input: Blob,
    pub meta: Blob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Builder for submitting a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) workflow: String,
    pub(crate) input: Blob,
    pub(crate) meta: Blob,
}

impl NewJob {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            input: empty_blob(),
            meta: empty_blob(),
        }
    }

    pub fn input(mut self, input: Blob) -> Self {
        self.input = input;
        self
    }

    pub fn meta(mut self, meta: Blob) -> Self {
        self.meta = meta;
        self
    }
}

/// Optional filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workflow: Option<String>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution attempt of a job. The most recently created run is the
/// job's active run; earlier runs are history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    /// 1-based position among the job's runs.
    pub attempt: u32,
    pub status: RunStatus,
    pub params: Blob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One node of a job's execution graph, ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub name: String,
    pub status: StepStatus,
    pub input: Blob,
    pub output: Blob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
