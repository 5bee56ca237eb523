//! Supporting records: audit events, artifacts, agents and workflows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, AgentStatus, ArtifactId, Blob, EventId, JobId, RunId, StepId, empty_blob};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Append-only audit entry scoped to a job (and optionally a step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub job_id: JobId,
    pub step_id: Option<StepId>,
    /// Dotted event name, e.g. `job.created`, `step.succeeded`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub data: Blob,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub job_id: JobId,
    pub step_id: Option<StepId>,
    pub event_type: String,
    pub message: String,
    pub data: Blob,
}

impl NewEvent {
    pub fn new(job_id: JobId, event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id,
            step_id: None,
            event_type: event_type.into(),
            message: message.into(),
            data: empty_blob(),
        }
    }

    pub fn step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn data(mut self, data: Blob) -> Self {
        self.data = data;
        self
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Metadata for an output blob. The bytes live elsewhere, at `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: Option<JobId>,
    pub run_id: Option<RunId>,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub size: i64,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub job_id: Option<JobId>,
    pub run_id: Option<RunId>,
    pub artifact_type: String,
    pub name: String,
    pub size: i64,
    pub path: String,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A registered worker identity. Leases live on queue items, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub metadata: Blob,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A named, versioned template. Jobs refer to it by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    pub schema: Blob,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
