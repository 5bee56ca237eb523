//! Queue items: the dispatch unit workers compete for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Blob, Job, JobId, QueueItemId, QueueState, Run};

/// A claimable piece of outstanding work for one job.
///
/// `leased_at`, `lease_expires_at` and `leased_by` are set iff the item is
/// leased; `completed_at` is set iff it is done or dead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub job_id: JobId,
    pub state: QueueState,
    pub data: Blob,
    /// Times the item went back to pending (or would have, before dying).
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set when the job was cancelled while leased. Workers poll it.
    pub cancel_requested: bool,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Whether the lease deadline is behind `now`. Always false unless leased.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == QueueState::Leased && self.lease_expires_at.is_some_and(|t| t < now)
    }
}

/// Point-in-time count of queue items per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub done: i64,
    pub dead: i64,
    pub total: i64,
}

/// Where a failed or expired item landed.
#[derive(Debug, Clone)]
pub enum RequeueOutcome {
    /// Back in pending for another attempt.
    Requeued(QueueItem),
    /// Attempts exhausted (or cancelled): terminal.
    DeadLettered(QueueItem),
}

impl RequeueOutcome {
    pub fn item(&self) -> &QueueItem {
        match self {
            RequeueOutcome::Requeued(item) | RequeueOutcome::DeadLettered(item) => item,
        }
    }
}

/// A leased item together with the job and run it executes.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub item: QueueItem,
    pub job: Job,
    pub run: Run,
}
