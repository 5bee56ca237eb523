//! The lease protocol.
//!
//! Every transition is one conditional UPDATE on the current state, so two
//! workers racing for the same row cannot both win. A miss (zero rows) is
//! resolved afterwards into the precise error: `NotFound`, `NotLeased` or
//! `InvalidTransition`.
//!
//! Delivery is at-least-once: a lease that outlives its deadline is reclaimed
//! by the sweep and may run again elsewhere.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use uuid::Uuid;

use super::cursor::{Cursor, Page, PageRequest};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

/// Reason recorded when the sweep reclaims an expired lease.
pub const LEASE_EXPIRED: &str = "lease_expired";

impl super::Db {
    /// Create a pending item for a job. Fails with `DuplicateEnqueue` while
    /// the job already has a pending or leased item.
    pub async fn enqueue(&self, job_id: JobId, payload: &Blob) -> Result<QueueItem> {
        let mut conn = self.pool().acquire().await?;
        enqueue_on(&mut conn, job_id, payload).await
    }

    /// Claim the oldest pending item. `None` means the queue is empty.
    pub async fn lease(&self, worker_id: &str, lease: Duration) -> Result<Option<QueueItem>> {
        let mut conn = self.pool().acquire().await?;
        lease_on(&mut conn, worker_id, lease).await
    }

    /// Push the deadline of a lease held by `worker_id`.
    pub async fn extend_lease(
        &self,
        id: QueueItemId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<QueueItem> {
        let now = super::now();
        let row: Option<QueueItemRow> = sqlx::query_as(
            "UPDATE queue_items SET lease_expires_at = $3, updated_at = $4
             WHERE id = $1 AND state = 'leased' AND leased_by = $2
             RETURNING *",
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(deadline(now, lease)?)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                record_op("extend");
                row.try_into_item()
            }
            None => {
                let mut conn = self.pool().acquire().await?;
                // Held by someone else counts as not leased for this caller.
                let item = get_item_on(&mut conn, id).await?;
                Err(Error::NotLeased(item.id.to_string()))
            }
        }
    }

    /// `leased -> done`, only for the worker holding the lease.
    pub async fn complete(&self, id: QueueItemId, worker_id: &str) -> Result<QueueItem> {
        let mut conn = self.pool().acquire().await?;
        complete_on(&mut conn, id, worker_id).await
    }

    /// `leased -> pending`, counting one more attempt.
    pub async fn requeue(&self, id: QueueItemId, reason: &str) -> Result<QueueItem> {
        let mut conn = self.pool().acquire().await?;
        requeue_on(&mut conn, id, reason).await
    }

    /// Requeue, or dead-letter once attempts exceed `max_attempts`. Only
    /// the worker holding the lease may report the failure.
    pub async fn requeue_or_dead_letter(
        &self,
        id: QueueItemId,
        worker_id: &str,
        reason: &str,
        max_attempts: u32,
    ) -> Result<RequeueOutcome> {
        let mut conn = self.pool().acquire().await?;
        requeue_or_dead_letter_on(&mut conn, id, worker_id, reason, max_attempts).await
    }

    /// Any non-terminal state `-> dead`.
    pub async fn dead_letter(&self, id: QueueItemId, reason: &str) -> Result<QueueItem> {
        let mut conn = self.pool().acquire().await?;
        dead_letter_on(&mut conn, id, reason).await
    }

    /// Requeue every lease whose deadline passed before `now`.
    pub async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<RequeueOutcome>> {
        let mut conn = self.pool().acquire().await?;
        reclaim_expired_on(&mut conn, now, max_attempts).await
    }

    pub async fn get_queue_item(&self, id: QueueItemId) -> Result<QueueItem> {
        let mut conn = self.pool().acquire().await?;
        get_item_on(&mut conn, id).await
    }

    /// The job's pending or leased item, if it has one.
    pub async fn live_queue_item(&self, job_id: JobId) -> Result<Option<QueueItem>> {
        let mut conn = self.pool().acquire().await?;
        live_item_on(&mut conn, job_id).await
    }

    /// Whether the job behind a leased item was cancelled.
    pub async fn cancel_requested(&self, id: QueueItemId) -> Result<bool> {
        Ok(self.get_queue_item(id).await?.cancel_requested)
    }

    /// Per-state counts. A best-effort snapshot, not a consistent read
    /// against concurrent writers.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let (pending, leased, done, dead, total): (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT
                 COUNT(*) FILTER (WHERE state = 'pending'),
                 COUNT(*) FILTER (WHERE state = 'leased'),
                 COUNT(*) FILTER (WHERE state = 'done'),
                 COUNT(*) FILTER (WHERE state = 'dead'),
                 COUNT(*)
             FROM queue_items",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(QueueStats {
            pending,
            leased,
            done,
            dead,
            total,
        })
    }

    /// List items oldest first (dispatch order), optionally in one state.
    pub async fn list_queue_items(
        &self,
        state: Option<QueueState>,
        page: &PageRequest,
    ) -> Result<Page<QueueItem>> {
        let after = page.decode_cursor()?;
        let rows: Vec<QueueItemRow> = sqlx::query_as(
            "SELECT * FROM queue_items
             WHERE ($1::text IS NULL OR state = $1)
             AND ($2::timestamptz IS NULL OR (created_at, id) > ($2::timestamptz, $3::uuid))
             ORDER BY created_at ASC, id ASC
             LIMIT $4",
        )
        .bind(state.map(QueueState::as_str))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(page.fetch_limit())
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .into_iter()
            .map(QueueItemRow::try_into_item)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(items, page, |i| Cursor::new(i.created_at, i.id.0)))
    }
}

// ---------------------------------------------------------------------------
// Inner functions, shared with the orchestrator's transactions.
// ---------------------------------------------------------------------------

pub(crate) async fn enqueue_on(
    conn: &mut PgConnection,
    job_id: JobId,
    payload: &Blob,
) -> Result<QueueItem> {
    let now = super::now();
    let row: QueueItemRow = sqlx::query_as(
        "INSERT INTO queue_items (id, job_id, state, data, created_at, updated_at)
         VALUES ($1, $2, 'pending', $3, $4, $4)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(job_id.0)
    .bind(payload)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match Error::from(e) {
        Error::DuplicateEnqueue(_) => Error::DuplicateEnqueue(job_id.to_string()),
        other => other,
    })?;

    record_op("enqueue");
    row.try_into_item()
}

/// Single read-modify-write: the inner SELECT locks the oldest pending row
/// and skips rows other leasers hold, so concurrent callers never share one.
pub(crate) async fn lease_on(
    conn: &mut PgConnection,
    worker_id: &str,
    lease: Duration,
) -> Result<Option<QueueItem>> {
    let now = super::now();
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items
         SET state = 'leased', leased_at = $1, lease_expires_at = $2, leased_by = $3, updated_at = $1
         WHERE state = 'pending' AND id = (
             SELECT id FROM queue_items
             WHERE state = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING *",
    )
    .bind(now)
    .bind(deadline(now, lease)?)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?;

    record_op(if row.is_some() { "lease" } else { "lease_empty" });
    row.map(QueueItemRow::try_into_item).transpose()
}

pub(crate) async fn complete_on(
    conn: &mut PgConnection,
    id: QueueItemId,
    worker_id: &str,
) -> Result<QueueItem> {
    let now = super::now();
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items
         SET state = 'done', completed_at = $2, updated_at = $2,
             leased_at = NULL, lease_expires_at = NULL, leased_by = NULL
         WHERE id = $1 AND state = 'leased' AND leased_by = $3
         RETURNING *",
    )
    .bind(id.0)
    .bind(now)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(not_leased(conn, id).await);
    };
    record_op("complete");
    row.try_into_item()
}

pub(crate) async fn requeue_on(
    conn: &mut PgConnection,
    id: QueueItemId,
    reason: &str,
) -> Result<QueueItem> {
    let now = super::now();
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items
         SET state = 'pending', attempts = attempts + 1, last_error = $3, updated_at = $2,
             leased_at = NULL, lease_expires_at = NULL, leased_by = NULL, completed_at = NULL
         WHERE id = $1 AND state = 'leased'
         RETURNING *",
    )
    .bind(id.0)
    .bind(now)
    .bind(reason)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(not_leased(conn, id).await);
    };
    record_op("requeue");
    row.try_into_item()
}

pub(crate) async fn requeue_or_dead_letter_on(
    conn: &mut PgConnection,
    id: QueueItemId,
    worker_id: &str,
    reason: &str,
    max_attempts: u32,
) -> Result<RequeueOutcome> {
    let now = super::now();
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items SET
             attempts = attempts + 1,
             state = CASE WHEN cancel_requested OR attempts + 1 > $2 THEN 'dead' ELSE 'pending' END,
             completed_at = CASE WHEN cancel_requested OR attempts + 1 > $2 THEN $3 ELSE NULL END,
             leased_at = NULL, lease_expires_at = NULL, leased_by = NULL,
             last_error = $4, updated_at = $3
         WHERE id = $1 AND state = 'leased' AND leased_by = $5
         RETURNING *",
    )
    .bind(id.0)
    .bind(attempt_bound(max_attempts))
    .bind(now)
    .bind(reason)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(not_leased(conn, id).await);
    };
    outcome(row.try_into_item()?)
}

pub(crate) async fn dead_letter_on(
    conn: &mut PgConnection,
    id: QueueItemId,
    reason: &str,
) -> Result<QueueItem> {
    let now = super::now();
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items
         SET state = 'dead', completed_at = $2, updated_at = $2, last_error = $3,
             leased_at = NULL, lease_expires_at = NULL, leased_by = NULL
         WHERE id = $1 AND state IN ('pending', 'leased')
         RETURNING *",
    )
    .bind(id.0)
    .bind(now)
    .bind(reason)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            record_op("dead_letter");
            row.try_into_item()
        }
        None => {
            let item = get_item_on(conn, id).await?;
            Err(Error::transition("queue", item.state, QueueState::Dead))
        }
    }
}

/// Flag a leased item so its worker stops cooperatively.
pub(crate) async fn request_cancel_on(conn: &mut PgConnection, id: QueueItemId) -> Result<QueueItem> {
    let row: Option<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items SET cancel_requested = TRUE, updated_at = $2
         WHERE id = $1 AND state = 'leased'
         RETURNING *",
    )
    .bind(id.0)
    .bind(super::now())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(not_leased(conn, id).await);
    };
    record_op("cancel");
    row.try_into_item()
}

pub(crate) async fn reclaim_expired_on(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    max_attempts: u32,
) -> Result<Vec<RequeueOutcome>> {
    let rows: Vec<QueueItemRow> = sqlx::query_as(
        "UPDATE queue_items SET
             attempts = attempts + 1,
             state = CASE WHEN cancel_requested OR attempts + 1 > $2 THEN 'dead' ELSE 'pending' END,
             completed_at = CASE WHEN cancel_requested OR attempts + 1 > $2 THEN $1 ELSE NULL END,
             leased_at = NULL, lease_expires_at = NULL, leased_by = NULL,
             last_error = $3, updated_at = $1
         WHERE state = 'leased' AND lease_expires_at < $1
         RETURNING *",
    )
    .bind(now)
    .bind(attempt_bound(max_attempts))
    .bind(LEASE_EXPIRED)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| outcome(row.try_into_item()?))
        .collect()
}

pub(crate) async fn get_item_on(conn: &mut PgConnection, id: QueueItemId) -> Result<QueueItem> {
    let row: Option<QueueItemRow> = sqlx::query_as("SELECT * FROM queue_items WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("queue item {id}")))?
        .try_into_item()
}

/// Fetch an item and hold its row lock until the transaction ends.
pub(crate) async fn lock_item_on(conn: &mut PgConnection, id: QueueItemId) -> Result<QueueItem> {
    let row: Option<QueueItemRow> =
        sqlx::query_as("SELECT * FROM queue_items WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
    row.ok_or_else(|| Error::NotFound(format!("queue item {id}")))?
        .try_into_item()
}

/// Lock the job's live item, if any. Orchestrator transactions lock the
/// queue item before the job, the same order `lease_on` uses.
pub(crate) async fn lock_live_item_on(
    conn: &mut PgConnection,
    job_id: JobId,
) -> Result<Option<QueueItem>> {
    let row: Option<QueueItemRow> = sqlx::query_as(
        "SELECT * FROM queue_items
         WHERE job_id = $1 AND state IN ('pending', 'leased')
         FOR UPDATE",
    )
    .bind(job_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(QueueItemRow::try_into_item).transpose()
}

/// The job's most recently created item in any state.
pub(crate) async fn latest_item_on(conn: &mut PgConnection, job_id: JobId) -> Result<Option<QueueItem>> {
    let row: Option<QueueItemRow> = sqlx::query_as(
        "SELECT * FROM queue_items WHERE job_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(job_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(QueueItemRow::try_into_item).transpose()
}

pub(crate) async fn live_item_on(conn: &mut PgConnection, job_id: JobId) -> Result<Option<QueueItem>> {
    let row: Option<QueueItemRow> = sqlx::query_as(
        "SELECT * FROM queue_items WHERE job_id = $1 AND state IN ('pending', 'leased')",
    )
    .bind(job_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(QueueItemRow::try_into_item).transpose()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether `worker_id` holds the lease on `item`. A lease reclaimed and
/// handed to another worker keeps the item id, so state alone is not enough.
pub(crate) fn ensure_held(item: &QueueItem, worker_id: &str) -> Result<()> {
    if item.state == QueueState::Leased && item.leased_by.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(Error::NotLeased(item.id.to_string()))
    }
}

/// Resolve a missed `state = 'leased'` update into the caller-facing error.
async fn not_leased(conn: &mut PgConnection, id: QueueItemId) -> Error {
    match get_item_on(conn, id).await {
        Ok(item) => Error::NotLeased(item.id.to_string()),
        Err(e) => e,
    }
}

fn outcome(item: QueueItem) -> Result<RequeueOutcome> {
    match item.state {
        QueueState::Pending => {
            record_op("requeue");
            Ok(RequeueOutcome::Requeued(item))
        }
        QueueState::Dead => {
            record_op("dead_letter");
            Ok(RequeueOutcome::DeadLettered(item))
        }
        other => Err(Error::Other(format!(
            "queue item {} landed in unexpected state {other}",
            item.id
        ))),
    }
}

fn deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = TimeDelta::from_std(lease)
        .map_err(|e| Error::Other(format!("lease duration out of range: {e}")))?;
    now.checked_add_signed(lease)
        .ok_or_else(|| Error::Other("lease deadline out of range".to_string()))
}

fn attempt_bound(max_attempts: u32) -> i32 {
    i32::try_from(max_attempts).unwrap_or(i32::MAX)
}

fn record_op(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: Uuid,
    job_id: Uuid,
    state: String,
    data: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    cancel_requested: bool,
    leased_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    leased_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl QueueItemRow {
    fn try_into_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: QueueItemId(self.id),
            job_id: JobId(self.job_id),
            state: self.state.parse()?,
            data: self.data,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            cancel_requested: self.cancel_requested,
            leased_by: self.leased_by,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            leased_at: self.leased_at,
            completed_at: self.completed_at,
        })
    }
}
