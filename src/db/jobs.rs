//! Job records.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::cursor::{Cursor, Page, PageRequest};
use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool().acquire().await?;
        get_job_on(&mut conn, id).await
    }

    /// List jobs newest first, optionally filtered by status and workflow.
    pub async fn list_jobs(&self, filter: &JobFilter, page: &PageRequest) -> Result<Page<Job>> {
        let after = page.decode_cursor()?;
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs
             WHERE ($1::text IS NULL OR status = $1)
             AND ($2::text IS NULL OR workflow = $2)
             AND ($3::timestamptz IS NULL OR (created_at, id) < ($3::timestamptz, $4::uuid))
             ORDER BY created_at DESC, id DESC
             LIMIT $5",
        )
        .bind(filter.status.map(JobStatus::as_str))
        .bind(filter.workflow.as_deref())
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(page.fetch_limit())
        .fetch_all(self.pool())
        .await?;

        let jobs = rows
            .into_iter()
            .map(JobRow::try_into_job)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(jobs, page, |j| Cursor::new(j.created_at, j.id.0)))
    }

    /// Jobs that should be queued or running but have no live queue item and
    /// have not been touched since `stale_before`.
    pub async fn find_orphaned_jobs(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs j
             WHERE j.status IN ('queued', 'running')
             AND j.updated_at < $1
             AND NOT EXISTS (
                 SELECT 1 FROM queue_items q
                 WHERE q.job_id = j.id AND q.state IN ('pending', 'leased')
             )
             ORDER BY j.created_at ASC, j.id ASC
             LIMIT $2",
        )
        .bind(stale_before)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

// ---------------------------------------------------------------------------
// Inner functions take &mut PgConnection so they run on a pooled
// connection or inside a transaction alike.
// ---------------------------------------------------------------------------

pub(crate) async fn insert_job_on(conn: &mut PgConnection, new: &NewJob) -> Result<Job> {
    let now = super::now();
    let row: JobRow = sqlx::query_as(
        "INSERT INTO jobs (id, workflow, status, input, meta, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&new.workflow)
    .bind(JobStatus::Queued.as_str())
    .bind(&new.input)
    .bind(&new.meta)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into_job()
}

pub(crate) async fn get_job_on(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
        .try_into_job()
}

/// Fetch a job and hold its row lock until the transaction ends.
pub(crate) async fn lock_job_on(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
        .try_into_job()
}

/// Write a new status, keeping `started_at`/`completed_at` consistent with it.
///
/// Back in `queued` means not started; any terminal status stamps completion.
pub(crate) async fn update_job_status_on(
    conn: &mut PgConnection,
    id: JobId,
    status: JobStatus,
    error: Option<&str>,
) -> Result<Job> {
    let now = super::now();
    let row: Option<JobRow> = sqlx::query_as(
        "UPDATE jobs SET
             status = $2,
             updated_at = $3,
             started_at = CASE WHEN $4 THEN NULL ELSE COALESCE(started_at, $3) END,
             completed_at = $5,
             error = $6
         WHERE id = $1
         RETURNING *",
    )
    .bind(id.0)
    .bind(status.as_str())
    .bind(now)
    .bind(status == JobStatus::Queued)
    .bind(status.is_terminal().then_some(now))
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
        .try_into_job()
}

/// Delete a job; runs, steps, events, artifacts and queue items cascade.
pub(crate) async fn delete_job_on(conn: &mut PgConnection, id: JobId) -> Result<()> {
    let rows = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(Error::NotFound(format!("job {id}")));
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    workflow: String,
    status: String,
    input: serde_json::Value,
    meta: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            workflow: self.workflow,
            status: self.status.parse()?,
            input: self.input,
            meta: self.meta,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}
