//! Run records.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::cursor::{Cursor, Page, PageRequest};
use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Get a run by ID.
    pub async fn get_run(&self, id: RunId) -> Result<Run> {
        let mut conn = self.pool().acquire().await?;
        get_run_on(&mut conn, id).await
    }

    /// The job's most recent run, if it has any.
    pub async fn latest_run(&self, job_id: JobId) -> Result<Option<Run>> {
        let mut conn = self.pool().acquire().await?;
        latest_run_on(&mut conn, job_id).await
    }

    /// List runs newest first, optionally for one job.
    pub async fn list_runs(&self, job_id: Option<JobId>, page: &PageRequest) -> Result<Page<Run>> {
        let after = page.decode_cursor()?;
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM runs
             WHERE ($1::uuid IS NULL OR job_id = $1)
             AND ($2::timestamptz IS NULL OR (created_at, id) < ($2::timestamptz, $3::uuid))
             ORDER BY created_at DESC, id DESC
             LIMIT $4",
        )
        .bind(job_id.map(|id| id.0))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(page.fetch_limit())
        .fetch_all(self.pool())
        .await?;

        let runs = rows
            .into_iter()
            .map(RunRow::try_into_run)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(runs, page, |r| Cursor::new(r.created_at, r.id.0)))
    }
}

/// Insert the job's next run in `pending`. Callers hold the job's row lock,
/// so attempt numbers are assigned without races.
pub(crate) async fn insert_run_on(
    conn: &mut PgConnection,
    job_id: JobId,
    params: &Blob,
) -> Result<Run> {
    let now = super::now();
    let row: RunRow = sqlx::query_as(
        "INSERT INTO runs (id, job_id, attempt, status, params, created_at, updated_at)
         VALUES (
             $1, $2,
             COALESCE((SELECT MAX(attempt) FROM runs WHERE job_id = $2), 0) + 1,
             $3, $4, $5, $5
         )
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(job_id.0)
    .bind(RunStatus::Pending.as_str())
    .bind(params)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into_run()
}

pub(crate) async fn get_run_on(conn: &mut PgConnection, id: RunId) -> Result<Run> {
    let row: Option<RunRow> = sqlx::query_as("SELECT * FROM runs WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("run {id}")))?
        .try_into_run()
}

pub(crate) async fn latest_run_on(conn: &mut PgConnection, job_id: JobId) -> Result<Option<Run>> {
    let row: Option<RunRow> = sqlx::query_as(
        "SELECT * FROM runs WHERE job_id = $1 ORDER BY attempt DESC LIMIT 1",
    )
    .bind(job_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(RunRow::try_into_run).transpose()
}

/// Write a new status; `pending` clears `started_at`, terminal stamps `completed_at`.
pub(crate) async fn update_run_status_on(
    conn: &mut PgConnection,
    id: RunId,
    status: RunStatus,
    error: Option<&str>,
) -> Result<Run> {
    let now = super::now();
    let row: Option<RunRow> = sqlx::query_as(
        "UPDATE runs SET
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
    .bind(status == RunStatus::Pending)
    .bind(status.is_terminal().then_some(now))
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("run {id}")))?
        .try_into_run()
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    job_id: Uuid,
    attempt: i32,
    status: String,
    params: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl RunRow {
    fn try_into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            job_id: JobId(self.job_id),
            attempt: self.attempt as u32,
            status: self.status.parse()?,
            params: self.params,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}
