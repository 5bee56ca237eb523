//! Step records.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Get a step by ID.
    pub async fn get_step(&self, id: StepId) -> Result<Step> {
        let mut conn = self.pool().acquire().await?;
        get_step_on(&mut conn, id).await
    }

    /// All steps of a job in execution order.
    pub async fn list_steps(&self, job_id: JobId) -> Result<Vec<Step>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT * FROM steps WHERE job_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(job_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(StepRow::try_into_step).collect()
    }
}

pub(crate) async fn insert_step_on(
    conn: &mut PgConnection,
    job_id: JobId,
    name: &str,
    input: &Blob,
    status: StepStatus,
) -> Result<Step> {
    let now = super::now();
    let started_at = (status != StepStatus::Pending).then_some(now);
    let row: StepRow = sqlx::query_as(
        "INSERT INTO steps (id, job_id, name, status, input, created_at, updated_at, started_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(job_id.0)
    .bind(name)
    .bind(status.as_str())
    .bind(input)
    .bind(now)
    .bind(started_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into_step()
}

pub(crate) async fn get_step_on(conn: &mut PgConnection, id: StepId) -> Result<Step> {
    let row: Option<StepRow> = sqlx::query_as("SELECT * FROM steps WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("step {id}")))?
        .try_into_step()
}

/// Write a new status. `output` replaces the stored output when given.
pub(crate) async fn update_step_status_on(
    conn: &mut PgConnection,
    id: StepId,
    status: StepStatus,
    output: Option<&Blob>,
    error: Option<&str>,
) -> Result<Step> {
    let now = super::now();
    let row: Option<StepRow> = sqlx::query_as(
        "UPDATE steps SET
             status = $2,
             updated_at = $3,
             started_at = COALESCE(started_at, $3),
             completed_at = $4,
             output = COALESCE($5, output),
             error = $6
         WHERE id = $1
         RETURNING *",
    )
    .bind(id.0)
    .bind(status.as_str())
    .bind(now)
    .bind(status.is_terminal().then_some(now))
    .bind(output)
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("step {id}")))?
        .try_into_step()
}

/// Mark every pending step of a job as skipped. Returns how many changed.
pub(crate) async fn skip_pending_steps_on(conn: &mut PgConnection, job_id: JobId) -> Result<u64> {
    let now = super::now();
    let rows = sqlx::query(
        "UPDATE steps SET status = 'skipped', updated_at = $2,
             started_at = COALESCE(started_at, $2), completed_at = $2
         WHERE job_id = $1 AND status = 'pending'",
    )
    .bind(job_id.0)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Fail every running step of a job, e.g. when its attempt is abandoned.
pub(crate) async fn fail_running_steps_on(
    conn: &mut PgConnection,
    job_id: JobId,
    error: &str,
) -> Result<u64> {
    let now = super::now();
    let rows = sqlx::query(
        "UPDATE steps SET status = 'failed', updated_at = $2, completed_at = $2, error = $3
         WHERE job_id = $1 AND status = 'running'",
    )
    .bind(job_id.0)
    .bind(now)
    .bind(error)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows)
}

pub(crate) async fn count_running_steps_on(conn: &mut PgConnection, job_id: JobId) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM steps WHERE job_id = $1 AND status = 'running'")
            .bind(job_id.0)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    job_id: Uuid,
    name: String,
    status: String,
    input: serde_json::Value,
    output: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl StepRow {
    fn try_into_step(self) -> Result<Step> {
        Ok(Step {
            id: StepId(self.id),
            job_id: JobId(self.job_id),
            name: self.name,
            status: self.status.parse()?,
            input: self.input,
            output: self.output,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}
