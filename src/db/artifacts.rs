//! Artifact metadata. Rows are immutable once written.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::cursor::{Cursor, Page, PageRequest};
use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Record an artifact produced by a job or run.
    pub async fn create_artifact(&self, new: &NewArtifact) -> Result<Artifact> {
        let row: ArtifactRow = sqlx::query_as(
            "INSERT INTO artifacts (id, job_id, run_id, type, name, size, path, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.job_id.map(|id| id.0))
        .bind(new.run_id.map(|id| id.0))
        .bind(&new.artifact_type)
        .bind(&new.name)
        .bind(new.size)
        .bind(&new.path)
        .bind(super::now())
        .fetch_one(self.pool())
        .await?;
        Ok(row.into())
    }

    pub async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact> {
        let row: Option<ArtifactRow> = sqlx::query_as("SELECT * FROM artifacts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(Artifact::from)
            .ok_or_else(|| Error::NotFound(format!("artifact {id}")))
    }

    /// List artifacts newest first, optionally by job and/or run.
    pub async fn list_artifacts(
        &self,
        job_id: Option<JobId>,
        run_id: Option<RunId>,
        page: &PageRequest,
    ) -> Result<Page<Artifact>> {
        let after = page.decode_cursor()?;
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT * FROM artifacts
             WHERE ($1::uuid IS NULL OR job_id = $1)
             AND ($2::uuid IS NULL OR run_id = $2)
             AND ($3::timestamptz IS NULL OR (created_at, id) < ($3::timestamptz, $4::uuid))
             ORDER BY created_at DESC, id DESC
             LIMIT $5",
        )
        .bind(job_id.map(|id| id.0))
        .bind(run_id.map(|id| id.0))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(page.fetch_limit())
        .fetch_all(self.pool())
        .await?;

        let artifacts: Vec<Artifact> = rows.into_iter().map(Artifact::from).collect();
        Ok(Page::from_rows(artifacts, page, |a| Cursor::new(a.created_at, a.id.0)))
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    job_id: Option<Uuid>,
    run_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    artifact_type: String,
    name: String,
    size: i64,
    path: String,
    created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            id: ArtifactId(row.id),
            job_id: row.job_id.map(JobId),
            run_id: row.run_id.map(RunId),
            artifact_type: row.artifact_type,
            name: row.name,
            size: row.size,
            path: row.path,
            created_at: row.created_at,
        }
    }
}
