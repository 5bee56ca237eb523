//! Workflow templates, keyed by name.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Create a workflow or replace the definition stored under its name.
    pub async fn upsert_workflow(
        &self,
        name: &str,
        description: &str,
        schema: &Blob,
        version: &str,
    ) -> Result<Workflow> {
        let now = super::now();
        let row: WorkflowRow = sqlx::query_as(
            "INSERT INTO workflows (name, description, schema, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (name) DO UPDATE
             SET description = EXCLUDED.description, schema = EXCLUDED.schema,
                 version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(name)
        .bind(description)
        .bind(schema)
        .bind(version)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row.into())
    }

    pub async fn get_workflow(&self, name: &str) -> Result<Workflow> {
        let row: Option<WorkflowRow> = sqlx::query_as("SELECT * FROM workflows WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.map(Workflow::from)
            .ok_or_else(|| Error::NotFound(format!("workflow {name}")))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as("SELECT * FROM workflows ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(Workflow::from).collect())
    }

    pub async fn delete_workflow(&self, name: &str) -> Result<()> {
        let rows = sqlx::query("DELETE FROM workflows WHERE name = $1")
            .bind(name)
            .execute(self.pool())
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::NotFound(format!("workflow {name}")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    name: String,
    description: String,
    schema: serde_json::Value,
    version: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Workflow {
            name: row.name,
            description: row.description,
            schema: row.schema,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
