//! Agent registry: worker identities and their drain flags.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    /// Register a worker by name. Re-registering an existing name brings an
    /// offline agent back to `active`; a `draining` agent stays draining
    /// until it is resumed.
    pub async fn register_agent(&self, name: &str, metadata: &Blob) -> Result<Agent> {
        let now = super::now();
        let row: AgentRow = sqlx::query_as(
            "INSERT INTO agents (id, name, status, metadata, last_seen, created_at, updated_at)
             VALUES ($1, $2, 'active', $3, $4, $4, $4)
             ON CONFLICT (name) DO UPDATE
             SET status = CASE WHEN agents.status = 'draining' THEN 'draining' ELSE 'active' END,
                 metadata = EXCLUDED.metadata,
                 last_seen = EXCLUDED.last_seen, updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(metadata)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        row.try_into_agent()
    }

    pub async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        let mut conn = self.pool().acquire().await?;
        get_agent_on(&mut conn, id).await
    }

    /// All agents ordered by name.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(AgentRow::try_into_agent).collect()
    }

    /// Record that the agent is alive.
    pub async fn heartbeat_agent(&self, id: AgentId) -> Result<Agent> {
        let mut conn = self.pool().acquire().await?;
        touch_agent_on(&mut conn, id).await
    }

    pub async fn set_agent_status(&self, id: AgentId, status: AgentStatus) -> Result<Agent> {
        let row: Option<AgentRow> = sqlx::query_as(
            "UPDATE agents SET status = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(super::now())
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("agent {id}")))?
            .try_into_agent()
    }
}

pub(crate) async fn get_agent_on(conn: &mut PgConnection, id: AgentId) -> Result<Agent> {
    let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("agent {id}")))?
        .try_into_agent()
}

pub(crate) async fn touch_agent_on(conn: &mut PgConnection, id: AgentId) -> Result<Agent> {
    let row: Option<AgentRow> = sqlx::query_as(
        "UPDATE agents SET last_seen = $2, updated_at = $2 WHERE id = $1 RETURNING *",
    )
    .bind(id.0)
    .bind(super::now())
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("agent {id}")))?
        .try_into_agent()
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    name: String,
    status: String,
    metadata: serde_json::Value,
    last_seen: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AgentRow {
    fn try_into_agent(self) -> Result<Agent> {
        Ok(Agent {
            id: AgentId(self.id),
            name: self.name,
            status: self.status.parse()?,
            metadata: self.metadata,
            last_seen: self.last_seen,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
