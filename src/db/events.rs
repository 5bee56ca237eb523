//! Append-only audit events.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::cursor::{Cursor, Page, PageRequest};
use crate::error::Result;
use crate::model::*;

impl super::Db {
    /// Append an event outside any larger transaction.
    pub async fn append_event(&self, new: &NewEvent) -> Result<Event> {
        let mut conn = self.pool().acquire().await?;
        append_event_on(&mut conn, new).await
    }

    /// A job's events newest first, optionally narrowed to one step.
    pub async fn list_events(
        &self,
        job_id: JobId,
        step_id: Option<StepId>,
        page: &PageRequest,
    ) -> Result<Page<Event>> {
        let after = page.decode_cursor()?;
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM events
             WHERE job_id = $1
             AND ($2::uuid IS NULL OR step_id = $2)
             AND ($3::timestamptz IS NULL OR (created_at, id) < ($3::timestamptz, $4::uuid))
             ORDER BY created_at DESC, id DESC
             LIMIT $5",
        )
        .bind(job_id.0)
        .bind(step_id.map(|id| id.0))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(page.fetch_limit())
        .fetch_all(self.pool())
        .await?;

        let events: Vec<Event> = rows.into_iter().map(Event::from).collect();
        Ok(Page::from_rows(events, page, |e| Cursor::new(e.created_at, e.id.0)))
    }
}

pub(crate) async fn append_event_on(conn: &mut PgConnection, new: &NewEvent) -> Result<Event> {
    let row: EventRow = sqlx::query_as(
        "INSERT INTO events (id, job_id, step_id, type, message, data, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.job_id.0)
    .bind(new.step_id.map(|id| id.0))
    .bind(&new.event_type)
    .bind(&new.message)
    .bind(&new.data)
    .bind(super::now())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    job_id: Uuid,
    step_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    event_type: String,
    message: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: EventId(row.id),
            job_id: JobId(row.job_id),
            step_id: row.step_id.map(StepId),
            event_type: row.event_type,
            message: row.message,
            data: row.data,
            created_at: row.created_at,
        }
    }
}
