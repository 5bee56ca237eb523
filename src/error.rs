//! Error types for jobq.
//!
//! Every kind except [`Error::StorageUnavailable`] is terminal: callers
//! surface it as-is. Storage outages are retried at the boundary with
//! backoff, never inside the core.

use thiserror::Error;

/// Name of the partial unique index that enforces one live queue item per job.
pub(crate) const LIVE_JOB_INDEX: &str = "idx_queue_live_job";

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid {kind} status: {value:?}")]
    InvalidStatus { kind: &'static str, value: String },

    #[error("invalid {kind} transition: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    #[error("job {0} already has an outstanding queue item")]
    DuplicateEnqueue(String),

    #[error("queue item {0} is not leased")]
    NotLeased(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the operation after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }

    pub(crate) fn transition(
        kind: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => Error::StorageUnavailable(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                match code.as_deref() {
                    Some(code) if is_unavailable_sqlstate(code) => {
                        Error::StorageUnavailable(err.to_string())
                    }
                    // unique_violation on the live-item index
                    Some("23505") if db_err.constraint() == Some(LIVE_JOB_INDEX) => {
                        Error::DuplicateEnqueue(db_err.message().to_string())
                    }
                    _ => Error::Storage(err),
                }
            }
            _ => Error::Storage(err),
        }
    }
}

/// SQLSTATEs the server reports when it cannot serve the connection right
/// now: class 08 (connection exception) and the 57P0x shutdown codes.
fn is_unavailable_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Other(format!("migration failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
