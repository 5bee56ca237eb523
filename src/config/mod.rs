//! Typed configuration from environment variables.
//!
//! Loaded once at startup and never mutated. Missing required vars fail
//! fast. The database URL is wrapped in `SecretString` so it cannot leak
//! into logs.

pub mod queue;

pub use queue::QueueSettings;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub max_connections: u32,
    pub queue: QueueSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let max_connections = match std::env::var("JOBQ_MAX_CONNECTIONS") {
            Ok(v) => v.parse().map_err(|_| {
                Error::Config(format!("JOBQ_MAX_CONNECTIONS must be a positive integer, got {v:?}"))
            })?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            return Err(Error::Config("JOBQ_MAX_CONNECTIONS must be positive".to_string()));
        }

        let queue = match std::env::var_os("JOBQ_CONFIG") {
            Some(path) => QueueSettings::load(&PathBuf::from(path))?,
            None => QueueSettings::default(),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|s| !s.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_connections,
            queue,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
