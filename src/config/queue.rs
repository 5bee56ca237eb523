//! Queue timing and retry policy, read from the `[queue]` table of the
//! optional `JOBQ_CONFIG` file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::OrchestratorConfig;
use crate::error::{Error, Result};

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    queue: QueueSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// Requeues allowed before an item is dead-lettered.
    pub max_attempts: u32,
    /// Lease length handed out by workers.
    pub lease_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// How long a queued/running job may sit without a live queue item
    /// before reconciliation re-enqueues it.
    pub reconcile_grace_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_seconds: 300,
            sweep_interval_seconds: 15,
            reconcile_grace_seconds: 60,
        }
    }
}

impl QueueSettings {
    /// Parse a config document. A missing `[queue]` table means defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
        file.queue.validate()?;
        Ok(file.queue)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<()> {
        if self.lease_seconds == 0 {
            return Err(Error::Config("lease_seconds must be positive".to_string()));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(Error::Config(
                "sweep_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: self.max_attempts,
            default_lease: Duration::from_secs(self.lease_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            reconcile_grace: Duration::from_secs(self.reconcile_grace_seconds),
        }
    }
}
