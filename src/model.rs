//! Core data model.
//!
//! A job is a unit of work submitted by a client. It executes as one or more
//! runs, each made of ordered steps, and is dispatched to workers through a
//! queue item. Every record carries a store-assigned UUID.

pub mod job;
pub mod queue;
pub mod record;
pub mod status;

pub use job::*;
pub use queue::*;
pub use record::*;
pub use status::*;

use uuid::Uuid;

/// Untyped workflow-defined payload (`input`, `meta`, `params`, `schema`, `data`).
pub type Blob = serde_json::Value;

/// Empty JSON object, the default for every blob column.
pub fn empty_blob() -> Blob {
    serde_json::Value::Object(serde_json::Map::new())
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::Error;

            /// A string that is not a UUID cannot name a stored record.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| crate::error::Error::NotFound(format!("{} {s}", $label)))
            }
        }
    };
}

id_type!(
    /// Identifier of a [`Job`].
    JobId,
    "job"
);
id_type!(
    /// Identifier of a [`Run`].
    RunId,
    "run"
);
id_type!(StepId, "step");
id_type!(QueueItemId, "queue item");
id_type!(AgentId, "agent");
id_type!(EventId, "event");
id_type!(ArtifactId, "artifact");
