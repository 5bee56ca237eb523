//! # jobq
//!
//! Postgres-backed job orchestration. Clients submit jobs; workers lease
//! them from a durable queue, run them as ordered steps across one or more
//! runs, and report the outcome.
//!
//! Correctness lives in the store: leases are single conditional updates,
//! one live queue item per job is a unique index, and every orchestrator
//! operation is one transaction. Expired leases are reclaimed by a sweep,
//! so delivery is at-least-once.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;
