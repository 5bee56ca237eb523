//! Metric instruments for jobq.
//!
//! Built on the global `MeterProvider`. Until [`super::init_telemetry`]
//! installs an exporting provider, every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs accepted by `submit_job`.
/// Labels: `workflow`.
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job status changes made by the orchestrator.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.state_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: queue operations that changed a row.
/// Labels: `operation` ("enqueue" | "lease" | "complete" | "requeue" | ...).
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: expired leases taken back by the sweep.
/// Labels: `outcome` ("requeued" | "dead").
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("jobq.queue.leases_reclaimed")
        .with_description("Expired leases reclaimed by the sweep")
        .build()
}

/// Counter: orphaned jobs re-enqueued by reconciliation.
pub fn orphans_repaired() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.orphans_repaired")
        .with_description("Jobs re-enqueued after losing their queue item")
        .build()
}

/// Histogram: orchestrator operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
