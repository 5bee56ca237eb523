//! Span helpers for job execution.

use tracing::Span;

use crate::model::JobId;

/// Span covering one leased execution of a job.
///
/// `job.status` starts empty and is filled in by [`record_state_transition`].
pub fn start_job_span(workflow: &str, job_id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.workflow" = workflow,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "job.status" = tracing::field::Empty,
    )
}

/// Emit a transition event inside `span` and remember the new status on it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
