//! Job orchestrator: binds the job/run/step lifecycle to the queue lifecycle.
//!
//! Every public operation is one database transaction. Row locks are always
//! taken in the order queue item, job, run, steps, the same order
//! [`queue::lease_on`] uses, so concurrent operations queue up instead of
//! deadlocking.

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{debug, info, instrument, warn};

use crate::db::{Db, agents, events, jobs, queue, runs, steps};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

/// Upper bound on orphans repaired per reconciliation pass.
const RECONCILE_BATCH: i64 = 100;

/// Immutable policy handed to the orchestrator at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Requeues allowed before an item is dead-lettered.
    pub max_attempts: u32,
    /// Lease length used when a worker does not ask for one.
    pub default_lease: Duration,
    pub sweep_interval: Duration,
    /// Minimum age of an orphaned job before it is re-enqueued.
    pub reconcile_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_lease: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
            reconcile_grace: Duration::from_secs(60),
        }
    }
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: Db,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(db: Db, config: OrchestratorConfig) -> Self {
        Self { db, config }
    }

    /// Read access to the store, for listings and lookups.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Submission and dispatch
    // -----------------------------------------------------------------------

    /// Persist a queued job with its first run and queue item.
    ///
    /// All three rows and the `job.created` event commit together or not at
    /// all, so a job is never left without a queue representation.
    #[instrument(skip_all, fields(workflow = %new.workflow))]
    pub async fn submit_job(&self, new: NewJob) -> Result<Job> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let job = jobs::insert_job_on(&mut tx, &new).await?;
        let run = runs::insert_run_on(&mut tx, job.id, &job.input).await?;
        queue::enqueue_on(&mut tx, job.id, &dispatch_payload(&job, &run)).await?;
        events::append_event_on(
            &mut tx,
            &NewEvent::new(job.id, "job.created", format!("job submitted to {}", job.workflow))
                .data(json!({ "run_id": run.id })),
        )
        .await?;

        tx.commit().await?;

        metrics::jobs_submitted().add(1, &[KeyValue::new("workflow", job.workflow.clone())]);
        observe("submit_job", started);
        info!(job_id = %job.id, "job submitted");
        Ok(job)
    }

    /// Lease the oldest pending item for `agent_id` and start its job.
    ///
    /// Returns `None` when the queue is empty or the agent is not active.
    /// The job moves to `running` and its active run starts in the same
    /// transaction as the lease.
    pub async fn lease_next(
        &self,
        agent_id: AgentId,
        lease: Option<Duration>,
    ) -> Result<Option<Assignment>> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        // Polling doubles as the heartbeat, also while draining.
        let agent = agents::touch_agent_on(&mut tx, agent_id).await?;
        if agent.status != AgentStatus::Active {
            tx.commit().await?;
            debug!(agent = %agent.name, status = %agent.status, "agent not active, not leasing");
            return Ok(None);
        }

        let lease = lease.unwrap_or(self.config.default_lease);
        let Some(item) = queue::lease_on(&mut tx, &agent_id.to_string(), lease).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let job = jobs::lock_job_on(&mut tx, item.job_id).await?;
        if job.status.is_terminal() {
            // Only reachable if the job was finished behind the queue's back.
            warn!(job_id = %job.id, status = %job.status, "leased item for finished job, dead-lettering");
            queue::dead_letter_on(&mut tx, item.id, &format!("job already {}", job.status))
                .await?;
            tx.commit().await?;
            return Ok(None);
        }

        let job = if job.status == JobStatus::Queued {
            set_job_status(&mut tx, &job, JobStatus::Running, None).await?
        } else {
            job
        };

        let run = match runs::latest_run_on(&mut tx, job.id).await? {
            Some(run) if run.status == RunStatus::Running => run,
            Some(run) if run.status == RunStatus::Pending => {
                runs::update_run_status_on(&mut tx, run.id, RunStatus::Running, None).await?
            }
            _ => {
                let run = runs::insert_run_on(&mut tx, job.id, &job.input).await?;
                runs::update_run_status_on(&mut tx, run.id, RunStatus::Running, None).await?
            }
        };

        events::append_event_on(
            &mut tx,
            &NewEvent::new(job.id, "job.started", format!("leased by {}", agent.name)).data(json!({
                "agent_id": agent.id,
                "run_id": run.id,
                "attempt": run.attempt,
                "queue_item_id": item.id,
            })),
        )
        .await?;

        tx.commit().await?;
        observe("lease_next", started);
        info!(job_id = %job.id, agent = %agent.name, attempt = run.attempt, "job leased");
        Ok(Some(Assignment { item, job, run }))
    }

    /// Push the deadline of a lease the agent holds.
    pub async fn extend_lease(
        &self,
        item_id: QueueItemId,
        agent_id: AgentId,
        lease: Option<Duration>,
    ) -> Result<QueueItem> {
        let lease = lease.unwrap_or(self.config.default_lease);
        self.db
            .extend_lease(item_id, &agent_id.to_string(), lease)
            .await
    }

    // -----------------------------------------------------------------------
    // Worker outcomes
    // -----------------------------------------------------------------------

    /// Mark a leased job as succeeded.
    ///
    /// Only `agent_id`, as the current lease holder, may report; a worker
    /// whose lease was reclaimed gets `NotLeased`. Pending steps become
    /// skipped; a step still running fails the call. If the job was
    /// cancelled while leased, the item is dead-lettered and the cancelled
    /// job is returned unchanged.
    #[instrument(skip(self))]
    pub async fn complete_job(&self, item_id: QueueItemId, agent_id: AgentId) -> Result<Job> {
        let started = Instant::now();
        let holder = agent_id.to_string();
        let mut tx = self.db.begin().await?;

        let item = queue::lock_item_on(&mut tx, item_id).await?;
        queue::ensure_held(&item, &holder)?;
        let job = jobs::lock_job_on(&mut tx, item.job_id).await?;

        if item.cancel_requested || job.status == JobStatus::Cancelled {
            queue::dead_letter_on(&mut tx, item.id, "job cancelled").await?;
            tx.commit().await?;
            info!(job_id = %job.id, "completion of cancelled job discarded");
            return Ok(job);
        }

        job.status.check_transition(JobStatus::Succeeded)?;
        if steps::count_running_steps_on(&mut tx, job.id).await? > 0 {
            return Err(Error::transition("step", StepStatus::Running, StepStatus::Skipped));
        }
        steps::skip_pending_steps_on(&mut tx, job.id).await?;
        queue::complete_on(&mut tx, item.id, &holder).await?;

        if let Some(run) = runs::latest_run_on(&mut tx, job.id).await? {
            run.status.check_transition(RunStatus::Succeeded)?;
            runs::update_run_status_on(&mut tx, run.id, RunStatus::Succeeded, None).await?;
        }
        let job = set_job_status(&mut tx, &job, JobStatus::Succeeded, None).await?;
        events::append_event_on(
            &mut tx,
            &NewEvent::new(job.id, "job.succeeded", "job completed"),
        )
        .await?;

        tx.commit().await?;
        observe("complete_job", started);
        info!(job_id = %job.id, "job succeeded");
        Ok(job)
    }

    /// Report a failed attempt by the lease holder `agent_id`. The item is
    /// requeued with a fresh run, or dead-lettered with the job failed once
    /// attempts are exhausted.
    #[instrument(skip(self))]
    pub async fn fail_job(
        &self,
        item_id: QueueItemId,
        agent_id: AgentId,
        error: &str,
    ) -> Result<RequeueOutcome> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let outcome = queue::requeue_or_dead_letter_on(
            &mut tx,
            item_id,
            &agent_id.to_string(),
            error,
            self.config.max_attempts,
        )
        .await?;
        let job = jobs::lock_job_on(&mut tx, outcome.item().job_id).await?;
        let job = settle_failure(&mut tx, &job, &outcome, error).await?;
        events::append_event_on(&mut tx, &failure_event(&job, &outcome, error)).await?;

        tx.commit().await?;
        observe("fail_job", started);
        match &outcome {
            RequeueOutcome::Requeued(item) => {
                warn!(job_id = %job.id, attempts = item.attempts, error, "job attempt failed, requeued");
            }
            RequeueOutcome::DeadLettered(_) => {
                warn!(job_id = %job.id, error, "job failed, dead-lettered");
            }
        }
        Ok(outcome)
    }

    /// Fail a leased job outright, skipping any remaining retries. Used when
    /// no worker could ever run it, e.g. an unknown workflow.
    #[instrument(skip(self))]
    pub async fn dead_letter_job(
        &self,
        item_id: QueueItemId,
        agent_id: AgentId,
        error: &str,
    ) -> Result<Job> {
        let mut tx = self.db.begin().await?;

        let item = queue::lock_item_on(&mut tx, item_id).await?;
        queue::ensure_held(&item, &agent_id.to_string())?;
        let outcome = RequeueOutcome::DeadLettered(queue::dead_letter_on(&mut tx, item.id, error).await?);
        let job = jobs::lock_job_on(&mut tx, item.job_id).await?;
        let job = settle_failure(&mut tx, &job, &outcome, error).await?;
        events::append_event_on(&mut tx, &failure_event(&job, &outcome, error)).await?;

        tx.commit().await?;
        warn!(job_id = %job.id, error, "job dead-lettered");
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Owner-initiated operations
    // -----------------------------------------------------------------------

    /// Re-run a failed or cancelled job with its original input.
    pub async fn retry_job(&self, job_id: JobId) -> Result<Run> {
        self.create_run(job_id, None).await
    }

    /// Start a new run of a finished job. Prior runs stay as history.
    ///
    /// Legal only when the latest run failed or was cancelled (or the job
    /// has no run at all) and no queue item is outstanding.
    #[instrument(skip(self, params))]
    pub async fn create_run(&self, job_id: JobId, params: Option<Blob>) -> Result<Run> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let live = queue::lock_live_item_on(&mut tx, job_id).await?;
        let job = jobs::lock_job_on(&mut tx, job_id).await?;
        if let Some(latest) = runs::latest_run_on(&mut tx, job.id).await?
            && !matches!(latest.status, RunStatus::Failed | RunStatus::Cancelled)
        {
            return Err(Error::transition("run", latest.status, RunStatus::Pending));
        }
        if job.status != JobStatus::Queued {
            job.status.check_transition(JobStatus::Queued)?;
        }
        // A cancelled job's lease may still be outstanding.
        if live.is_some() {
            return Err(Error::DuplicateEnqueue(job_id.to_string()));
        }

        let params = params.unwrap_or_else(|| job.input.clone());
        let run = runs::insert_run_on(&mut tx, job.id, &params).await?;
        queue::enqueue_on(&mut tx, job.id, &dispatch_payload(&job, &run)).await?;
        let job = set_job_status(&mut tx, &job, JobStatus::Queued, None).await?;
        events::append_event_on(
            &mut tx,
            &NewEvent::new(job.id, "job.retried", format!("run {} created", run.attempt))
                .data(json!({ "run_id": run.id })),
        )
        .await?;

        tx.commit().await?;
        observe("create_run", started);
        info!(job_id = %job.id, attempt = run.attempt, "job re-queued with new run");
        Ok(run)
    }

    /// Cancel a queued or running job.
    ///
    /// A pending item is dead-lettered; a leased one is flagged so its worker
    /// stops cooperatively. Cancelling a cancelled job returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let item = queue::lock_live_item_on(&mut tx, job_id).await?;
        let job = jobs::lock_job_on(&mut tx, job_id).await?;
        match job.status {
            JobStatus::Cancelled => return Ok(job),
            JobStatus::Succeeded | JobStatus::Failed => {
                return Err(Error::transition("job", job.status, JobStatus::Cancelled));
            }
            JobStatus::Queued | JobStatus::Running => {}
        }

        match item {
            Some(item) if item.state == QueueState::Pending => {
                queue::dead_letter_on(&mut tx, item.id, "job cancelled").await?;
            }
            Some(item) => {
                queue::request_cancel_on(&mut tx, item.id).await?;
            }
            None => {}
        }

        if let Some(run) = runs::latest_run_on(&mut tx, job.id).await?
            && !run.status.is_terminal()
        {
            runs::update_run_status_on(&mut tx, run.id, RunStatus::Cancelled, None).await?;
        }
        steps::skip_pending_steps_on(&mut tx, job.id).await?;
        let job = set_job_status(&mut tx, &job, JobStatus::Cancelled, None).await?;
        events::append_event_on(&mut tx, &NewEvent::new(job.id, "job.cancelled", "job cancelled"))
            .await?;

        tx.commit().await?;
        observe("cancel_job", started);
        info!(job_id = %job.id, "job cancelled");
        Ok(job)
    }

    /// Cancel a run by cancelling its job. Only the job's active run can be
    /// cancelled; an already cancelled run is returned unchanged.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run> {
        let run = self.db.get_run(run_id).await?;
        if run.status == RunStatus::Cancelled {
            return Ok(run);
        }
        let active = self.db.latest_run(run.job_id).await?;
        if run.status.is_terminal() || active.is_none_or(|a| a.id != run.id) {
            return Err(Error::transition("run", run.status, RunStatus::Cancelled));
        }
        self.cancel_job(run.job_id).await?;
        self.db.get_run(run_id).await
    }

    /// Put a job's leased item back in the queue, e.g. for a stuck worker.
    ///
    /// A pending item is already claimable, so that case is a no-op.
    #[instrument(skip(self))]
    pub async fn requeue_job(&self, job_id: JobId, reason: &str) -> Result<QueueItem> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let Some(item) = queue::lock_live_item_on(&mut tx, job_id).await? else {
            return Err(match queue::latest_item_on(&mut tx, job_id).await? {
                Some(item) => Error::transition("queue", item.state, QueueState::Pending),
                None => Error::NotFound(format!("queue item for job {job_id}")),
            });
        };
        if item.state == QueueState::Pending {
            return Ok(item);
        }
        if item.cancel_requested {
            return Err(Error::transition("job", JobStatus::Cancelled, JobStatus::Queued));
        }

        let item = queue::requeue_on(&mut tx, item.id, reason).await?;
        let outcome = RequeueOutcome::Requeued(item);
        let job = jobs::lock_job_on(&mut tx, job_id).await?;
        let job = settle_failure(&mut tx, &job, &outcome, reason).await?;
        events::append_event_on(&mut tx, &failure_event(&job, &outcome, reason)).await?;

        tx.commit().await?;
        observe("requeue_job", started);
        info!(job_id = %job_id, reason, "job requeued");
        Ok(outcome.item().clone())
    }

    /// Permanently remove a finished job and everything that belongs to it.
    pub async fn delete_job(&self, job_id: JobId) -> Result<()> {
        let mut tx = self.db.begin().await?;

        queue::lock_live_item_on(&mut tx, job_id).await?;
        let job = jobs::lock_job_on(&mut tx, job_id).await?;
        if !job.status.is_terminal() {
            return Err(Error::transition("job", job.status, "deleted"));
        }
        jobs::delete_job_on(&mut tx, job_id).await?;

        tx.commit().await?;
        info!(job_id = %job_id, "job deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step progress
    // -----------------------------------------------------------------------

    /// Record that a step of a running job has started.
    pub async fn start_step(&self, job_id: JobId, name: &str, input: &Blob) -> Result<Step> {
        let mut tx = self.db.begin().await?;

        let job = jobs::get_job_on(&mut tx, job_id).await?;
        if job.status != JobStatus::Running {
            return Err(Error::transition("job", job.status, JobStatus::Running));
        }
        let step = steps::insert_step_on(&mut tx, job_id, name, input, StepStatus::Running).await?;
        events::append_event_on(
            &mut tx,
            &NewEvent::new(job_id, "step.started", format!("step {name} started")).step(step.id),
        )
        .await?;

        tx.commit().await?;
        debug!(job_id = %job_id, step = name, "step started");
        Ok(step)
    }

    pub async fn finish_step(&self, step_id: StepId, output: &Blob) -> Result<Step> {
        self.settle_step(step_id, StepStatus::Succeeded, Some(output), None)
            .await
    }

    pub async fn fail_step(&self, step_id: StepId, error: &str) -> Result<Step> {
        self.settle_step(step_id, StepStatus::Failed, None, Some(error))
            .await
    }

    pub async fn skip_step(&self, step_id: StepId) -> Result<Step> {
        self.settle_step(step_id, StepStatus::Skipped, None, None)
            .await
    }

    async fn settle_step(
        &self,
        step_id: StepId,
        to: StepStatus,
        output: Option<&Blob>,
        error: Option<&str>,
    ) -> Result<Step> {
        let mut tx = self.db.begin().await?;

        let step = steps::get_step_on(&mut tx, step_id).await?;
        step.status.check_transition(to)?;
        let step = steps::update_step_status_on(&mut tx, step_id, to, output, error).await?;

        let mut event = NewEvent::new(
            step.job_id,
            format!("step.{to}"),
            format!("step {} {to}", step.name),
        )
        .step(step.id);
        if let Some(error) = error {
            event = event.data(json!({ "error": error }));
        }
        events::append_event_on(&mut tx, &event).await?;

        tx.commit().await?;
        debug!(job_id = %step.job_id, step = %step.name, status = %to, "step settled");
        Ok(step)
    }

    /// Append a free-form event to a job's audit trail.
    pub async fn record_event(&self, event: &NewEvent) -> Result<Event> {
        self.db.append_event(event).await
    }

    // -----------------------------------------------------------------------
    // Background repair
    // -----------------------------------------------------------------------

    /// Reclaim every lease whose deadline passed before `now` and settle
    /// the affected jobs.
    pub async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let mut tx = self.db.begin().await?;

        let outcomes =
            queue::reclaim_expired_on(&mut tx, now, self.config.max_attempts).await?;
        let mut report = SweepReport::default();
        for outcome in &outcomes {
            let job = jobs::lock_job_on(&mut tx, outcome.item().job_id).await?;
            let job = settle_failure(&mut tx, &job, outcome, queue::LEASE_EXPIRED).await?;
            events::append_event_on(&mut tx, &failure_event(&job, outcome, queue::LEASE_EXPIRED))
                .await?;
            match outcome {
                RequeueOutcome::Requeued(_) => report.requeued += 1,
                RequeueOutcome::DeadLettered(_) => report.dead_lettered += 1,
            }
        }

        tx.commit().await?;
        observe("sweep_expired_leases", started);

        let reclaimed = metrics::leases_reclaimed();
        if report.requeued > 0 {
            reclaimed.add(report.requeued as u64, &[KeyValue::new("outcome", "requeued")]);
        }
        if report.dead_lettered > 0 {
            reclaimed.add(report.dead_lettered as u64, &[KeyValue::new("outcome", "dead")]);
        }
        if !outcomes.is_empty() {
            info!(requeued = report.requeued, dead_lettered = report.dead_lettered, "expired leases reclaimed");
        }
        Ok(report)
    }

    /// Re-enqueue queued or running jobs that lost their queue item and have
    /// been idle for longer than the reconcile grace period.
    pub async fn reconcile_orphans(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let grace = TimeDelta::from_std(self.config.reconcile_grace)
            .map_err(|e| Error::Config(format!("reconcile grace out of range: {e}")))?;
        let candidates = self.db.find_orphaned_jobs(now - grace, RECONCILE_BATCH).await?;

        let mut repaired = Vec::new();
        for candidate in candidates {
            match self.repair_orphan(candidate.id).await {
                Ok(true) => repaired.push(candidate.id),
                Ok(false) | Err(Error::DuplicateEnqueue(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !repaired.is_empty() {
            metrics::orphans_repaired().add(repaired.len() as u64, &[]);
            warn!(count = repaired.len(), "orphaned jobs re-enqueued");
        }
        Ok(repaired)
    }

    /// Returns false when the job no longer needs repair.
    async fn repair_orphan(&self, job_id: JobId) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        if queue::lock_live_item_on(&mut tx, job_id).await?.is_some() {
            return Ok(false);
        }
        let job = jobs::lock_job_on(&mut tx, job_id).await?;
        if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            return Ok(false);
        }

        let run = match runs::latest_run_on(&mut tx, job.id).await? {
            Some(run) if run.status == RunStatus::Pending => run,
            Some(run) => {
                if !run.status.is_terminal() {
                    runs::update_run_status_on(&mut tx, run.id, RunStatus::Failed, Some("queue item lost"))
                        .await?;
                    steps::fail_running_steps_on(&mut tx, job.id, "queue item lost").await?;
                }
                runs::insert_run_on(&mut tx, job.id, &run.params).await?
            }
            None => runs::insert_run_on(&mut tx, job.id, &job.input).await?,
        };
        queue::enqueue_on(&mut tx, job.id, &dispatch_payload(&job, &run)).await?;
        let job = if job.status == JobStatus::Running {
            set_job_status(&mut tx, &job, JobStatus::Queued, None).await?
        } else {
            job
        };
        events::append_event_on(
            &mut tx,
            &NewEvent::new(job.id, "job.reconciled", "orphaned job re-enqueued")
                .data(json!({ "run_id": run.id })),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn register_agent(&self, name: &str, metadata: &Blob) -> Result<Agent> {
        let agent = self.db.register_agent(name, metadata).await?;
        info!(agent_id = %agent.id, name, "agent registered");
        Ok(agent)
    }

    /// Stop handing new leases to an agent. Leases it holds run to the end.
    pub async fn drain_agent(&self, id: AgentId) -> Result<Agent> {
        self.db.set_agent_status(id, AgentStatus::Draining).await
    }

    pub async fn resume_agent(&self, id: AgentId) -> Result<Agent> {
        self.db.set_agent_status(id, AgentStatus::Active).await
    }

    pub async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        self.db.get_agent(id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.db.list_agents().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Queue item payload: enough for a worker to route the job.
fn dispatch_payload(job: &Job, run: &Run) -> Blob {
    json!({ "run_id": run.id, "workflow": job.workflow })
}

/// Move a job and count the transition.
async fn set_job_status(
    conn: &mut PgConnection,
    job: &Job,
    to: JobStatus,
    error: Option<&str>,
) -> Result<Job> {
    job.status.check_transition(to)?;
    let updated = jobs::update_job_status_on(conn, job.id, to, error).await?;
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", job.status.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
    Ok(updated)
}

/// Apply a failed attempt to the job and its runs.
///
/// The abandoned run fails either way. Requeued: a fresh pending run is
/// created and the job goes back to `queued`. Dead-lettered: the job fails.
/// A job that already reached a terminal status (cancelled) is left as is.
async fn settle_failure(
    conn: &mut PgConnection,
    job: &Job,
    outcome: &RequeueOutcome,
    error: &str,
) -> Result<Job> {
    let run = runs::latest_run_on(conn, job.id).await?;
    if let Some(run) = &run
        && !run.status.is_terminal()
    {
        runs::update_run_status_on(conn, run.id, RunStatus::Failed, Some(error)).await?;
    }
    steps::fail_running_steps_on(conn, job.id, error).await?;

    if job.status.is_terminal() {
        return Ok(job.clone());
    }

    match outcome {
        RequeueOutcome::Requeued(_) => {
            let params = run.map_or_else(|| job.input.clone(), |r| r.params);
            runs::insert_run_on(conn, job.id, &params).await?;
            if job.status == JobStatus::Queued {
                return Ok(job.clone());
            }
            set_job_status(conn, job, JobStatus::Queued, Some(error)).await
        }
        RequeueOutcome::DeadLettered(_) => {
            steps::skip_pending_steps_on(conn, job.id).await?;
            set_job_status(conn, job, JobStatus::Failed, Some(error)).await
        }
    }
}

fn failure_event(job: &Job, outcome: &RequeueOutcome, error: &str) -> NewEvent {
    let (event_type, message) = match outcome {
        RequeueOutcome::Requeued(_) => ("job.requeued", "attempt failed, job requeued"),
        RequeueOutcome::DeadLettered(_) => ("job.dead_lettered", "attempts exhausted, job failed"),
    };
    NewEvent::new(job.id, event_type, message).data(json!({
        "error": error,
        "attempts": outcome.item().attempts,
        "queue_item_id": outcome.item().id,
    }))
}

fn observe(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_names_run_and_workflow() {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            workflow: "echo".to_string(),
            status: JobStatus::Queued,
            input: json!({"x": 1}),
            meta: empty_blob(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let run = Run {
            id: RunId::new(),
            job_id: job.id,
            attempt: 1,
            status: RunStatus::Pending,
            params: job.input.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let payload = dispatch_payload(&job, &run);
        assert_eq!(payload["workflow"], "echo");
        assert_eq!(payload["run_id"], json!(run.id));
    }

    #[test]
    fn default_config_allows_retries() {
        let config = OrchestratorConfig::default();
        assert!(config.max_attempts > 0);
        assert!(config.default_lease > Duration::ZERO);
    }
}
