//! Worker loop: register as an agent, lease jobs, run their workflow
//! handler, report the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::orchestrator::Orchestrator;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::job::{record_state_transition, start_job_span};

/// Executes jobs of one workflow.
///
/// Delivery is at-least-once: a job whose lease expired may run again on
/// another worker, so handlers must tolerate re-execution.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<()>;
}

/// Handle a running job uses to report progress.
pub struct ExecutionContext {
    orchestrator: Orchestrator,
    agent_id: AgentId,
    assignment: Assignment,
}

impl ExecutionContext {
    pub fn new(orchestrator: Orchestrator, agent_id: AgentId, assignment: Assignment) -> Self {
        Self {
            orchestrator,
            agent_id,
            assignment,
        }
    }

    pub fn job(&self) -> &Job {
        &self.assignment.job
    }

    pub fn run(&self) -> &Run {
        &self.assignment.run
    }

    pub fn item(&self) -> &QueueItem {
        &self.assignment.item
    }

    /// Parameters of the current run (the job input unless overridden).
    pub fn params(&self) -> &Blob {
        &self.assignment.run.params
    }

    pub async fn start_step(&self, name: &str, input: &Blob) -> Result<Step> {
        self.orchestrator
            .start_step(self.assignment.job.id, name, input)
            .await
    }

    pub async fn finish_step(&self, step_id: StepId, output: &Blob) -> Result<Step> {
        self.orchestrator.finish_step(step_id, output).await
    }

    pub async fn fail_step(&self, step_id: StepId, error: &str) -> Result<Step> {
        self.orchestrator.fail_step(step_id, error).await
    }

    pub async fn event(&self, event_type: &str, message: &str, data: Blob) -> Result<Event> {
        self.orchestrator
            .record_event(&NewEvent::new(self.assignment.job.id, event_type, message).data(data))
            .await
    }

    /// Keep the lease alive during long work. `None` uses the default length.
    pub async fn extend_lease(&self, lease: Option<Duration>) -> Result<QueueItem> {
        self.orchestrator
            .extend_lease(self.assignment.item.id, self.agent_id, lease)
            .await
    }

    /// Whether the job was cancelled since it was leased. A job deleted out
    /// from under the worker counts as cancelled.
    pub async fn is_cancelled(&self) -> Result<bool> {
        match self
            .orchestrator
            .db()
            .cancel_requested(self.assignment.item.id)
            .await
        {
            Ok(cancelled) => Ok(cancelled),
            Err(Error::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Records one `echo` step whose output is the run's parameters.
pub struct EchoHandler;

#[async_trait]
impl WorkflowHandler for EchoHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        if ctx.is_cancelled().await? {
            return Ok(());
        }
        let step = ctx.start_step("echo", ctx.params()).await?;
        ctx.finish_step(step.id, ctx.params()).await?;
        Ok(())
    }
}

/// Handlers indexed by workflow name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `echo` workflow.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry
    }

    pub fn register(&mut self, workflow: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        self.handlers.insert(workflow.into(), handler);
    }

    pub fn get(&self, workflow: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers.get(workflow).cloned()
    }

    /// Registered workflow names, sorted.
    pub fn workflows(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Agent name; unique per worker.
    pub name: String,
    /// Wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// Lease length to request. `None` uses the orchestrator default.
    pub lease: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: Duration::from_secs(1),
            lease: None,
        }
    }
}

/// One worker: leases a job at a time and runs it to an outcome.
#[derive(Clone)]
pub struct Worker {
    orchestrator: Orchestrator,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        orchestrator: Orchestrator,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop once the current job is reported.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Register the agent, then lease and execute until shutdown. The agent
    /// is marked offline on the way out.
    pub async fn run(&self) -> Result<()> {
        let agent = self
            .orchestrator
            .register_agent(
                &self.config.name,
                &json!({
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "workflows": self.registry.workflows(),
                }),
            )
            .await?;

        info!(agent = %agent.name, agent_id = %agent.id, "worker started");

        loop {
            let worked = match self.process_next(agent.id).await {
                Ok(worked) => worked,
                Err(e) => {
                    error!(agent = %agent.name, transient = e.is_transient(), "worker poll failed: {e}");
                    false
                }
            };

            // Drain the queue back to back; back off only when idle.
            let delay = if worked {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.orchestrator
            .db()
            .set_agent_status(agent.id, AgentStatus::Offline)
            .await?;
        info!(agent = %agent.name, "worker stopped");
        Ok(())
    }

    /// Lease and execute one job. Returns false when nothing was leased.
    pub async fn process_next(&self, agent_id: AgentId) -> Result<bool> {
        let Some(assignment) = self
            .orchestrator
            .lease_next(agent_id, self.config.lease)
            .await?
        else {
            return Ok(false);
        };

        let span = start_job_span(
            &assignment.job.workflow,
            assignment.job.id,
            assignment.run.attempt,
        );
        record_state_transition(&span, JobStatus::Queued.as_str(), JobStatus::Running.as_str());
        self.execute(agent_id, assignment, &span)
            .instrument(span.clone())
            .await;
        Ok(true)
    }

    async fn execute(&self, agent_id: AgentId, assignment: Assignment, span: &tracing::Span) {
        let item_id = assignment.item.id;
        let workflow = assignment.job.workflow.clone();

        let Some(handler) = self.registry.get(&workflow) else {
            warn!(workflow = %workflow, "no handler for workflow, dead-lettering");
            let reason = format!("no handler for workflow {workflow}");
            match self.orchestrator.dead_letter_job(item_id, agent_id, &reason).await {
                Ok(job) => record_state_transition(span, JobStatus::Running.as_str(), job.status.as_str()),
                Err(e) => error!("failed to dead-letter unroutable job: {e}"),
            }
            return;
        };

        let ctx = ExecutionContext::new(self.orchestrator.clone(), agent_id, assignment);
        let result = match handler.execute(&ctx).await {
            Ok(()) => match self.orchestrator.complete_job(item_id, agent_id).await {
                Ok(job) => Ok(job.status),
                // The handler left a step running; report it as a failure.
                Err(e @ Error::InvalidTransition { .. }) => Err(e.to_string()),
                Err(e @ Error::NotLeased(_)) => {
                    warn!("lease lost before completion was reported: {e}");
                    return;
                }
                Err(e) => {
                    error!("failed to report completion: {e}");
                    return;
                }
            },
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(status) => {
                record_state_transition(span, JobStatus::Running.as_str(), status.as_str());
            }
            Err(message) => match self.orchestrator.fail_job(item_id, agent_id, &message).await {
                Ok(RequeueOutcome::Requeued(_)) => {
                    record_state_transition(span, JobStatus::Running.as_str(), JobStatus::Queued.as_str());
                }
                Ok(RequeueOutcome::DeadLettered(_)) => {
                    record_state_transition(span, JobStatus::Running.as_str(), JobStatus::Failed.as_str());
                }
                Err(e) => error!("failed to report failure: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl WorkflowHandler for Noop {
        async fn execute(&self, _ctx: &ExecutionContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn builtin_registry_has_echo() {
        let registry = HandlerRegistry::with_builtin();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registered_workflows_are_sorted() {
        let mut registry = HandlerRegistry::with_builtin();
        registry.register("build", Arc::new(Noop));
        assert_eq!(registry.workflows(), vec!["build", "echo"]);
    }

    #[test]
    fn worker_config_defaults_to_orchestrator_lease() {
        let config = WorkerConfig::new("w1");
        assert!(config.lease.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}
