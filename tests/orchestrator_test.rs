//! Job lifecycle through the orchestrator and worker, against a real Postgres.
//!
//! Run with `DATABASE_URL=... cargo test --features pg-tests`.

#![cfg(feature = "pg-tests")]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use jobq::db::{Db, PageRequest};
use jobq::engine::{
    ExecutionContext, HandlerRegistry, Orchestrator, OrchestratorConfig, Sweeper, Worker,
    WorkerConfig, WorkflowHandler,
};
use jobq::error::{Error, Result};
use jobq::model::*;
use serde_json::json;
use sqlx::PgPool;

fn orchestrator(pool: PgPool, max_attempts: u32) -> Orchestrator {
    Orchestrator::new(
        Db::from_pool(pool),
        OrchestratorConfig {
            max_attempts,
            ..OrchestratorConfig::default()
        },
    )
}

async fn agent(orch: &Orchestrator, name: &str) -> Agent {
    orch.register_agent(name, &json!({})).await.unwrap()
}

fn worker(orch: &Orchestrator, registry: HandlerRegistry, name: &str) -> Worker {
    Worker::new(orch.clone(), Arc::new(registry), WorkerConfig::new(name))
}

/// Fails every attempt.
struct Failing;

#[async_trait::async_trait]
impl WorkflowHandler for Failing {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<()> {
        Err(Error::Other("handler exploded".to_string()))
    }
}

/// Starts a step and never finishes it.
struct Sloppy;

#[async_trait::async_trait]
impl WorkflowHandler for Sloppy {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        ctx.start_step("forgotten", &json!({})).await?;
        Ok(())
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn submit_creates_queued_job_with_one_pending_item(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let job = orch
        .submit_job(NewJob::new("echo").input(json!({"x": 1})))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.input, json!({"x": 1}));
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_none());

    let items = orch
        .db()
        .list_queue_items(None, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(items.items.len(), 1);
    assert_eq!(items.items[0].job_id, job.id);
    assert_eq!(items.items[0].state, QueueState::Pending);
    assert_eq!(items.items[0].data["workflow"], "echo");

    let run = orch.db().latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.attempt, 1);
    assert_eq!(run.params, json!({"x": 1}));

    let events = orch
        .db()
        .list_events(job.id, None, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(events.items.len(), 1);
    assert_eq!(events.items[0].event_type, "job.created");
}

#[sqlx::test(migrations = "./migrations")]
async fn job_pages_concatenate_to_the_full_list(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let mut submitted = Vec::new();
    for n in 0..5 {
        let job = orch
            .submit_job(NewJob::new("echo").input(json!({ "n": n })))
            .await
            .unwrap();
        submitted.push(job.id);
    }
    submitted.reverse(); // newest first

    let filter = JobFilter::default();
    let first = orch.db().list_jobs(&filter, &PageRequest::new(2)).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let second = orch
        .db()
        .list_jobs(&filter, &PageRequest::new(2).after(first.next_cursor.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);
    let third = orch
        .db()
        .list_jobs(&filter, &PageRequest::new(2).after(second.next_cursor.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(third.items.len(), 1);
    assert!(third.next_cursor.is_none());

    let all: Vec<JobId> = [first.items, second.items, third.items]
        .into_iter()
        .flatten()
        .map(|j| j.id)
        .collect();
    assert_eq!(all, submitted);
}

#[sqlx::test(migrations = "./migrations")]
async fn echo_job_runs_to_success(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch
        .submit_job(NewJob::new("echo").input(json!({"x": 1})))
        .await
        .unwrap();

    let w = worker(&orch, HandlerRegistry::with_builtin(), "w1");
    assert!(w.process_next(agent.id).await.unwrap());
    assert!(!w.process_next(agent.id).await.unwrap());

    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    let steps = orch.db().list_steps(job.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "echo");
    assert_eq!(steps[0].status, StepStatus::Succeeded);
    assert_eq!(steps[0].output, json!({"x": 1}));

    let run = orch.db().latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let stats = orch.db().queue_stats().await.unwrap();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.total, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancelling_a_pending_job_dead_letters_its_item(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    let cancelled = orch.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let items = orch
        .db()
        .list_queue_items(None, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(items.items[0].state, QueueState::Dead);
    assert!(orch.db().live_queue_item(job.id).await.unwrap().is_none());

    let run = orch.db().latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    // Second cancel is a no-op returning the same terminal state.
    let again = orch.cancel_job(job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert_eq!(again.completed_at, cancelled.completed_at);
}

#[sqlx::test(migrations = "./migrations")]
async fn cancelling_a_finished_job_is_rejected(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    worker(&orch, HandlerRegistry::with_builtin(), "w1")
        .process_next(agent.id)
        .await
        .unwrap();

    let err = orch.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { kind: "job", .. }));
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_while_leased_is_cooperative(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    let assignment = orch.lease_next(agent.id, None).await.unwrap().unwrap();
    assert_eq!(assignment.job.status, JobStatus::Running);
    assert_eq!(assignment.run.status, RunStatus::Running);

    orch.cancel_job(job.id).await.unwrap();
    assert!(orch.db().cancel_requested(assignment.item.id).await.unwrap());

    // The worker finishes anyway; its completion is discarded.
    let job = orch.complete_job(assignment.item.id, agent.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let item = orch.db().get_queue_item(assignment.item.id).await.unwrap();
    assert_eq!(item.state, QueueState::Dead);
}

#[sqlx::test(migrations = "./migrations")]
async fn failures_requeue_then_dead_letter(pool: PgPool) {
    let orch = orchestrator(pool, 1);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("flaky")).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("flaky", Arc::new(Failing));
    let w = worker(&orch, registry, "w1");

    assert!(w.process_next(agent.id).await.unwrap());
    let after_first = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(after_first.status, JobStatus::Queued);
    let runs = orch.db().list_runs(Some(job.id), &PageRequest::default()).await.unwrap();
    assert_eq!(runs.items.len(), 2);
    assert_eq!(runs.items[0].status, RunStatus::Pending);
    assert_eq!(runs.items[1].status, RunStatus::Failed);
    assert_eq!(runs.items[1].error.as_deref(), Some("handler exploded"));

    assert!(w.process_next(agent.id).await.unwrap());
    let failed = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("handler exploded"));
    assert!(failed.completed_at.is_some());

    let stats = orch.db().queue_stats().await.unwrap();
    assert_eq!(stats.dead, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn retry_adds_a_run_and_requeues(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    // Not retryable while the first run is still pending.
    assert!(orch.retry_job(job.id).await.is_err());

    orch.cancel_job(job.id).await.unwrap();
    let run = orch.retry_job(job.id).await.unwrap();
    assert_eq!(run.attempt, 2);
    assert_eq!(run.status, RunStatus::Pending);

    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.completed_at.is_none());
    assert!(job.error.is_none());

    let item = orch.db().live_queue_item(job.id).await.unwrap().unwrap();
    assert_eq!(item.state, QueueState::Pending);
    assert_eq!(item.data["run_id"], json!(run.id));

    // History is untouched.
    let runs = orch.db().list_runs(Some(job.id), &PageRequest::default()).await.unwrap();
    assert_eq!(runs.items[1].status, RunStatus::Cancelled);
}

#[sqlx::test(migrations = "./migrations")]
async fn sweep_requeues_expired_leases(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    let assignment = orch
        .lease_next(agent.id, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();

    let report = orch
        .sweep_expired_leases(Utc::now() + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.dead_lettered, 0);

    let item = orch.db().get_queue_item(assignment.item.id).await.unwrap();
    assert_eq!(item.state, QueueState::Pending);
    assert_eq!(item.attempts, 1);

    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());

    // The stale worker cannot complete any more.
    assert!(matches!(
        orch.complete_job(assignment.item.id, agent.id).await,
        Err(Error::NotLeased(_))
    ));
}

#[sqlx::test(migrations = "./migrations")]
async fn sweeper_tick_runs_without_a_loop(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let report = Sweeper::new(orch).tick().await.unwrap();
    assert_eq!(report.requeued + report.dead_lettered, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn sweeper_stops_on_shutdown(pool: PgPool) {
    let sweeper = Sweeper::new(orchestrator(pool, 3));
    sweeper.shutdown();
    tokio::time::timeout(Duration::from_secs(5), sweeper.run())
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn orphaned_jobs_are_re_enqueued(pool: PgPool) {
    let orch = orchestrator(pool.clone(), 3);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    // Lose the queue item behind the orchestrator's back.
    sqlx::query("DELETE FROM queue_items WHERE job_id = $1")
        .bind(job.id.0)
        .execute(&pool)
        .await
        .unwrap();

    // Within the grace period nothing happens.
    assert!(orch.reconcile_orphans(Utc::now()).await.unwrap().is_empty());

    let repaired = orch
        .reconcile_orphans(Utc::now() + TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(repaired, vec![job.id]);

    let item = orch.db().live_queue_item(job.id).await.unwrap().unwrap();
    assert_eq!(item.state, QueueState::Pending);
    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}

#[sqlx::test(migrations = "./migrations")]
async fn drained_agents_get_no_work(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    orch.submit_job(NewJob::new("echo")).await.unwrap();

    let drained = orch.drain_agent(agent.id).await.unwrap();
    assert_eq!(drained.status, AgentStatus::Draining);
    assert!(orch.lease_next(agent.id, None).await.unwrap().is_none());

    orch.resume_agent(agent.id).await.unwrap();
    assert!(orch.lease_next(agent.id, None).await.unwrap().is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_workflow_is_dead_lettered(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("nobody-runs-this")).await.unwrap();

    worker(&orch, HandlerRegistry::with_builtin(), "w1")
        .process_next(agent.id)
        .await
        .unwrap();

    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("nobody-runs-this"));
    assert_eq!(orch.db().queue_stats().await.unwrap().dead, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn job_cannot_succeed_with_a_running_step(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("sloppy")).await.unwrap();
    let assignment = orch.lease_next(agent.id, None).await.unwrap().unwrap();

    orch.start_step(job.id, "forgotten", &json!({})).await.unwrap();
    let err = orch.complete_job(assignment.item.id, agent.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { kind: "step", .. }));

    // Rolled back: still leased and running.
    let item = orch.db().get_queue_item(assignment.item.id).await.unwrap();
    assert_eq!(item.state, QueueState::Leased);
    assert_eq!(
        orch.db().get_job(job.id).await.unwrap().status,
        JobStatus::Running
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn worker_reports_unfinished_steps_as_failure(pool: PgPool) {
    let orch = orchestrator(pool, 0);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("sloppy")).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register("sloppy", Arc::new(Sloppy));
    worker(&orch, registry, "w1")
        .process_next(agent.id)
        .await
        .unwrap();

    let job = orch.db().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let steps = orch.db().list_steps(job.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[sqlx::test(migrations = "./migrations")]
async fn requeue_job_returns_leased_work_to_the_queue(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    // Pending: nothing to do.
    let item = orch.requeue_job(job.id, "operator").await.unwrap();
    assert_eq!(item.state, QueueState::Pending);
    assert_eq!(item.attempts, 0);

    orch.lease_next(agent.id, None).await.unwrap().unwrap();
    let item = orch.requeue_job(job.id, "operator").await.unwrap();
    assert_eq!(item.state, QueueState::Pending);
    assert_eq!(item.attempts, 1);
    assert_eq!(
        orch.db().get_job(job.id).await.unwrap().status,
        JobStatus::Queued
    );

    orch.cancel_job(job.id).await.unwrap();
    let err = orch.requeue_job(job.id, "operator").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { kind: "queue", .. }));
}

#[sqlx::test(migrations = "./migrations")]
async fn delete_purges_only_finished_jobs(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    assert!(matches!(
        orch.delete_job(job.id).await,
        Err(Error::InvalidTransition { .. })
    ));

    orch.cancel_job(job.id).await.unwrap();
    orch.delete_job(job.id).await.unwrap();

    assert!(matches!(orch.db().get_job(job.id).await, Err(Error::NotFound(_))));
    assert_eq!(orch.db().queue_stats().await.unwrap().total, 0);
    let runs = orch.db().list_runs(Some(job.id), &PageRequest::default()).await.unwrap();
    assert!(runs.items.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn cancel_run_cancels_only_the_active_run(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    let first = orch.db().latest_run(job.id).await.unwrap().unwrap();

    let cancelled = orch.cancel_run(first.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(
        orch.db().get_job(job.id).await.unwrap().status,
        JobStatus::Cancelled
    );
    // Idempotent.
    assert_eq!(
        orch.cancel_run(first.id).await.unwrap().status,
        RunStatus::Cancelled
    );

    assert!(matches!(
        orch.cancel_run(RunId::new()).await,
        Err(Error::NotFound(_))
    ));
}

#[sqlx::test(migrations = "./migrations")]
async fn reclaimed_worker_cannot_report_for_the_new_holder(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let a = agent(&orch, "a").await;
    let b = agent(&orch, "b").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    let first = orch
        .lease_next(a.id, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    let report = orch
        .sweep_expired_leases(Utc::now() + TimeDelta::seconds(5))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);

    let second = orch.lease_next(b.id, None).await.unwrap().unwrap();
    assert_eq!(second.item.id, first.item.id);

    // The worker that lost its lease reports late, both ways.
    assert!(matches!(
        orch.complete_job(first.item.id, a.id).await,
        Err(Error::NotLeased(_))
    ));
    assert!(matches!(
        orch.fail_job(first.item.id, a.id, "timed out").await,
        Err(Error::NotLeased(_))
    ));
    assert!(matches!(
        orch.dead_letter_job(first.item.id, a.id, "gave up").await,
        Err(Error::NotLeased(_))
    ));

    // The new holder's lease, run and attempt count are untouched.
    let item = orch.db().get_queue_item(first.item.id).await.unwrap();
    assert_eq!(item.state, QueueState::Leased);
    assert_eq!(item.leased_by, Some(b.id.to_string()));
    assert_eq!(item.attempts, 1);
    let run = orch.db().get_run(second.run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.error.is_none());

    let done = orch.complete_job(second.item.id, b.id).await.unwrap();
    assert_eq!(done.id, job.id);
    assert_eq!(done.status, JobStatus::Succeeded);
}

#[sqlx::test(migrations = "./migrations")]
async fn retry_waits_for_an_outstanding_lease(pool: PgPool) {
    let orch = orchestrator(pool, 3);
    let agent = agent(&orch, "w1").await;
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    let assignment = orch.lease_next(agent.id, None).await.unwrap().unwrap();

    // Cancelled, but the worker still holds the item.
    orch.cancel_job(job.id).await.unwrap();
    let err = orch.retry_job(job.id).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateEnqueue(ref id) if *id == job.id.to_string()));

    // Once the worker reports, the item is gone and retry succeeds.
    orch.complete_job(assignment.item.id, agent.id).await.unwrap();
    let run = orch.retry_job(job.id).await.unwrap();
    assert_eq!(run.attempt, 2);
}
