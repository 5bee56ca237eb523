//! Entity store operations against a real Postgres.
//!
//! Run with `DATABASE_URL=... cargo test --features pg-tests`.

#![cfg(feature = "pg-tests")]

use jobq::db::{Db, PageRequest};
use jobq::engine::{Orchestrator, OrchestratorConfig};
use jobq::error::Error;
use jobq::model::*;
use serde_json::json;
use sqlx::PgPool;

fn orchestrator(pool: PgPool) -> Orchestrator {
    Orchestrator::new(Db::from_pool(pool), OrchestratorConfig::default())
}

#[sqlx::test(migrations = "./migrations")]
async fn health_check_and_repeat_migrations(pool: PgPool) {
    let db = Db::from_pool(pool);
    db.health_check().await.unwrap();
    db.migrate().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_ids_are_not_found(pool: PgPool) {
    let db = Db::from_pool(pool);
    assert!(matches!(db.get_job(JobId::new()).await, Err(Error::NotFound(_))));
    assert!(matches!(db.get_run(RunId::new()).await, Err(Error::NotFound(_))));
    assert!(matches!(db.get_step(StepId::new()).await, Err(Error::NotFound(_))));
    assert!(matches!(db.get_agent(AgentId::new()).await, Err(Error::NotFound(_))));
    assert!(matches!(
        db.get_artifact(ArtifactId::new()).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(db.get_workflow("nope").await, Err(Error::NotFound(_))));
}

#[sqlx::test(migrations = "./migrations")]
async fn job_filters_narrow_the_listing(pool: PgPool) {
    let orch = orchestrator(pool);
    let a = orch.submit_job(NewJob::new("build")).await.unwrap();
    let b = orch.submit_job(NewJob::new("deploy")).await.unwrap();
    orch.cancel_job(b.id).await.unwrap();

    let builds = orch
        .db()
        .list_jobs(
            &JobFilter {
                workflow: Some("build".to_string()),
                ..JobFilter::default()
            },
            &PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(builds.items.len(), 1);
    assert_eq!(builds.items[0].id, a.id);

    let cancelled = orch
        .db()
        .list_jobs(
            &JobFilter {
                status: Some(JobStatus::Cancelled),
                ..JobFilter::default()
            },
            &PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.items.len(), 1);
    assert_eq!(cancelled.items[0].id, b.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn cursor_survives_deletion_of_its_row(pool: PgPool) {
    let orch = orchestrator(pool);
    let mut ids = Vec::new();
    for _ in 0..3 {
        let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
        orch.cancel_job(job.id).await.unwrap();
        ids.push(job.id);
    }

    let filter = JobFilter::default();
    let first = orch.db().list_jobs(&filter, &PageRequest::new(1)).await.unwrap();
    assert_eq!(first.items[0].id, ids[2]);
    orch.delete_job(ids[2]).await.unwrap();

    let rest = orch
        .db()
        .list_jobs(&filter, &PageRequest::new(10).after(first.next_cursor.unwrap()))
        .await
        .unwrap();
    assert_eq!(
        rest.items.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![ids[1], ids[0]]
    );
    assert!(rest.next_cursor.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn events_can_be_narrowed_to_a_step(pool: PgPool) {
    let orch = orchestrator(pool);
    let agent = orch.register_agent("w1", &json!({})).await.unwrap();
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    orch.lease_next(agent.id, None).await.unwrap().unwrap();

    let step = orch.start_step(job.id, "fetch", &json!({"url": "x"})).await.unwrap();
    orch.finish_step(step.id, &json!({"bytes": 3})).await.unwrap();
    orch.record_event(&NewEvent::new(job.id, "note", "hello"))
        .await
        .unwrap();

    let step_events = orch
        .db()
        .list_events(job.id, Some(step.id), &PageRequest::default())
        .await
        .unwrap();
    let types: Vec<&str> = step_events.items.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["step.succeeded", "step.started"]);

    let all = orch
        .db()
        .list_events(job.id, None, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(all.items[0].event_type, "note");
    assert_eq!(all.items.len(), 5);
}

#[sqlx::test(migrations = "./migrations")]
async fn step_transitions_are_checked(pool: PgPool) {
    let orch = orchestrator(pool);
    let agent = orch.register_agent("w1", &json!({})).await.unwrap();
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    // Not running yet.
    assert!(orch.start_step(job.id, "early", &json!({})).await.is_err());

    orch.lease_next(agent.id, None).await.unwrap().unwrap();
    let step = orch.start_step(job.id, "work", &json!({})).await.unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert!(step.started_at.is_some());

    let failed = orch.fail_step(step.id, "disk full").await.unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("disk full"));
    assert!(failed.completed_at.is_some());

    let err = orch.finish_step(step.id, &json!({})).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { kind: "step", .. }));
    assert!(orch.skip_step(step.id).await.is_err());
}

#[sqlx::test(migrations = "./migrations")]
async fn agents_register_by_unique_name(pool: PgPool) {
    let orch = orchestrator(pool);
    let first = orch.register_agent("w1", &json!({"v": 1})).await.unwrap();
    orch.db()
        .set_agent_status(first.id, AgentStatus::Offline)
        .await
        .unwrap();

    // Re-registering an offline agent reactivates the same identity.
    let again = orch.register_agent("w1", &json!({"v": 2})).await.unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, AgentStatus::Active);
    assert_eq!(again.metadata, json!({"v": 2}));

    orch.register_agent("w0", &json!({})).await.unwrap();
    let names: Vec<String> = orch
        .list_agents()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["w0", "w1"]);

    let beat = orch.db().heartbeat_agent(first.id).await.unwrap();
    assert!(beat.last_seen >= again.last_seen);
}

#[sqlx::test(migrations = "./migrations")]
async fn artifacts_filter_by_job_and_run(pool: PgPool) {
    let orch = orchestrator(pool);
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();
    let run = orch.db().latest_run(job.id).await.unwrap().unwrap();

    let artifact = orch
        .db()
        .create_artifact(&NewArtifact {
            job_id: Some(job.id),
            run_id: Some(run.id),
            artifact_type: "log".to_string(),
            name: "stdout.txt".to_string(),
            size: 42,
            path: "/var/lib/jobq/stdout.txt".to_string(),
        })
        .await
        .unwrap();
    orch.db()
        .create_artifact(&NewArtifact {
            job_id: None,
            run_id: None,
            artifact_type: "report".to_string(),
            name: "global.json".to_string(),
            size: 7,
            path: "/var/lib/jobq/global.json".to_string(),
        })
        .await
        .unwrap();

    let fetched = orch.db().get_artifact(artifact.id).await.unwrap();
    assert_eq!(fetched.name, "stdout.txt");
    assert_eq!(fetched.size, 42);

    let for_run = orch
        .db()
        .list_artifacts(None, Some(run.id), &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(for_run.items.len(), 1);
    let everything = orch
        .db()
        .list_artifacts(None, None, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(everything.items.len(), 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn workflows_upsert_by_name(pool: PgPool) {
    let db = Db::from_pool(pool);
    db.upsert_workflow("echo", "returns its input", &json!({}), "1")
        .await
        .unwrap();
    let updated = db
        .upsert_workflow("echo", "returns its input verbatim", &json!({"type": "object"}), "2")
        .await
        .unwrap();
    assert_eq!(updated.version, "2");
    assert!(updated.updated_at >= updated.created_at);

    assert_eq!(db.list_workflows().await.unwrap().len(), 1);
    db.delete_workflow("echo").await.unwrap();
    assert!(matches!(
        db.delete_workflow("echo").await,
        Err(Error::NotFound(_))
    ));
}

#[sqlx::test(migrations = "./migrations")]
async fn store_rejects_unknown_status_values(pool: PgPool) {
    let orch = orchestrator(pool.clone());
    let job = orch.submit_job(NewJob::new("echo")).await.unwrap();

    let result = sqlx::query("UPDATE jobs SET status = 'paused' WHERE id = $1")
        .bind(job.id.0)
        .execute(&pool)
        .await;
    assert!(result.is_err());
}

#[sqlx::test(migrations = "./migrations")]
async fn drain_survives_a_worker_restart(pool: PgPool) {
    let orch = orchestrator(pool);
    let agent = orch.register_agent("w1", &json!({})).await.unwrap();
    orch.drain_agent(agent.id).await.unwrap();
    orch.submit_job(NewJob::new("echo")).await.unwrap();

    let restarted = orch.register_agent("w1", &json!({"pid": 2})).await.unwrap();
    assert_eq!(restarted.id, agent.id);
    assert_eq!(restarted.status, AgentStatus::Draining);
    assert!(orch.lease_next(agent.id, None).await.unwrap().is_none());

    let resumed = orch.resume_agent(agent.id).await.unwrap();
    assert_eq!(resumed.status, AgentStatus::Active);
    assert!(orch.lease_next(agent.id, None).await.unwrap().is_some());
}
