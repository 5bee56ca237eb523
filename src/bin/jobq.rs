//! jobq CLI: operator interface and worker daemon.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobq::config::Config;
use jobq::db::{Db, PageRequest};
use jobq::engine::{HandlerRegistry, Orchestrator, Sweeper, Worker, WorkerConfig};
use jobq::model::{
    AgentId, Blob, JobFilter, JobId, JobStatus, NewJob, QueueState, RunId, empty_blob,
};
use jobq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobq", about = "Job orchestration over a Postgres work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers and the lease sweeper
    Serve {
        /// Number of worker loops in this process
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Agent name prefix; workers are named <prefix>-<n>
        #[arg(long, default_value = "worker")]
        name: String,
        /// Do not run the sweeper in this process
        #[arg(long)]
        no_sweeper: bool,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Agent operations
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Workflow templates
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        workflow: String,
        /// JSON input
        #[arg(long)]
        input: Option<String>,
        /// JSON metadata
        #[arg(long)]
        meta: Option<String>,
    },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show a job with its runs and queue item
    Show { id: JobId },
    /// Cancel a queued or running job
    Cancel { id: JobId },
    /// Re-run a failed or cancelled job
    Retry { id: JobId },
    /// Delete a finished job and everything it owns
    Delete { id: JobId },
    /// List a job's steps
    Steps { id: JobId },
    /// List a job's events, newest first
    Events {
        id: JobId,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// List runs, newest first
    List {
        #[arg(long)]
        job: Option<JobId>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Cancel a job's active run
    Cancel { id: RunId },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Counts per state
    Stats,
    /// List items, oldest first
    List {
        #[arg(long)]
        state: Option<QueueState>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Return a job's leased item to the queue
    Requeue {
        job: JobId,
        #[arg(long, default_value = "requeued by operator")]
        reason: String,
    },
    /// Run one lease sweep and orphan reconciliation pass
    Sweep,
}

#[derive(Subcommand)]
enum AgentAction {
    List,
    Show { id: AgentId },
    /// Stop handing new leases to an agent
    Drain { id: AgentId },
    Resume { id: AgentId },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Create or replace a workflow
    Put {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "1")]
        version: String,
        /// JSON schema for job input
        #[arg(long)]
        schema: Option<String>,
    },
    List,
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            workers,
            name,
            no_sweeper,
        } => cmd_serve(config, workers, name, no_sweeper).await,
        Command::Migrate => {
            connect(&config).await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Job { action } => cmd_job(&connect(&config).await?, action).await,
        Command::Run { action } => cmd_run(&connect(&config).await?, action).await,
        Command::Queue { action } => cmd_queue(&connect(&config).await?, action).await,
        Command::Agent { action } => cmd_agent(&connect(&config).await?, action).await,
        Command::Workflow { action } => cmd_workflow(&connect(&config).await?, action).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<Orchestrator> {
    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    db.migrate().await?;
    Ok(Orchestrator::new(db, config.queue.orchestrator()))
}

async fn cmd_serve(
    config: Config,
    workers: usize,
    name: String,
    no_sweeper: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobq".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let orchestrator = connect(&config).await?;
    let registry = Arc::new(HandlerRegistry::with_builtin());

    let workers: Vec<Worker> = (1..=workers)
        .map(|n| {
            Worker::new(
                orchestrator.clone(),
                Arc::clone(&registry),
                WorkerConfig::new(format!("{name}-{n}")),
            )
        })
        .collect();
    let sweeper = (!no_sweeper).then(|| Sweeper::new(orchestrator.clone()));

    let mut tasks = tokio::task::JoinSet::new();
    for worker in &workers {
        let worker = worker.clone();
        tasks.spawn(async move { worker.run().await });
    }
    if let Some(sweeper) = &sweeper {
        let sweeper = sweeper.clone();
        tasks.spawn(async move { sweeper.run().await });
    }

    info!(workers = workers.len(), sweeper = sweeper.is_some(), "jobq serving");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    for worker in &workers {
        worker.shutdown();
    }
    if let Some(sweeper) = &sweeper {
        sweeper.shutdown();
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}

async fn cmd_job(orch: &Orchestrator, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Submit {
            workflow,
            input,
            meta,
        } => {
            let job = orch
                .submit_job(
                    NewJob::new(workflow)
                        .input(parse_blob(input)?)
                        .meta(parse_blob(meta)?),
                )
                .await?;
            println!("Submitted: {} (status: {})", job.id, job.status);
        }
        JobAction::List {
            status,
            workflow,
            limit,
            cursor,
        } => {
            let page = orch
                .db()
                .list_jobs(&JobFilter { status, workflow }, &page(limit, cursor))
                .await?;
            if page.items.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<36}  {:<16}  {:<10}  CREATED", "ID", "WORKFLOW", "STATUS");
            println!("{}", "-".repeat(84));
            for job in &page.items {
                println!(
                    "{:<36}  {:<16}  {:<10}  {}",
                    job.id,
                    job.workflow,
                    job.status,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            print_next(page.next_cursor.as_deref());
        }
        JobAction::Show { id } => {
            let job = orch.db().get_job(id).await?;
            println!("ID:         {}", job.id);
            println!("Workflow:   {}", job.workflow);
            println!("Status:     {}", job.status);
            println!("Input:      {}", serde_json::to_string_pretty(&job.input)?);
            println!("Meta:       {}", serde_json::to_string_pretty(&job.meta)?);
            println!("Created:    {}", job.created_at);
            println!("Updated:    {}", job.updated_at);
            if let Some(started) = job.started_at {
                println!("Started:    {started}");
            }
            if let Some(completed) = job.completed_at {
                println!("Completed:  {completed}");
            }
            if let Some(ref error) = job.error {
                println!("Error:      {error}");
            }
            if let Some(item) = orch.db().live_queue_item(id).await? {
                println!("---");
                println!("Queue item: {} ({}, attempts {})", item.id, item.state, item.attempts);
            }
            let runs = orch.db().list_runs(Some(id), &PageRequest::new(10)).await?;
            if !runs.items.is_empty() {
                println!("---");
                for run in &runs.items {
                    println!(
                        "Run {:<3} {}  {:<10}  {}",
                        run.attempt,
                        run.id,
                        run.status,
                        run.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        JobAction::Cancel { id } => {
            let job = orch.cancel_job(id).await?;
            println!("Job {} is {}", job.id, job.status);
        }
        JobAction::Retry { id } => {
            let run = orch.retry_job(id).await?;
            println!("Job {id} queued as run {} ({})", run.attempt, run.id);
        }
        JobAction::Delete { id } => {
            orch.delete_job(id).await?;
            println!("Deleted job {id}");
        }
        JobAction::Steps { id } => {
            let steps = orch.db().list_steps(id).await?;
            if steps.is_empty() {
                println!("No steps recorded.");
            }
            for step in &steps {
                println!(
                    "{}  {:<20}  {:<10}  {}",
                    step.id,
                    step.name,
                    step.status,
                    step.error.as_deref().unwrap_or("")
                );
            }
        }
        JobAction::Events { id, limit, cursor } => {
            let page = orch.db().list_events(id, None, &page(limit, cursor)).await?;
            for event in &page.items {
                println!(
                    "{}  {:<20}  {}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.event_type,
                    event.message
                );
            }
            print_next(page.next_cursor.as_deref());
        }
    }
    Ok(())
}

async fn cmd_run(orch: &Orchestrator, action: RunAction) -> anyhow::Result<()> {
    match action {
        RunAction::List { job, limit, cursor } => {
            let page = orch.db().list_runs(job, &page(limit, cursor)).await?;
            for run in &page.items {
                println!(
                    "{}  job {}  #{:<3}  {:<10}  {}",
                    run.id,
                    run.job_id,
                    run.attempt,
                    run.status,
                    run.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            print_next(page.next_cursor.as_deref());
        }
        RunAction::Cancel { id } => {
            let run = orch.cancel_run(id).await?;
            println!("Run {} is {}", run.id, run.status);
        }
    }
    Ok(())
}

async fn cmd_queue(orch: &Orchestrator, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Stats => {
            let stats = orch.db().queue_stats().await?;
            println!("pending: {}", stats.pending);
            println!("leased:  {}", stats.leased);
            println!("done:    {}", stats.done);
            println!("dead:    {}", stats.dead);
            println!("total:   {}", stats.total);
        }
        QueueAction::List {
            state,
            limit,
            cursor,
        } => {
            let page = orch
                .db()
                .list_queue_items(state, &page(limit, cursor))
                .await?;
            for item in &page.items {
                println!(
                    "{}  job {}  {:<8}  attempts {}  {}",
                    item.id,
                    item.job_id,
                    item.state,
                    item.attempts,
                    item.last_error.as_deref().unwrap_or("")
                );
            }
            print_next(page.next_cursor.as_deref());
        }
        QueueAction::Requeue { job, reason } => {
            let item = orch.requeue_job(job, &reason).await?;
            println!("Queue item {} is {}", item.id, item.state);
        }
        QueueAction::Sweep => {
            let now = chrono::Utc::now();
            let report = orch.sweep_expired_leases(now).await?;
            let repaired = orch.reconcile_orphans(now).await?;
            println!(
                "requeued {}, dead-lettered {}, orphans repaired {}",
                report.requeued,
                report.dead_lettered,
                repaired.len()
            );
        }
    }
    Ok(())
}

async fn cmd_agent(orch: &Orchestrator, action: AgentAction) -> anyhow::Result<()> {
    let agents = match action {
        AgentAction::List => orch.list_agents().await?,
        AgentAction::Show { id } => vec![orch.get_agent(id).await?],
        AgentAction::Drain { id } => vec![orch.drain_agent(id).await?],
        AgentAction::Resume { id } => vec![orch.resume_agent(id).await?],
    };
    for agent in &agents {
        println!(
            "{}  {:<20}  {:<8}  last seen {}",
            agent.id,
            agent.name,
            agent.status,
            agent.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_workflow(orch: &Orchestrator, action: WorkflowAction) -> anyhow::Result<()> {
    match action {
        WorkflowAction::Put {
            name,
            description,
            version,
            schema,
        } => {
            let wf = orch
                .db()
                .upsert_workflow(&name, &description, &parse_blob(schema)?, &version)
                .await?;
            println!("Workflow {} v{} saved", wf.name, wf.version);
        }
        WorkflowAction::List => {
            for wf in orch.db().list_workflows().await? {
                println!("{:<20}  v{:<8}  {}", wf.name, wf.version, wf.description);
            }
        }
        WorkflowAction::Delete { name } => {
            orch.db().delete_workflow(&name).await?;
            println!("Deleted workflow {name}");
        }
    }
    Ok(())
}

fn parse_blob(json: Option<String>) -> anyhow::Result<Blob> {
    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(empty_blob()),
    }
}

fn page(limit: u32, cursor: Option<String>) -> PageRequest {
    match cursor {
        Some(cursor) => PageRequest::new(limit).after(cursor),
        None => PageRequest::new(limit),
    }
}

fn print_next(cursor: Option<&str>) {
    if let Some(cursor) = cursor {
        println!("\nnext: --cursor {cursor}");
    }
}
