//! Execution engine: the orchestrator plus the daemons that drive it.

pub mod orchestrator;
pub mod sweeper;
pub mod worker;

pub use orchestrator::{Orchestrator, OrchestratorConfig, SweepReport};
pub use sweeper::Sweeper;
pub use worker::{
    EchoHandler, ExecutionContext, HandlerRegistry, Worker, WorkerConfig, WorkflowHandler,
};
