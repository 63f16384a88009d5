//! Job services: orchestration, execution, worker pool and recovery sweep

pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod worker;

pub use orchestrator::{
    Claim, JobProgress, Orchestrator, OrchestratorError, OrchestratorResult, OrchestratorSettings,
    QueueStats, RecoveryReport,
};
pub use recovery::spawn_recovery_sweep;
pub use runner::{failure_status, JobRunner};
pub use worker::{WorkerPool, WorkerSettings};
