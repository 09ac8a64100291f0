//! Typed error hierarchy for the app factory.
//!
//! One enum per seam of the generation subsystem:
//! - `PoolError`: lease acquisition against the resource pool
//! - `ProvisionError`: backend project creation and deploy-target setup
//! - `DeployError`: build/release of a generated application
//! - `AgentError`: failures of the external agent worker
//! - `JobError`: generation job controller failures

use std::time::Duration;

use thiserror::Error;

/// Errors from the resource pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every pool slot is leased. Capacity backpressure, not a defect.
    #[error("All {capacity} pool slots are leased")]
    PoolExhausted { capacity: usize },
}

/// Errors from provisioning an external backend project or deploy target.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Platform rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The project may exist on the platform even though it never reported healthy.
    #[error("Project {project_ref} did not become healthy within {}s", waited.as_secs())]
    Timeout {
        project_ref: String,
        waited: Duration,
    },

    #[error("Request to platform failed: {0}")]
    Request(String),

    #[error("Command-line tool failed: {0}")]
    Cli(String),

    #[error("No provisioning channel is configured")]
    NoChannel,
}

/// Errors from releasing a build to the deploy target.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Build {deployment_id} finished in state {state}")]
    BuildFailed { deployment_id: String, state: String },

    #[error("Build {deployment_id} did not finish within {}s", waited.as_secs())]
    Timeout {
        deployment_id: String,
        waited: Duration,
    },

    #[error("Deploy platform rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Request to deploy platform failed: {0}")]
    Request(String),

    #[error("Command-line tool failed: {0}")]
    Cli(String),

    #[error("Failed to read source at {path}: {message}")]
    Source { path: String, message: String },

    #[error("No deploy channel is configured")]
    NoChannel,
}

/// Errors from the agent worker.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent exited with non-zero code {exit_code}: {message}")]
    NonZeroExit { exit_code: i32, message: String },

    #[error("Agent produced no session id")]
    MissingSession,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the generation job controller.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Generation job {id} not found")]
    NotFound { id: i64 },

    #[error("Job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("iteration budget exhausted")]
    IterationBudgetExhausted { iterations: u32 },

    #[error("Invalid job request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Job store error: {0}")]
    Store(#[source] anyhow::Error),
}
