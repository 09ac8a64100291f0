use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Generating,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled are audit-only end states.
    /// A failed job with a session can still be resumed explicitly.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// How the controller sequences agent iterations for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// One iteration, then the job is complete.
    SinglePass,
    /// Iterate until the agent signals done or the budget runs out.
    #[default]
    Autonomous,
    /// Pause after every iteration until the user resumes.
    ConfirmEachIteration,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SinglePass => "single_pass",
            Self::Autonomous => "autonomous",
            Self::ConfirmEachIteration => "confirm_each_iteration",
        }
    }
}

impl std::fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_pass" | "single-pass" => Ok(Self::SinglePass),
            "autonomous" => Ok(Self::Autonomous),
            "confirm_each_iteration" | "confirm-each-iteration" => {
                Ok(Self::ConfirmEachIteration)
            }
            _ => Err(format!("Invalid generation mode: {}", s)),
        }
    }
}

/// An ephemeral backend project: database plus auth credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendProject {
    /// Pool slot label (`pool-<i>`) or the platform project ref.
    pub id: String,
    pub url: String,
    pub anon_key: String,
    pub service_role_key: String,
    pub database_url: String,
}

impl std::fmt::Debug for BackendProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProject")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("anon_key", &"<redacted>")
            .field("service_role_key", &"<redacted>")
            .field("database_url", &"<redacted>")
            .finish()
    }
}

/// What a job receives from the pool on acquire.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// A leased pool slot.
    Pooled { slot: usize, project: BackendProject },
    /// Per-job mode: the agent creates its own project with this token.
    PerJob { access_token: String },
}

impl Credentials {
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::Pooled { slot, .. } => Some(*slot),
            Self::PerJob { .. } => None,
        }
    }

    /// Environment variables handed to the agent worker.
    pub fn agent_env(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Pooled { project, .. } => project_env(project),
            Self::PerJob { access_token } => {
                vec![("SUPABASE_ACCESS_TOKEN", access_token.clone())]
            }
        }
    }

    /// Environment variables injected into the deployed application.
    /// The management token is never forwarded to a public deployment.
    pub fn deploy_env(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Pooled { project, .. } => project_env(project),
            Self::PerJob { .. } => Vec::new(),
        }
    }
}

fn project_env(project: &BackendProject) -> Vec<(&'static str, String)> {
    vec![
        ("NEXT_PUBLIC_SUPABASE_URL", project.url.clone()),
        ("NEXT_PUBLIC_SUPABASE_ANON_KEY", project.anon_key.clone()),
        ("SUPABASE_SERVICE_ROLE_KEY", project.service_role_key.clone()),
        ("DATABASE_URL", project.database_url.clone()),
    ]
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled { slot, project } => f
                .debug_struct("Pooled")
                .field("slot", slot)
                .field("project", project)
                .finish(),
            Self::PerJob { .. } => f
                .debug_struct("PerJob")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// One agent round-trip, appended to the job's iteration log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub artifact: serde_json::Value,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub session_id: String,
    pub done: bool,
    pub recorded_at: DateTime<Utc>,
}

/// A prompt-to-application generation job. Never deleted; terminal rows are audit records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationJob {
    pub id: i64,
    pub app_id: String,
    pub prompt: String,
    pub mode: GenerationMode,
    pub status: JobStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub last_session_id: Option<String>,
    pub pool_slot_index: Option<usize>,
    pub warnings: Vec<String>,
    pub iteration_data: Vec<IterationRecord>,
    pub error_message: Option<String>,
    pub deploy_error: Option<String>,
    pub workspace_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// A paused job, or a failed one that still has an agent session, can pick up where it left off.
    pub fn is_resumable(&self) -> bool {
        match self.status {
            JobStatus::Paused => true,
            JobStatus::Failed => self.last_session_id.is_some(),
            _ => false,
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration_count >= self.max_iterations
    }
}

/// Request to create a generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub app_id: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

/// A deploy-platform project linked to one generation job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployTarget {
    pub id: String,
    pub job_id: i64,
    pub project_name: String,
    pub platform_project_id: String,
    pub public_url: Option<String>,
    pub deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The outcome of one release call. Every release yields a fresh deployment id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub deployment_id: String,
    pub url: Option<String>,
}
