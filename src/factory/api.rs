use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::controller::GenerationJobController;
use super::events::JobEvent;
use super::models::{GenerationMode, JobStatus, NewJob};
use crate::errors::JobError;

/// How long a started or resumed job waits between attempts to get a pool slot.
pub const BACKPRESSURE_RETRY: Duration = Duration::from_secs(5);

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: Arc<GenerationJobController>,
    pub events: broadcast::Sender<JobEvent>,
    pub backpressure_retry: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub app_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub mode: Option<GenerationMode>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Start driving the job right away.
    #[serde(default)]
    pub start: bool,
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub extra_iterations: u32,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            JobError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            JobError::BadRequest(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/start", post(start_job))
        .route("/api/jobs/{id}/pause", post(pause_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/pool", get(pool_status))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Drive a job on a background task, waiting out pool backpressure.
fn spawn_run(state: &SharedState, job_id: i64) {
    let controller = Arc::clone(&state.controller);
    let retry = state.backpressure_retry;
    tokio::spawn(async move {
        match controller.run_when_available(job_id, retry).await {
            Ok(outcome) => info!(job_id, ?outcome, "Job run ended"),
            Err(e) => warn!(job_id, error = %e, "Job run did not start"),
        }
    });
}

/// Resume a job on a background task, waiting out pool backpressure.
fn spawn_resume(state: &SharedState, job_id: i64, extra_iterations: u32) {
    let controller = Arc::clone(&state.controller);
    let retry = state.backpressure_retry;
    tokio::spawn(async move {
        match controller
            .resume_when_available(job_id, extra_iterations, retry)
            .await
        {
            Ok(outcome) => info!(job_id, ?outcome, "Resumed job run ended"),
            Err(e) => warn!(job_id, error = %e, "Job resume failed"),
        }
    });
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let jobs = state.controller.list_jobs(status).await?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .controller
        .submit(NewJob {
            app_id: req.app_id.unwrap_or_default(),
            prompt: req.prompt,
            mode: req.mode.unwrap_or_default(),
            max_iterations: req.max_iterations,
        })
        .await?;
    if req.start {
        spawn_run(&state, job.id);
    }
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.get_job(id).await?))
}

async fn start_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.controller.get_job(id).await?;
    if job.status != JobStatus::Queued {
        return Err(ApiError::Conflict(format!(
            "Job {} is {}; only queued jobs can be started",
            id, job.status
        )));
    }
    spawn_run(&state, id);
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn pause_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.pause(id).await?))
}

async fn resume_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Option<Json<ResumeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let job = state.controller.get_job(id).await?;
    if !job.is_resumable() {
        return Err(ApiError::Conflict(format!("Job {} is {} and cannot be resumed", id, job.status)));
    }
    spawn_resume(&state, id, req.extra_iterations);
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.cancel(id).await?))
}

async fn pool_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.controller.pool_status())
}

// ── Tests ─────────────────────────────────────────────────────────────
