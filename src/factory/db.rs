use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Persistence seam for generation jobs and their deploy targets.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, new: NewJob, max_iterations: u32) -> Result<GenerationJob>;
    async fn get_job(&self, id: i64) -> Result<Option<GenerationJob>>;
    /// Write every mutable field of `job` back to the store.
    async fn save_job(&self, job: &GenerationJob) -> Result<()>;
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>>;
    async fn upsert_deploy_target(&self, target: &DeployTarget) -> Result<()>;
    async fn get_deploy_target(&self, job_id: i64) -> Result<Option<DeployTarget>>;
}

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl JobRepository for DbHandle {
    async fn create_job(&self, new: NewJob, max_iterations: u32) -> Result<GenerationJob> {
        self.call(move |db| db.create_job(&new, max_iterations)).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<GenerationJob>> {
        self.call(move |db| db.get_job(id)).await
    }

    async fn save_job(&self, job: &GenerationJob) -> Result<()> {
        let job = job.clone();
        self.call(move |db| db.save_job(&job)).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>> {
        self.call(move |db| db.list_jobs(status)).await
    }

    async fn upsert_deploy_target(&self, target: &DeployTarget) -> Result<()> {
        let target = target.clone();
        self.call(move |db| db.upsert_deploy_target(&target)).await
    }

    async fn get_deploy_target(&self, job_id: i64) -> Result<Option<DeployTarget>> {
        self.call(move |db| db.get_deploy_target(job_id)).await
    }
}

pub struct FactoryDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, app_id, prompt, mode, status, iteration_count, max_iterations, \
     last_session_id, pool_slot_index, warnings, iteration_data, error_message, deploy_error, \
     workspace_path, created_at, updated_at, completed_at";

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS generation_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    app_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    mode TEXT NOT NULL DEFAULT 'autonomous',
                    status TEXT NOT NULL DEFAULT 'queued',
                    iteration_count INTEGER NOT NULL DEFAULT 0,
                    max_iterations INTEGER NOT NULL,
                    last_session_id TEXT,
                    pool_slot_index INTEGER,
                    warnings TEXT NOT NULL DEFAULT '[]',
                    iteration_data TEXT NOT NULL DEFAULT '[]',
                    error_message TEXT,
                    deploy_error TEXT,
                    workspace_path TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS deploy_targets (
                    id TEXT PRIMARY KEY,
                    job_id INTEGER NOT NULL UNIQUE REFERENCES generation_jobs(id),
                    project_name TEXT NOT NULL,
                    platform_project_id TEXT NOT NULL,
                    public_url TEXT,
                    deployment_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_generation_jobs_status ON generation_jobs(status);
                CREATE INDEX IF NOT EXISTS idx_generation_jobs_app ON generation_jobs(app_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Generation jobs ───────────────────────────────────────────────

    pub fn create_job(&self, new: &NewJob, max_iterations: u32) -> Result<GenerationJob> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO generation_jobs (app_id, prompt, mode, status, max_iterations, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?5)",
                params![new.app_id, new.prompt, new.mode.as_str(), max_iterations, now],
            )
            .context("Failed to insert generation job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<GenerationJob>> {
        let sql = format!("SELECT {} FROM generation_jobs WHERE id = ?1", JOB_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, params![id], RawJob::from_row)
            .optional()
            .context("Failed to query generation job")?;
        raw.map(RawJob::into_job).transpose()
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>> {
        let (sql, filter) = match status {
            Some(s) => (
                format!(
                    "SELECT {} FROM generation_jobs WHERE status = ?1 ORDER BY id DESC",
                    JOB_COLUMNS
                ),
                Some(s.as_str()),
            ),
            None => (
                format!("SELECT {} FROM generation_jobs ORDER BY id DESC", JOB_COLUMNS),
                None,
            ),
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = match filter {
            Some(s) => stmt.query_map(params![s], RawJob::from_row),
            None => stmt.query_map([], RawJob::from_row),
        }
        .context("Failed to query generation jobs")?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn save_job(&self, job: &GenerationJob) -> Result<()> {
        let warnings = serde_json::to_string(&job.warnings)?;
        let iteration_data = serde_json::to_string(&job.iteration_data)?;
        let changed = self
            .conn
            .execute(
                "UPDATE generation_jobs SET
                    mode = ?1, status = ?2, iteration_count = ?3, max_iterations = ?4,
                    last_session_id = ?5, pool_slot_index = ?6, warnings = ?7,
                    iteration_data = ?8, error_message = ?9, deploy_error = ?10,
                    workspace_path = ?11, updated_at = ?12, completed_at = ?13
                 WHERE id = ?14",
                params![
                    job.mode.as_str(),
                    job.status.as_str(),
                    job.iteration_count,
                    job.max_iterations,
                    job.last_session_id,
                    job.pool_slot_index.map(|i| i as i64),
                    warnings,
                    iteration_data,
                    job.error_message,
                    job.deploy_error,
                    job.workspace_path,
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.id,
                ],
            )
            .context("Failed to update generation job")?;
        if changed == 0 {
            anyhow::bail!("Generation job {} does not exist", job.id);
        }
        Ok(())
    }

    /// Jobs left `generating` by a previous process lost their lease with it.
    /// Mark them failed so they can be resumed explicitly. Returns their ids.
    pub fn fail_interrupted_jobs(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM generation_jobs WHERE status = 'generating'")
            .context("Failed to prepare interrupted job scan")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query interrupted jobs")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read interrupted job ids")?;
        let now = Utc::now().to_rfc3339();
        for id in &ids {
            self.conn
                .execute(
                    "UPDATE generation_jobs SET status = 'failed', pool_slot_index = NULL,
                        error_message = 'interrupted by process restart', updated_at = ?1
                     WHERE id = ?2",
                    params![now, id],
                )
                .context("Failed to mark interrupted job")?;
        }
        Ok(ids)
    }

    // ── Deploy targets ────────────────────────────────────────────────

    pub fn upsert_deploy_target(&self, target: &DeployTarget) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO deploy_targets (id, job_id, project_name, platform_project_id, public_url, deployment_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) DO UPDATE SET
                    project_name = excluded.project_name,
                    platform_project_id = excluded.platform_project_id,
                    public_url = excluded.public_url,
                    deployment_id = excluded.deployment_id",
                params![
                    target.id,
                    target.job_id,
                    target.project_name,
                    target.platform_project_id,
                    target.public_url,
                    target.deployment_id,
                    target.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert deploy target")?;
        Ok(())
    }

    pub fn get_deploy_target(&self, job_id: i64) -> Result<Option<DeployTarget>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, job_id, project_name, platform_project_id, public_url, deployment_id, created_at
                 FROM deploy_targets WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        DeployTarget {
                            id: row.get(0)?,
                            job_id: row.get(1)?,
                            project_name: row.get(2)?,
                            platform_project_id: row.get(3)?,
                            public_url: row.get(4)?,
                            deployment_id: row.get(5)?,
                            created_at: Utc::now(),
                        },
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query deploy target")?;
        match raw {
            Some((mut target, created_at)) => {
                target.created_at = parse_time(&created_at)?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }
}

/// Column values as stored, before enum and JSON decoding.
struct RawJob {
    id: i64,
    app_id: String,
    prompt: String,
    mode: String,
    status: String,
    iteration_count: u32,
    max_iterations: u32,
    last_session_id: Option<String>,
    pool_slot_index: Option<i64>,
    warnings: String,
    iteration_data: String,
    error_message: Option<String>,
    deploy_error: Option<String>,
    workspace_path: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            app_id: row.get(1)?,
            prompt: row.get(2)?,
            mode: row.get(3)?,
            status: row.get(4)?,
            iteration_count: row.get(5)?,
            max_iterations: row.get(6)?,
            last_session_id: row.get(7)?,
            pool_slot_index: row.get(8)?,
            warnings: row.get(9)?,
            iteration_data: row.get(10)?,
            error_message: row.get(11)?,
            deploy_error: row.get(12)?,
            workspace_path: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    }

    fn into_job(self) -> Result<GenerationJob> {
        Ok(GenerationJob {
            id: self.id,
            app_id: self.app_id,
            prompt: self.prompt,
            mode: GenerationMode::from_str(&self.mode).map_err(|e| anyhow::anyhow!(e))?,
            status: JobStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            iteration_count: self.iteration_count,
            max_iterations: self.max_iterations,
            last_session_id: self.last_session_id,
            pool_slot_index: self.pool_slot_index.map(|i| i as usize),
            warnings: serde_json::from_str(&self.warnings).context("Corrupt warnings column")?,
            iteration_data: serde_json::from_str(&self.iteration_data)
                .context("Corrupt iteration_data column")?,
            error_message: self.error_message,
            deploy_error: self.deploy_error,
            workspace_path: self.workspace_path,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}
