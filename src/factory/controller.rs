//! Generation job controller: the per-job state machine.
//!
//! ```text
//! queued ──► generating ──► completed
//!   │            │  ├─────► failed ──┐ (resume, needs a session)
//!   │            │  ├─────► paused ──┤ (resume)
//!   │            │  └─────► cancelled│
//!   └──► cancelled ◄── paused        └──► generating
//! ```
//!
//! Each job is driven by the caller's task (`run` / `resume`). Cancel and
//! pause are requests recorded on the job's control block and applied at the
//! next iteration boundary. Every state mutation for a job happens under that
//! job's state lock, re-reading the stored row first; the lock is never held
//! across an agent call.
//!
//! The pool lease is released on every terminal exit. A `LeaseGuard` backs
//! this up for early returns and dropped futures. Paused jobs keep their lease.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::agent::{AgentRequest, AgentWorker};
use super::db::JobRepository;
use super::deploy::{DeployProjectRef, DeployProvisioner};
use super::events::{JobEvent, publish};
use super::models::*;
use super::pool::{PoolStatus, ResourcePool};
use crate::errors::{JobError, PoolError};
use crate::util::slugify;

/// How a `run` or `resume` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    Paused,
    /// No pool slot was free. The job is unchanged; retry later.
    Backpressure,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub default_max_iterations: u32,
    pub workspace_root: PathBuf,
}

/// Per-job signals and the lock that serializes the job's state mutations.
#[derive(Default)]
struct JobControl {
    cancel_requested: AtomicBool,
    pause_requested: AtomicBool,
    driving: AtomicBool,
    state: tokio::sync::Mutex<()>,
}

/// Clears the `driving` flag when the driver exits.
struct DriverGuard(Arc<JobControl>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.driving.store(false, Ordering::SeqCst);
    }
}

/// Returns the job's lease on drop unless disarmed (paused jobs keep it).
struct LeaseGuard {
    pool: Arc<ResourcePool>,
    job_id: i64,
    armed: bool,
}

impl LeaseGuard {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.job_id);
        }
    }
}

/// Result of the checks made at an iteration boundary.
enum Boundary {
    Continue,
    Stop(RunOutcome),
}

pub struct GenerationJobController {
    pool: Arc<ResourcePool>,
    agent: Arc<dyn AgentWorker>,
    deployer: Option<Arc<DeployProvisioner>>,
    store: Arc<dyn JobRepository>,
    events: broadcast::Sender<JobEvent>,
    settings: ControllerSettings,
    controls: Mutex<HashMap<i64, Arc<JobControl>>>,
}

impl GenerationJobController {
    pub fn new(
        pool: Arc<ResourcePool>,
        agent: Arc<dyn AgentWorker>,
        deployer: Option<Arc<DeployProvisioner>>,
        store: Arc<dyn JobRepository>,
        events: broadcast::Sender<JobEvent>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            pool,
            agent,
            deployer,
            store,
            events,
            settings,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<i64, Arc<JobControl>>> {
        self.controls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn control(&self, job_id: i64) -> Arc<JobControl> {
        Arc::clone(self.controls().entry(job_id).or_default())
    }

    /// Drop the job's control entry unless someone is driving it or it was replaced.
    fn forget(&self, job_id: i64, control: &Arc<JobControl>) {
        let mut controls = self.controls();
        if let Some(current) = controls.get(&job_id)
            && Arc::ptr_eq(current, control)
            && !control.driving.load(Ordering::SeqCst)
        {
            controls.remove(&job_id);
        }
    }

    /// Forget the control of a job that reached a terminal status or does not exist.
    fn settle(
        &self,
        job_id: i64,
        control: &Arc<JobControl>,
        result: &Result<RunOutcome, JobError>,
    ) {
        let finished = matches!(
            result,
            Ok(RunOutcome::Completed | RunOutcome::Failed | RunOutcome::Cancelled)
                | Err(JobError::NotFound { .. })
        );
        if finished {
            self.forget(job_id, control);
        }
    }

    async fn load(&self, job_id: i64) -> Result<GenerationJob, JobError> {
        self.store
            .get_job(job_id)
            .await
            .map_err(JobError::Store)?
            .ok_or(JobError::NotFound { id: job_id })
    }

    async fn save(&self, job: &mut GenerationJob) -> Result<(), JobError> {
        job.updated_at = Utc::now();
        self.store.save_job(job).await.map_err(JobError::Store)
    }

    pub async fn get_job(&self, job_id: i64) -> Result<GenerationJob, JobError> {
        self.load(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<GenerationJob>, JobError> {
        self.store.list_jobs(status).await.map_err(JobError::Store)
    }

    fn invalid(job: &GenerationJob, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            id: job.id,
            from: job.status.to_string(),
            to: to.to_string(),
        }
    }

    // ── Submission ────────────────────────────────────────────────────

    /// Create a queued job.
    pub async fn submit(&self, mut new: NewJob) -> Result<GenerationJob, JobError> {
        if new.prompt.trim().is_empty() {
            return Err(JobError::BadRequest("prompt must not be empty".into()));
        }
        let max_iterations = new.max_iterations.unwrap_or(self.settings.default_max_iterations);
        if max_iterations == 0 {
            return Err(JobError::BadRequest("max_iterations must be at least 1".into()));
        }
        if new.app_id.trim().is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            new.app_id = format!("app-{}", &suffix[..8]);
        }
        let job = self
            .store
            .create_job(new, max_iterations)
            .await
            .map_err(JobError::Store)?;
        info!(job_id = job.id, app_id = %job.app_id, mode = %job.mode, "Job queued");
        publish(&self.events, JobEvent::JobQueued { job_id: job.id });
        Ok(job)
    }

    // ── Driving ───────────────────────────────────────────────────────

    /// Drive a queued job until it completes, fails, is cancelled or pauses.
    /// Returns `Backpressure` and leaves the job queued when the pool is full.
    pub async fn run(&self, job_id: i64) -> Result<RunOutcome, JobError> {
        let control = self.control(job_id);
        let driver = self.claim_driver(&control, job_id)?;
        let result = self.run_claimed(job_id, &control).await;
        drop(driver);
        self.settle(job_id, &control, &result);
        result
    }

    async fn run_claimed(&self, job_id: i64, control: &Arc<JobControl>) -> Result<RunOutcome, JobError> {
        let (job, credentials, lease) = {
            let _state = control.state.lock().await;
            let mut job = self.load(job_id).await?;
            if job.status != JobStatus::Queued {
                return Err(Self::invalid(&job, JobStatus::Generating));
            }
            let Some((credentials, lease)) = self.lease_for(&job)? else {
                return Ok(RunOutcome::Backpressure);
            };
            control.pause_requested.store(false, Ordering::SeqCst);
            self.enter_generating(&mut job, &credentials).await?;
            (job, credentials, lease)
        };

        self.drive(job, credentials, lease, control).await
    }

    /// `run`, retrying every `retry` while the pool is exhausted.
    pub async fn run_when_available(
        &self,
        job_id: i64,
        retry: std::time::Duration,
    ) -> Result<RunOutcome, JobError> {
        loop {
            match self.run(job_id).await? {
                RunOutcome::Backpressure => tokio::time::sleep(retry).await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Resume a paused job, or a failed job that has an agent session.
    /// `extra_iterations` raises the budget before continuing.
    pub async fn resume(&self, job_id: i64, extra_iterations: u32) -> Result<RunOutcome, JobError> {
        let control = self.control(job_id);
        let driver = self.claim_driver(&control, job_id)?;
        let result = self.resume_claimed(job_id, extra_iterations, &control).await;
        drop(driver);
        self.settle(job_id, &control, &result);
        result
    }

    /// `resume`, retrying every `retry` while the pool is exhausted. The
    /// extra iterations are granted once, by the attempt that gets a lease.
    pub async fn resume_when_available(
        &self,
        job_id: i64,
        extra_iterations: u32,
        retry: std::time::Duration,
    ) -> Result<RunOutcome, JobError> {
        loop {
            match self.resume(job_id, extra_iterations).await? {
                RunOutcome::Backpressure => tokio::time::sleep(retry).await,
                outcome => return Ok(outcome),
            }
        }
    }

    async fn resume_claimed(
        &self,
        job_id: i64,
        extra_iterations: u32,
        control: &Arc<JobControl>,
    ) -> Result<RunOutcome, JobError> {
        let (job, credentials, lease) = {
            let _state = control.state.lock().await;
            let mut job = self.load(job_id).await?;
            if !job.is_resumable() {
                return Err(Self::invalid(&job, JobStatus::Generating));
            }
            let Some((credentials, lease)) = self.lease_for(&job)? else {
                return Ok(RunOutcome::Backpressure);
            };
            control.pause_requested.store(false, Ordering::SeqCst);
            control.cancel_requested.store(false, Ordering::SeqCst);
            job.max_iterations = job.max_iterations.saturating_add(extra_iterations);
            job.error_message = None;
            job.completed_at = None;
            info!(
                job_id,
                from = %job.status,
                session = job.last_session_id.as_deref().unwrap_or(""),
                extra_iterations,
                "Resuming job"
            );
            self.enter_generating(&mut job, &credentials).await?;
            (job, credentials, lease)
        };

        self.drive(job, credentials, lease, control).await
    }

    fn claim_driver(&self, control: &Arc<JobControl>, job_id: i64) -> Result<DriverGuard, JobError> {
        if control.driving.swap(true, Ordering::SeqCst) {
            return Err(JobError::InvalidTransition {
                id: job_id,
                from: JobStatus::Generating.to_string(),
                to: JobStatus::Generating.to_string(),
            });
        }
        Ok(DriverGuard(Arc::clone(control)))
    }

    /// Acquire credentials. `None` means the pool is exhausted.
    fn lease_for(&self, job: &GenerationJob) -> Result<Option<(Credentials, LeaseGuard)>, JobError> {
        match self.pool.acquire(job.id) {
            Ok(credentials) => Ok(Some((
                credentials,
                LeaseGuard {
                    pool: Arc::clone(&self.pool),
                    job_id: job.id,
                    armed: true,
                },
            ))),
            Err(PoolError::PoolExhausted { capacity }) => {
                info!(job_id = job.id, capacity, "Pool exhausted; job stays {}", job.status);
                publish(
                    &self.events,
                    JobEvent::JobBackpressure {
                        job_id: job.id,
                        capacity,
                    },
                );
                Ok(None)
            }
        }
    }

    async fn enter_generating(
        &self,
        job: &mut GenerationJob,
        credentials: &Credentials,
    ) -> Result<(), JobError> {
        let from = job.status;
        job.status = JobStatus::Generating;
        job.pool_slot_index = credentials.slot();
        if job.workspace_path.is_none() {
            let dir = self.settings.workspace_root.join(format!("job-{}", job.id));
            job.workspace_path = Some(dir.to_string_lossy().into_owned());
        }
        self.save(job).await?;
        info!(job_id = job.id, slot = ?job.pool_slot_index, "Job generating");
        publish(
            &self.events,
            JobEvent::StatusChanged {
                job_id: job.id,
                from,
                to: JobStatus::Generating,
            },
        );
        Ok(())
    }

    fn workspace(&self, job: &GenerationJob) -> PathBuf {
        job.workspace_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.settings.workspace_root.join(format!("job-{}", job.id)))
    }

    /// Cancel, pause and budget checks made before each agent call.
    async fn boundary(
        &self,
        job: &mut GenerationJob,
        control: &JobControl,
    ) -> Result<Boundary, JobError> {
        if control.cancel_requested.load(Ordering::SeqCst) {
            self.finish(job, control, JobStatus::Cancelled, None).await?;
            return Ok(Boundary::Stop(RunOutcome::Cancelled));
        }
        if control.pause_requested.load(Ordering::SeqCst) {
            self.pause_now(job, control).await?;
            return Ok(Boundary::Stop(RunOutcome::Paused));
        }
        if job.budget_exhausted() {
            let message = JobError::IterationBudgetExhausted {
                iterations: job.iteration_count,
            }
            .to_string();
            warn!(job_id = job.id, iterations = job.iteration_count, "Iteration budget exhausted");
            self.finish(job, control, JobStatus::Failed, Some(message)).await?;
            return Ok(Boundary::Stop(RunOutcome::Failed));
        }
        Ok(Boundary::Continue)
    }

    async fn drive(
        &self,
        mut job: GenerationJob,
        credentials: Credentials,
        lease: LeaseGuard,
        control: &JobControl,
    ) -> Result<RunOutcome, JobError> {
        let workspace = self.workspace(&job);

        loop {
            match self.boundary(&mut job, control).await? {
                Boundary::Continue => {}
                Boundary::Stop(RunOutcome::Paused) => {
                    lease.keep();
                    return Ok(RunOutcome::Paused);
                }
                Boundary::Stop(outcome) => return Ok(outcome),
            }

            let request = AgentRequest {
                job_id: job.id,
                credentials: credentials.clone(),
                prompt: job.prompt.clone(),
                mode: job.mode,
                session_id: job.last_session_id.clone(),
                iteration: job.iteration_count + 1,
                workspace: workspace.clone(),
            };
            debug!(job_id = job.id, iteration = request.iteration, "Running iteration");

            let event = match self.agent.run_iteration(&request).await {
                Ok(event) => event,
                Err(e) => {
                    error!(job_id = job.id, iteration = request.iteration, error = %e, "Agent iteration failed");
                    self.finish(&mut job, control, JobStatus::Failed, Some(e.to_string()))
                        .await?;
                    return Ok(RunOutcome::Failed);
                }
            };

            {
                let _state = control.state.lock().await;
                job.iteration_count += 1;
                job.last_session_id = Some(event.session_id.clone());
                job.warnings.extend(event.warnings.iter().cloned());
                job.iteration_data.push(IterationRecord {
                    iteration: job.iteration_count,
                    artifact: event.artifact.clone(),
                    warnings: event.warnings.clone(),
                    session_id: event.session_id.clone(),
                    done: event.done,
                    recorded_at: Utc::now(),
                });
                self.save(&mut job).await?;
            }
            publish(
                &self.events,
                JobEvent::IterationCompleted {
                    job_id: job.id,
                    iteration: job.iteration_count,
                    done: event.done,
                    warnings: event.warnings,
                },
            );

            // A cancel that arrived mid-iteration wins over whatever the iteration produced.
            if control.cancel_requested.load(Ordering::SeqCst) {
                self.finish(&mut job, control, JobStatus::Cancelled, None).await?;
                return Ok(RunOutcome::Cancelled);
            }

            let finished = event.done || job.mode == GenerationMode::SinglePass;
            if finished {
                self.finish(&mut job, control, JobStatus::Completed, None).await?;
                drop(lease);
                self.deploy(&mut job, &credentials, &workspace).await?;
                return Ok(RunOutcome::Completed);
            }

            if job.mode == GenerationMode::ConfirmEachIteration && !job.budget_exhausted() {
                self.pause_now(&mut job, control).await?;
                lease.keep();
                return Ok(RunOutcome::Paused);
            }
        }
    }

    async fn pause_now(&self, job: &mut GenerationJob, control: &JobControl) -> Result<(), JobError> {
        let _state = control.state.lock().await;
        control.pause_requested.store(false, Ordering::SeqCst);
        job.status = JobStatus::Paused;
        self.save(job).await?;
        info!(job_id = job.id, iteration = job.iteration_count, "Job paused; lease kept");
        publish(
            &self.events,
            JobEvent::StatusChanged {
                job_id: job.id,
                from: JobStatus::Generating,
                to: JobStatus::Paused,
            },
        );
        publish(
            &self.events,
            JobEvent::JobFinished {
                job: Box::new(job.clone()),
            },
        );
        Ok(())
    }

    /// Move a job to a terminal status and return its lease.
    async fn finish(
        &self,
        job: &mut GenerationJob,
        control: &JobControl,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), JobError> {
        let from = job.status;
        {
            let _state = control.state.lock().await;
            job.status = status;
            job.error_message = error_message;
            job.completed_at = Some(Utc::now());
            job.pool_slot_index = None;
            let saved = self.save(job).await;
            self.pool.release(job.id);
            saved?;
        }
        info!(
            job_id = job.id,
            status = %status,
            iterations = job.iteration_count,
            error = job.error_message.as_deref().unwrap_or(""),
            "Job finished"
        );
        publish(
            &self.events,
            JobEvent::StatusChanged {
                job_id: job.id,
                from,
                to: status,
            },
        );
        publish(
            &self.events,
            JobEvent::JobFinished {
                job: Box::new(job.clone()),
            },
        );
        Ok(())
    }

    // ── Deploy ────────────────────────────────────────────────────────

    /// Release a completed job. Failures land in `deploy_error`; the job stays completed.
    async fn deploy(
        &self,
        job: &mut GenerationJob,
        credentials: &Credentials,
        workspace: &std::path::Path,
    ) -> Result<(), JobError> {
        let Some(deployer) = self.deployer.clone() else {
            return Ok(());
        };
        publish(&self.events, JobEvent::DeployStarted { job_id: job.id });

        match self.try_deploy(&deployer, job, credentials, workspace).await {
            Ok(release) => {
                info!(job_id = job.id, url = release.url.as_deref().unwrap_or(""), "Deployed");
                job.deploy_error = None;
                self.save(job).await?;
                publish(
                    &self.events,
                    JobEvent::DeployCompleted {
                        job_id: job.id,
                        release,
                    },
                );
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Deploy failed; job stays completed");
                job.deploy_error = Some(e.to_string());
                self.save(job).await?;
                publish(
                    &self.events,
                    JobEvent::DeployFailed {
                        job_id: job.id,
                        error: e.to_string(),
                    },
                );
            }
        }
        // The stored target is the record from here on.
        deployer.forget(job.id);
        Ok(())
    }

    async fn try_deploy(
        &self,
        deployer: &DeployProvisioner,
        job: &GenerationJob,
        credentials: &Credentials,
        workspace: &std::path::Path,
    ) -> Result<Release, JobError> {
        if deployer.cached_target(job.id).is_none()
            && let Some(stored) = self
                .store
                .get_deploy_target(job.id)
                .await
                .map_err(JobError::Store)?
        {
            deployer.restore(stored, workspace.to_path_buf());
        }

        let mut name = slugify(&job.app_id, 90);
        if name.is_empty() {
            name = format!("app-{}", job.id);
        }
        let project = DeployProjectRef {
            job_id: job.id,
            name,
            source_dir: workspace.to_path_buf(),
        };
        let target = deployer.create_or_link_target(&project).await?;
        self.store
            .upsert_deploy_target(&target)
            .await
            .map_err(JobError::Store)?;

        let vars: Vec<(String, String)> = credentials
            .deploy_env()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        if !vars.is_empty() {
            deployer.set_environment(&target, &vars).await?;
        }

        let release = deployer.release(&target, workspace).await?;
        if let Some(updated) = deployer.cached_target(job.id) {
            self.store
                .upsert_deploy_target(&updated)
                .await
                .map_err(JobError::Store)?;
        }
        Ok(release)
    }

    // ── Signals ───────────────────────────────────────────────────────

    /// Request a pause at the next iteration boundary.
    pub async fn pause(&self, job_id: i64) -> Result<GenerationJob, JobError> {
        let control = self.control(job_id);
        let _state = control.state.lock().await;
        let job = match self.load(job_id).await {
            Ok(job) => job,
            Err(e) => {
                self.forget(job_id, &control);
                return Err(e);
            }
        };
        match job.status {
            JobStatus::Generating => {
                control.pause_requested.store(true, Ordering::SeqCst);
                info!(job_id, "Pause requested");
                Ok(job)
            }
            JobStatus::Paused => Ok(job),
            _ => Err(Self::invalid(&job, JobStatus::Paused)),
        }
    }

    /// Cancel a job. Queued and paused jobs are cancelled immediately; a
    /// generating job is cancelled at its next iteration boundary.
    pub async fn cancel(&self, job_id: i64) -> Result<GenerationJob, JobError> {
        let control = self.control(job_id);
        let _state = control.state.lock().await;
        let mut job = match self.load(job_id).await {
            Ok(job) => job,
            Err(e) => {
                self.forget(job_id, &control);
                return Err(e);
            }
        };
        match job.status {
            JobStatus::Generating => {
                control.cancel_requested.store(true, Ordering::SeqCst);
                info!(job_id, "Cancel requested; applies at next iteration boundary");
                Ok(job)
            }
            JobStatus::Queued | JobStatus::Paused => {
                let from = job.status;
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                job.pool_slot_index = None;
                let saved = self.save(&mut job).await;
                self.pool.release(job_id);
                saved?;
                info!(job_id, from = %from, "Job cancelled");
                publish(
                    &self.events,
                    JobEvent::StatusChanged {
                        job_id,
                        from,
                        to: JobStatus::Cancelled,
                    },
                );
                publish(
                    &self.events,
                    JobEvent::JobFinished {
                        job: Box::new(job.clone()),
                    },
                );
                self.forget(job_id, &control);
                Ok(job)
            }
            _ => Err(Self::invalid(&job, JobStatus::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AgentError, DeployError, ProvisionError};
    use crate::factory::agent::IterationEvent;
    use crate::factory::config::PoolSlot;
    use crate::factory::db::{DbHandle, FactoryDb};
    use crate::factory::deploy::{DeployChannel, LinkedProject};
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Step {
        Continue,
        Done,
        Warn(&'static str),
        Fail,
    }

    /// Agent double that replays a script and records what it was asked.
    struct ScriptedAgent {
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        requests: Mutex<Vec<AgentRequest>>,
        gate: Option<(Notify, Notify)>,
        delay: Option<Duration>,
        active_slots: Mutex<HashSet<usize>>,
        shared_slot_seen: AtomicBool,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Step>, fallback: Step) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                requests: Mutex::new(Vec::new()),
                gate: None,
                delay: None,
                active_slots: Mutex::new(HashSet::new()),
                shared_slot_seen: AtomicBool::new(false),
            }
        }

        /// Block every iteration until `proceed` is notified; `started` fires on entry.
        fn gated(mut self) -> Self {
            self.gate = Some((Notify::new(), Notify::new()));
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, i: usize) -> AgentRequest {
            self.requests.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl AgentWorker for ScriptedAgent {
        async fn run_iteration(&self, request: &AgentRequest) -> Result<IterationEvent, AgentError> {
            self.requests.lock().unwrap().push(request.clone());
            let slot = request.credentials.slot();
            if let Some(slot) = slot
                && !self.active_slots.lock().unwrap().insert(slot)
            {
                self.shared_slot_seen.store(true, Ordering::SeqCst);
            }
            if let Some((started, proceed)) = &self.gate {
                started.notify_one();
                proceed.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(slot) = slot {
                self.active_slots.lock().unwrap().remove(&slot);
            }

            let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            let session_id = format!("sess-{}", request.job_id);
            let event = |done: bool, warnings: Vec<String>| IterationEvent {
                artifact: serde_json::json!({"summary": format!("iteration {}", request.iteration)}),
                warnings,
                done,
                session_id: session_id.clone(),
            };
            match step {
                Step::Continue => Ok(event(false, vec![])),
                Step::Done => Ok(event(true, vec![])),
                Step::Warn(w) => Ok(event(false, vec![w.to_string()])),
                Step::Fail => Err(AgentError::NonZeroExit {
                    exit_code: 1,
                    message: "agent crashed".into(),
                }),
            }
        }
    }

    /// Deploy channel double.
    struct FakeChannel {
        fail_release: bool,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl DeployChannel for FakeChannel {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn create_or_link(&self, project: &DeployProjectRef) -> Result<LinkedProject, ProvisionError> {
            Ok(LinkedProject {
                project_id: "prj_fake".into(),
                project_name: project.name.clone(),
            })
        }
        async fn set_environment(
            &self,
            _target: &DeployTarget,
            _workdir: &Path,
            vars: &[(String, String)],
        ) -> Result<(), ProvisionError> {
            assert!(vars.iter().any(|(k, _)| k == "NEXT_PUBLIC_SUPABASE_URL"));
            Ok(())
        }
        async fn release(&self, _target: &DeployTarget, _workdir: &Path) -> Result<Release, DeployError> {
            let n = self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                return Err(DeployError::BuildFailed {
                    deployment_id: format!("dpl_{}", n),
                    state: "ERROR".into(),
                });
            }
            Ok(Release {
                deployment_id: format!("dpl_{}", n),
                url: Some("https://recipe-app.vercel.app".into()),
            })
        }
    }

    fn slots(n: usize) -> Vec<PoolSlot> {
        (0..n)
            .map(|i| PoolSlot {
                index: i,
                project: BackendProject {
                    id: format!("pool-{}", i),
                    url: format!("https://slot{}.supabase.co", i),
                    anon_key: format!("anon-{}", i),
                    service_role_key: format!("service-{}", i),
                    database_url: format!("postgresql://slot{}", i),
                },
            })
            .collect()
    }

    struct Harness {
        controller: Arc<GenerationJobController>,
        pool: Arc<ResourcePool>,
        agent: Arc<ScriptedAgent>,
        store: DbHandle,
    }

    fn harness_with(pool: ResourcePool, agent: ScriptedAgent, deployer: Option<DeployProvisioner>) -> Harness {
        let pool = Arc::new(pool);
        let agent = Arc::new(agent);
        let store = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let (tx, _) = broadcast::channel(256);
        let controller = Arc::new(GenerationJobController::new(
            Arc::clone(&pool),
            agent.clone(),
            deployer.map(Arc::new),
            Arc::new(store.clone()),
            tx,
            ControllerSettings {
                default_max_iterations: 10,
                workspace_root: std::env::temp_dir().join("appfactory-tests"),
            },
        ));
        Harness {
            controller,
            pool,
            agent,
            store,
        }
    }

    fn harness(pool_size: usize, agent: ScriptedAgent) -> Harness {
        harness_with(ResourcePool::pooled(slots(pool_size)), agent, None)
    }

    fn new_job(mode: GenerationMode, max_iterations: Option<u32>) -> NewJob {
        NewJob {
            app_id: "recipe-app".into(),
            prompt: "A recipe sharing app".into(),
            mode,
            max_iterations,
        }
    }

    #[tokio::test]
    async fn test_autonomous_job_completes_on_done_signal() {
        let h = harness(2, ScriptedAgent::new(vec![Step::Continue, Step::Continue, Step::Done], Step::Continue));
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();

        let outcome = h.controller.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.iteration_count, 3);
        assert_eq!(job.iteration_data.len(), 3);
        assert!(job.iteration_data[2].done);
        assert_eq!(job.last_session_id.as_deref(), Some(format!("sess-{}", job.id).as_str()));
        assert_eq!(job.pool_slot_index, None);
        assert!(job.completed_at.is_some());
        assert_eq!(h.pool.status().releases, 1);
        assert!(h.pool.status().leased.is_empty());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_without_extra_agent_call() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, Some(10))).await.unwrap();

        let outcome = h.controller.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(h.agent.calls(), 10);

        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.iteration_count, 10);
        assert_eq!(job.error_message.as_deref(), Some("iteration budget exhausted"));
        assert_eq!(h.pool.status().releases, 1);
        assert!(h.pool.acquire(999).is_ok());
    }

    #[tokio::test]
    async fn test_single_pass_completes_after_one_iteration() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let job = h.controller.submit(new_job(GenerationMode::SinglePass, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);
        assert_eq!(h.agent.calls(), 1);
        assert_eq!(h.controller.get_job(job.id).await.unwrap().iteration_count, 1);
    }

    #[tokio::test]
    async fn test_confirm_each_pauses_and_resumes_with_session() {
        let h = harness(1, ScriptedAgent::new(vec![Step::Continue, Step::Continue, Step::Done], Step::Continue));
        let job = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();

        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Paused);
        let paused = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.iteration_count, 1);
        assert_eq!(paused.pool_slot_index, Some(0));
        assert_eq!(h.pool.slot_of(job.id), Some(0), "paused job keeps its lease");

        assert_eq!(h.controller.resume(job.id, 0).await.unwrap(), RunOutcome::Paused);
        assert_eq!(h.controller.resume(job.id, 0).await.unwrap(), RunOutcome::Completed);

        assert_eq!(h.agent.calls(), 3);
        assert_eq!(h.agent.request(0).session_id, None);
        assert_eq!(h.agent.request(1).session_id, Some(format!("sess-{}", job.id)));
        assert_eq!(h.agent.request(2).iteration, 3);
        assert_eq!(h.pool.status().releases, 1);
    }

    #[tokio::test]
    async fn test_confirm_each_at_budget_fails_instead_of_pausing() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let job = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, Some(2)))
            .await
            .unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Paused);
        assert_eq!(h.controller.resume(job.id, 0).await.unwrap(), RunOutcome::Failed);
        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.iteration_count, 2);
        assert_eq!(job.error_message.as_deref(), Some("iteration budget exhausted"));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_leaves_job_queued() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let first = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();
        let second = h.controller.submit(new_job(GenerationMode::SinglePass, None)).await.unwrap();

        assert_eq!(h.controller.run(first.id).await.unwrap(), RunOutcome::Paused);
        assert_eq!(h.controller.run(second.id).await.unwrap(), RunOutcome::Backpressure);
        assert_eq!(
            h.controller.get_job(second.id).await.unwrap().status,
            JobStatus::Queued
        );

        h.controller.cancel(first.id).await.unwrap();
        assert_eq!(h.controller.run(second.id).await.unwrap(), RunOutcome::Completed);
        let second = h.controller.get_job(second.id).await.unwrap();
        assert_eq!(second.iteration_data.len(), 1);
    }

    #[tokio::test]
    async fn test_two_slot_scenario_through_controller() {
        let h = harness(2, ScriptedAgent::new(vec![], Step::Continue));
        let ids: Vec<i64> = {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let job = h
                    .controller
                    .submit(new_job(GenerationMode::ConfirmEachIteration, None))
                    .await
                    .unwrap();
                ids.push(job.id);
            }
            ids
        };
        assert_eq!(h.controller.run(ids[0]).await.unwrap(), RunOutcome::Paused);
        assert_eq!(h.controller.run(ids[1]).await.unwrap(), RunOutcome::Paused);
        assert_eq!(h.controller.run(ids[2]).await.unwrap(), RunOutcome::Backpressure);

        h.controller.cancel(ids[0]).await.unwrap();
        assert_eq!(h.controller.run(ids[2]).await.unwrap(), RunOutcome::Paused);
        let third = h.controller.get_job(ids[2]).await.unwrap();
        assert_eq!(third.pool_slot_index, Some(0));
        let creds = h.agent.request(2).credentials;
        match creds {
            Credentials::Pooled { project, .. } => assert_eq!(project.url, "https://slot0.supabase.co"),
            other => panic!("Expected pooled credentials, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_iteration_applies_at_boundary() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue).gated());
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();

        let controller = Arc::clone(&h.controller);
        let driver = tokio::spawn(async move { controller.run(job.id).await });

        let (started, proceed) = h.agent.gate.as_ref().unwrap();
        started.notified().await;

        let during = h.controller.cancel(job.id).await.unwrap();
        assert_eq!(during.status, JobStatus::Generating, "cancel is a request, not an abort");

        proceed.notify_one();
        assert_eq!(driver.await.unwrap().unwrap(), RunOutcome::Cancelled);

        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.iteration_count, 1);
        assert_eq!(h.agent.calls(), 1);
        assert_eq!(h.pool.status().releases, 1);
    }

    #[tokio::test]
    async fn test_pause_request_mid_iteration() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue).gated());
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();

        let controller = Arc::clone(&h.controller);
        let driver = tokio::spawn(async move { controller.run(job.id).await });
        let (started, proceed) = h.agent.gate.as_ref().unwrap();
        started.notified().await;
        h.controller.pause(job.id).await.unwrap();
        proceed.notify_one();

        assert_eq!(driver.await.unwrap().unwrap(), RunOutcome::Paused);
        assert_eq!(h.pool.slot_of(job.id), Some(0));
        assert_eq!(h.pool.status().releases, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_paused_is_immediate() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let queued = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        let cancelled = h.controller.cancel(queued.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(matches!(
            h.controller.run(queued.id).await,
            Err(JobError::InvalidTransition { .. })
        ));

        let paused = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();
        h.controller.run(paused.id).await.unwrap();
        let cancelled = h.controller.cancel(paused.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(h.pool.slot_of(paused.id), None);
        assert_eq!(h.pool.status().releases, 1);
    }

    #[tokio::test]
    async fn test_terminal_jobs_reject_further_transitions() {
        let h = harness(1, ScriptedAgent::new(vec![Step::Done], Step::Continue));
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        h.controller.run(job.id).await.unwrap();

        assert!(matches!(h.controller.run(job.id).await, Err(JobError::InvalidTransition { .. })));
        assert!(matches!(h.controller.resume(job.id, 1).await, Err(JobError::InvalidTransition { .. })));
        assert!(matches!(h.controller.cancel(job.id).await, Err(JobError::InvalidTransition { .. })));
        assert!(matches!(h.controller.pause(job.id).await, Err(JobError::InvalidTransition { .. })));
        assert!(matches!(h.controller.run(4242).await, Err(JobError::NotFound { id: 4242 })));
    }

    #[tokio::test]
    async fn test_agent_failure_then_resume_with_session() {
        let h = harness(
            2,
            ScriptedAgent::new(vec![Step::Continue, Step::Fail, Step::Done], Step::Continue),
        );
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, Some(3))).await.unwrap();

        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Failed);
        let failed = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("agent crashed"));
        assert_eq!(failed.iteration_count, 1);
        assert!(failed.is_resumable());
        assert!(h.pool.status().leased.is_empty());

        assert_eq!(h.controller.resume(job.id, 2).await.unwrap(), RunOutcome::Completed);
        let done = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(done.max_iterations, 5);
        assert_eq!(done.iteration_count, 2);
        assert_eq!(done.error_message, None);
        assert_eq!(h.agent.request(2).session_id, Some(format!("sess-{}", job.id)));
        assert_eq!(h.pool.status().releases, 2);
    }

    #[tokio::test]
    async fn test_failed_job_without_session_is_not_resumable() {
        let h = harness(1, ScriptedAgent::new(vec![Step::Fail], Step::Continue));
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Failed);
        assert!(matches!(
            h.controller.resume(job.id, 1).await,
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_warnings_accumulate_without_changing_status() {
        let h = harness(
            1,
            ScriptedAgent::new(vec![Step::Warn("Need a logo"), Step::Warn("Stripe key missing"), Step::Done], Step::Continue),
        );
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);
        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.warnings, vec!["Need a logo".to_string(), "Stripe key missing".to_string()]);
        assert_eq!(job.iteration_data[0].warnings, vec!["Need a logo".to_string()]);
    }

    #[tokio::test]
    async fn test_per_job_mode_hands_token_to_agent() {
        let h = harness_with(
            ResourcePool::per_job("sbp_token"),
            ScriptedAgent::new(vec![Step::Done], Step::Continue),
            None,
        );
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);
        assert!(matches!(h.agent.request(0).credentials, Credentials::PerJob { .. }));
        assert_eq!(h.controller.get_job(job.id).await.unwrap().pool_slot_index, None);
    }

    #[tokio::test]
    async fn test_completion_deploys_and_records_target() {
        let channel = Arc::new(FakeChannel {
            fail_release: false,
            releases: AtomicUsize::new(0),
        });
        let h = harness_with(
            ResourcePool::pooled(slots(1)),
            ScriptedAgent::new(vec![Step::Done], Step::Continue),
            Some(DeployProvisioner::new(vec![channel.clone()])),
        );
        let mut events = h.controller.subscribe();
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);

        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.deploy_error, None);
        let target = h.store.get_deploy_target(job.id).await.unwrap().unwrap();
        assert_eq!(target.platform_project_id, "prj_fake");
        assert_eq!(target.deployment_id.as_deref(), Some("dpl_0"));
        assert_eq!(target.public_url.as_deref(), Some("https://recipe-app.vercel.app"));
        assert_eq!(channel.releases.load(Ordering::SeqCst), 1);

        let mut saw_deploy = false;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::DeployCompleted { release, .. } = event {
                assert_eq!(release.deployment_id, "dpl_0");
                saw_deploy = true;
            }
        }
        assert!(saw_deploy);
    }

    #[tokio::test]
    async fn test_deploy_failure_keeps_job_completed() {
        let channel = Arc::new(FakeChannel {
            fail_release: true,
            releases: AtomicUsize::new(0),
        });
        let h = harness_with(
            ResourcePool::pooled(slots(1)),
            ScriptedAgent::new(vec![Step::Done], Step::Continue),
            Some(DeployProvisioner::new(vec![channel])),
        );
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);

        let job = h.controller.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.deploy_error.as_deref().unwrap().contains("ERROR"));
        assert_eq!(job.error_message, None);
        assert_eq!(h.pool.status().releases, 1);
    }

    #[tokio::test]
    async fn test_deploy_leaves_no_cached_target_behind() {
        let channel = Arc::new(FakeChannel {
            fail_release: false,
            releases: AtomicUsize::new(0),
        });
        let h = harness_with(
            ResourcePool::pooled(slots(1)),
            ScriptedAgent::new(vec![Step::Done], Step::Continue),
            Some(DeployProvisioner::new(vec![channel])),
        );
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(job.id).await.unwrap(), RunOutcome::Completed);

        let deployer = h.controller.deployer.as_ref().unwrap();
        assert!(deployer.cached_target(job.id).is_none());
        assert!(h.store.get_deploy_target(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_control_entries_are_dropped_for_finished_jobs() {
        let h = harness(2, ScriptedAgent::new(vec![Step::Done], Step::Continue));
        let done = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        assert_eq!(h.controller.run(done.id).await.unwrap(), RunOutcome::Completed);

        let queued = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        h.controller.cancel(queued.id).await.unwrap();

        let paused = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();
        assert_eq!(h.controller.run(paused.id).await.unwrap(), RunOutcome::Paused);

        assert!(h.controller.pause(9999).await.is_err());
        assert!(h.controller.cancel(9999).await.is_err());
        assert!(h.controller.run(9999).await.is_err());

        let controls = h.controller.controls();
        assert_eq!(controls.keys().copied().collect::<Vec<_>>(), vec![paused.id]);
    }

    #[tokio::test]
    async fn test_resume_when_available_waits_for_a_slot() {
        let h = harness(1, ScriptedAgent::new(vec![Step::Continue, Step::Continue], Step::Done));
        let paused = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();
        assert_eq!(h.controller.run(paused.id).await.unwrap(), RunOutcome::Paused);
        // Simulate a restart: the lease is gone and another job holds the only slot.
        h.pool.release(paused.id);
        let holder = h
            .controller
            .submit(new_job(GenerationMode::ConfirmEachIteration, None))
            .await
            .unwrap();
        assert_eq!(h.controller.run(holder.id).await.unwrap(), RunOutcome::Paused);

        let controller = Arc::clone(&h.controller);
        let resumer = tokio::spawn(async move {
            controller
                .resume_when_available(paused.id, 2, Duration::from_millis(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.get_job(paused.id).await.unwrap().status, JobStatus::Paused);

        h.controller.cancel(holder.id).await.unwrap();
        assert_eq!(resumer.await.unwrap().unwrap(), RunOutcome::Completed);
        let job = h.controller.get_job(paused.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.max_iterations, 12);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let h = harness(1, ScriptedAgent::new(vec![], Step::Continue));
        let mut empty = new_job(GenerationMode::Autonomous, None);
        empty.prompt = "   ".into();
        assert!(matches!(h.controller.submit(empty).await, Err(JobError::BadRequest(_))));
        assert!(matches!(
            h.controller.submit(new_job(GenerationMode::Autonomous, Some(0))).await,
            Err(JobError::BadRequest(_))
        ));

        let mut anonymous = new_job(GenerationMode::Autonomous, None);
        anonymous.app_id = String::new();
        let job = h.controller.submit(anonymous).await.unwrap();
        assert!(job.app_id.starts_with("app-"));
        assert_eq!(job.max_iterations, 10);
    }

    #[tokio::test]
    async fn test_second_driver_is_rejected() {
        let h = harness(2, ScriptedAgent::new(vec![], Step::Continue).gated());
        let job = h.controller.submit(new_job(GenerationMode::Autonomous, None)).await.unwrap();
        let controller = Arc::clone(&h.controller);
        let driver = tokio::spawn(async move { controller.run(job.id).await });
        let (started, proceed) = h.agent.gate.as_ref().unwrap();
        started.notified().await;

        assert!(matches!(h.controller.run(job.id).await, Err(JobError::InvalidTransition { .. })));

        h.controller.cancel(job.id).await.unwrap();
        proceed.notify_one();
        assert_eq!(driver.await.unwrap().unwrap(), RunOutcome::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_jobs_never_share_a_slot() {
        let h = harness(
            2,
            ScriptedAgent::new(vec![], Step::Continue).slow(Duration::from_millis(5)),
        );
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(
                h.controller
                    .submit(new_job(GenerationMode::Autonomous, Some(3)))
                    .await
                    .unwrap()
                    .id,
            );
        }

        let tasks: Vec<_> = ids
            .iter()
            .map(|&id| {
                let controller = Arc::clone(&h.controller);
                tokio::spawn(async move {
                    controller
                        .run_when_available(id, Duration::from_millis(2))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), RunOutcome::Failed);
        }

        assert!(!h.agent.shared_slot_seen.load(Ordering::SeqCst));
        assert_eq!(h.agent.calls(), 8 * 3);
        assert_eq!(h.pool.status().releases, 8);
        assert!(h.pool.status().leased.is_empty());
    }
}
