//! Deploy provisioning: link a Vercel project, inject environment, release.
//!
//! Two channels implement the same capability: the local `vercel` CLI and the
//! REST API. `DeployProvisioner` tries them in order and returns the first
//! success, so callers never learn which channel did the work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::VercelSettings;
use super::models::{DeployTarget, Release};
use super::poll::{PollDecision, PollObservation, PollPolicy, decide};
use super::provisioner::platform_message;
use crate::errors::{DeployError, ProvisionError};
use crate::util::tail;

/// Directories never uploaded with a release.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", ".next", ".vercel"];

/// What a job asks to be linked to a deploy project.
#[derive(Debug, Clone)]
pub struct DeployProjectRef {
    pub job_id: i64,
    pub name: String,
    pub source_dir: PathBuf,
}

/// A platform project as returned by a channel's link step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedProject {
    pub project_id: String,
    pub project_name: String,
}

/// One way of talking to the deploy platform.
#[async_trait]
pub trait DeployChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this channel can be used at all (tool installed, token set).
    async fn is_available(&self) -> bool;

    async fn create_or_link(&self, project: &DeployProjectRef) -> Result<LinkedProject, ProvisionError>;

    async fn set_environment(
        &self,
        target: &DeployTarget,
        workdir: &Path,
        vars: &[(String, String)],
    ) -> Result<(), ProvisionError>;

    /// Build and release `workdir`. Blocks until the platform reports an outcome.
    async fn release(&self, target: &DeployTarget, workdir: &Path) -> Result<Release, DeployError>;
}

struct Linked {
    target: DeployTarget,
    source_dir: PathBuf,
}

/// Ordered chain of deploy channels plus the per-job target cache.
pub struct DeployProvisioner {
    channels: Vec<Arc<dyn DeployChannel>>,
    targets: Mutex<HashMap<i64, Linked>>,
}

impl DeployProvisioner {
    pub fn new(channels: Vec<Arc<dyn DeployChannel>>) -> Self {
        Self {
            channels,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// CLI first, then the REST API when a token is configured.
    pub fn from_settings(settings: &VercelSettings) -> Self {
        let mut channels: Vec<Arc<dyn DeployChannel>> = vec![Arc::new(VercelCli::new(
            settings.cli_cmd.clone(),
            settings.token.clone(),
            settings.team_id.clone(),
        ))];
        if let Some(token) = &settings.token {
            channels.push(Arc::new(VercelApi::new(
                settings.api_url.clone(),
                token.clone(),
                settings.team_id.clone(),
                settings.poll,
            )));
        }
        Self::new(channels)
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    fn targets(&self) -> MutexGuard<'_, HashMap<i64, Linked>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the cache with a target loaded from the job store.
    pub fn restore(&self, target: DeployTarget, source_dir: PathBuf) {
        self.targets()
            .insert(target.job_id, Linked { target, source_dir });
    }

    pub fn cached_target(&self, job_id: i64) -> Option<DeployTarget> {
        self.targets().get(&job_id).map(|l| l.target.clone())
    }

    /// Drop the job's cached link. The job store keeps the durable copy.
    pub fn forget(&self, job_id: i64) {
        self.targets().remove(&job_id);
    }

    async fn available_channels(&self) -> Vec<Arc<dyn DeployChannel>> {
        let mut out = Vec::new();
        for channel in &self.channels {
            if channel.is_available().await {
                out.push(Arc::clone(channel));
            } else {
                debug!(channel = channel.name(), "Deploy channel unavailable; skipping");
            }
        }
        out
    }

    /// Link the job to a platform project. Returns the cached target on repeat calls.
    pub async fn create_or_link_target(
        &self,
        project: &DeployProjectRef,
    ) -> Result<DeployTarget, ProvisionError> {
        if let Some(target) = self.cached_target(project.job_id) {
            return Ok(target);
        }

        let mut last_err = ProvisionError::NoChannel;
        for channel in self.available_channels().await {
            match channel.create_or_link(project).await {
                Ok(linked) => {
                    info!(
                        job_id = project.job_id,
                        channel = channel.name(),
                        project_id = %linked.project_id,
                        "Linked deploy target"
                    );
                    let target = DeployTarget {
                        id: uuid::Uuid::new_v4().to_string(),
                        job_id: project.job_id,
                        project_name: linked.project_name,
                        platform_project_id: linked.project_id,
                        public_url: None,
                        deployment_id: None,
                        created_at: chrono::Utc::now(),
                    };
                    self.restore(target.clone(), project.source_dir.clone());
                    return Ok(target);
                }
                Err(e) => {
                    warn!(job_id = project.job_id, channel = channel.name(), error = %e, "Link failed; trying next channel");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn workdir_of(&self, job_id: i64) -> Option<PathBuf> {
        self.targets().get(&job_id).map(|l| l.source_dir.clone())
    }

    /// Inject environment variables into the target. Must precede `release`.
    pub async fn set_environment(
        &self,
        target: &DeployTarget,
        vars: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        let workdir = self.workdir_of(target.job_id).ok_or_else(|| {
            ProvisionError::Request(format!("Deploy target for job {} is not linked", target.job_id))
        })?;

        let mut last_err = ProvisionError::NoChannel;
        for channel in self.available_channels().await {
            match channel.set_environment(target, &workdir, vars).await {
                Ok(()) => {
                    debug!(job_id = target.job_id, channel = channel.name(), count = vars.len(), "Environment set");
                    return Ok(());
                }
                Err(e) => {
                    warn!(job_id = target.job_id, channel = channel.name(), error = %e, "Setting environment failed; trying next channel");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Release `source` to the target. Every call is a new deployment.
    pub async fn release(&self, target: &DeployTarget, source: &Path) -> Result<Release, DeployError> {
        let mut last_err = DeployError::NoChannel;
        for channel in self.available_channels().await {
            match channel.release(target, source).await {
                Ok(release) => {
                    info!(
                        job_id = target.job_id,
                        channel = channel.name(),
                        deployment_id = %release.deployment_id,
                        url = release.url.as_deref().unwrap_or(""),
                        "Release finished"
                    );
                    if let Some(linked) = self.targets().get_mut(&target.job_id) {
                        linked.target.deployment_id = Some(release.deployment_id.clone());
                        if release.url.is_some() {
                            linked.target.public_url = release.url.clone();
                        }
                    }
                    return Ok(release);
                }
                Err(e) => {
                    warn!(job_id = target.job_id, channel = channel.name(), error = %e, "Release failed; trying next channel");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

// ── CLI channel ────────────────────────────────────────────────────────

/// Deploys through the locally installed `vercel` command.
pub struct VercelCli {
    cmd: String,
    token: Option<String>,
    team_id: Option<String>,
    available: OnceCell<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliProjectFile {
    project_id: String,
}

impl VercelCli {
    pub fn new(cmd: impl Into<String>, token: Option<String>, team_id: Option<String>) -> Self {
        Self {
            cmd: cmd.into(),
            token,
            team_id,
            available: OnceCell::new(),
        }
    }

    fn command(&self, args: &[&str], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(args);
        if let Some(token) = &self.token {
            cmd.arg("--token").arg(token);
        }
        if let Some(team) = &self.team_id {
            cmd.arg("--scope").arg(team);
        }
        if let Some(dir) = cwd {
            cmd.arg("--cwd").arg(dir).current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the CLI to completion and return trimmed stdout, or stderr on failure.
    async fn run(&self, args: &[&str], cwd: Option<&Path>, stdin: Option<&str>) -> Result<String, String> {
        let mut child = self
            .command(args, cwd)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.cmd, e))?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Some(input) = stdin {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| format!("failed to write stdin: {}", e))?;
            }
            pipe.shutdown().await.map_err(|e| format!("failed to close stdin: {}", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("failed to wait for {}: {}", self.cmd, e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "{} {} exited with {}: {}",
                self.cmd,
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                tail(stderr.trim(), 500)
            ))
        }
    }

    /// `vercel --version` succeeds.
    pub async fn is_installed(&self) -> bool {
        Command::new(&self.cmd)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// `vercel whoami` succeeds.
    pub async fn is_authenticated(&self) -> bool {
        self.run(&["whoami"], None, None).await.is_ok()
    }

    /// Platform id of a deployment, read from `vercel inspect`. The CLI
    /// writes its report to stderr, so both streams are searched.
    async fn inspect_id(&self, url: &str) -> Option<String> {
        let mut child = self.command(&["inspect", url], None).spawn().ok()?;
        drop(child.stdin.take());
        let output = child.wait_with_output().await.ok()?;
        if !output.status.success() {
            debug!(url, code = ?output.status.code(), "vercel inspect failed");
            return None;
        }
        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        deployment_id_in(&text)
    }
}

/// First `dpl_` token in CLI output.
fn deployment_id_in(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|word| word.starts_with("dpl_") && word.len() > 4)
        .map(|word| word.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string())
}

#[async_trait]
impl DeployChannel for VercelCli {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async { self.is_authenticated().await })
            .await
    }

    async fn create_or_link(&self, project: &DeployProjectRef) -> Result<LinkedProject, ProvisionError> {
        std::fs::create_dir_all(&project.source_dir)
            .map_err(|e| ProvisionError::Cli(format!("cannot create {}: {}", project.source_dir.display(), e)))?;
        self.run(
            &["link", "--yes", "--project", &project.name],
            Some(&project.source_dir),
            None,
        )
        .await
        .map_err(ProvisionError::Cli)?;

        let file = project.source_dir.join(".vercel").join("project.json");
        let raw = std::fs::read_to_string(&file)
            .map_err(|e| ProvisionError::Cli(format!("cannot read {}: {}", file.display(), e)))?;
        let parsed: CliProjectFile = serde_json::from_str(&raw)
            .map_err(|e| ProvisionError::Cli(format!("invalid {}: {}", file.display(), e)))?;
        Ok(LinkedProject {
            project_id: parsed.project_id,
            project_name: project.name.clone(),
        })
    }

    async fn set_environment(
        &self,
        _target: &DeployTarget,
        workdir: &Path,
        vars: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        for (key, value) in vars {
            self.run(
                &["env", "add", key, "production", "--force"],
                Some(workdir),
                Some(value),
            )
            .await
            .map_err(ProvisionError::Cli)?;
        }
        Ok(())
    }

    async fn release(&self, _target: &DeployTarget, workdir: &Path) -> Result<Release, DeployError> {
        let stdout = self
            .run(&["deploy", "--prod", "--yes"], Some(workdir), None)
            .await
            .map_err(DeployError::Cli)?;
        // The deployment URL is the last line printed.
        let url = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("https://"))
            .ok_or_else(|| DeployError::Cli("deploy printed no deployment URL".into()))?
            .to_string();
        // Without an id from inspect, the deployment URL stands in as the id.
        let deployment_id = match self.inspect_id(&url).await {
            Some(id) => id,
            None => {
                warn!(url = %url, "Could not read deployment id; recording the URL instead");
                url.clone()
            }
        };
        Ok(Release {
            deployment_id,
            url: Some(url),
        })
    }
}

// ── REST API channel ───────────────────────────────────────────────────

/// Deploys through the Vercel REST API with a bearer token.
pub struct VercelApi {
    client: reqwest::Client,
    api_url: String,
    token: String,
    team_id: Option<String>,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct ApiProject {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiDeployment {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ready_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainList {
    #[serde(default)]
    domains: Vec<ApiDomain>,
}

#[derive(Debug, Deserialize)]
struct ApiDomain {
    name: String,
}

enum BuildState {
    Ready(Option<String>),
    Failed(String),
    Pending,
}

impl VercelApi {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        team_id: Option<String>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            team_id,
            poll,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token);
        if let Some(team) = &self.team_id {
            req = req.query(&[("teamId", team)]);
        }
        req
    }

    async fn find_project(&self, name: &str) -> Result<Option<ApiProject>, ProvisionError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v9/projects/{}", name))
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = reject_provision(resp).await?;
        let project = resp
            .json()
            .await
            .map_err(|e| ProvisionError::Request(format!("Invalid project response: {}", e)))?;
        Ok(Some(project))
    }

    async fn deployment_state(&self, deployment_id: &str) -> Result<BuildState, reqwest::Error> {
        let deployment: ApiDeployment = self
            .request(reqwest::Method::GET, &format!("/v13/deployments/{}", deployment_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match deployment.ready_state.as_deref() {
            Some("READY") => BuildState::Ready(deployment.url),
            Some(state @ ("ERROR" | "CANCELED")) => BuildState::Failed(state.to_string()),
            _ => BuildState::Pending,
        })
    }

    async fn wait_for_build(&self, deployment_id: &str) -> Result<Option<String>, DeployError> {
        let started = Instant::now();
        loop {
            let budget = self.poll.remaining(started.elapsed());
            let state = tokio::time::timeout(budget, self.deployment_state(deployment_id)).await;
            let observation = match state {
                Err(_) => {
                    debug!(deployment_id, "Build status poll outlived the ceiling; abandoning it");
                    PollObservation::TransientError
                }
                Ok(Ok(BuildState::Ready(url))) => return Ok(url),
                Ok(Ok(BuildState::Failed(state))) => {
                    return Err(DeployError::BuildFailed {
                        deployment_id: deployment_id.to_string(),
                        state,
                    });
                }
                Ok(Ok(BuildState::Pending)) => PollObservation::Pending,
                Ok(Err(e)) => {
                    debug!(deployment_id, error = %e, "Build status poll failed; will retry");
                    PollObservation::TransientError
                }
            };
            match decide(observation, started.elapsed(), &self.poll) {
                PollDecision::KeepPolling { wait } => tokio::time::sleep(wait).await,
                PollDecision::TimedOut => {
                    return Err(DeployError::Timeout {
                        deployment_id: deployment_id.to_string(),
                        waited: started.elapsed(),
                    });
                }
                // Ready is returned above.
                PollDecision::Succeeded => return Ok(None),
            }
        }
    }

    /// First assigned domain of the project, if any. Failures yield `None`.
    async fn resolve_domain(&self, project_id: &str) -> Option<String> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v9/projects/{}/domains", project_id))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let list: DomainList = resp.json().await.ok()?;
        list.domains.first().map(|d| format!("https://{}", d.name))
    }
}

/// Files under `dir` encoded for an inline-upload deployment.
fn collect_files(dir: &Path) -> Result<Vec<serde_json::Value>, DeployError> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| SKIP_DIRS.contains(&n)))
        });
    for entry in walker {
        let entry = entry.map_err(|e| DeployError::Source {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let data = std::fs::read(path).map_err(|e| DeployError::Source {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        files.push(json!({
            "file": rel,
            "data": BASE64.encode(data),
            "encoding": "base64",
        }));
    }
    if files.is_empty() {
        return Err(DeployError::Source {
            path: dir.display().to_string(),
            message: "no files to deploy".into(),
        });
    }
    Ok(files)
}

#[async_trait]
impl DeployChannel for VercelApi {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn is_available(&self) -> bool {
        !self.token.is_empty()
    }

    async fn create_or_link(&self, project: &DeployProjectRef) -> Result<LinkedProject, ProvisionError> {
        if let Some(existing) = self.find_project(&project.name).await? {
            return Ok(LinkedProject {
                project_id: existing.id,
                project_name: existing.name,
            });
        }
        let resp = self
            .request(reqwest::Method::POST, "/v10/projects")
            .json(&json!({ "name": project.name, "framework": "nextjs" }))
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        let created: ApiProject = reject_provision(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProvisionError::Request(format!("Invalid project response: {}", e)))?;
        Ok(LinkedProject {
            project_id: created.id,
            project_name: created.name,
        })
    }

    async fn set_environment(
        &self,
        target: &DeployTarget,
        _workdir: &Path,
        vars: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        if vars.is_empty() {
            return Ok(());
        }
        let body: Vec<serde_json::Value> = vars
            .iter()
            .map(|(key, value)| {
                json!({
                    "key": key,
                    "value": value,
                    "type": "encrypted",
                    "target": ["production", "preview"],
                })
            })
            .collect();
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/v10/projects/{}/env", target.platform_project_id),
            )
            .query(&[("upsert", "true")])
            .json(&body)
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        reject_provision(resp).await?;
        Ok(())
    }

    async fn release(&self, target: &DeployTarget, workdir: &Path) -> Result<Release, DeployError> {
        let files = collect_files(workdir)?;
        let resp = self
            .request(reqwest::Method::POST, "/v13/deployments")
            .json(&json!({
                "name": target.project_name,
                "project": target.platform_project_id,
                "target": "production",
                "files": files,
            }))
            .send()
            .await
            .map_err(|e| DeployError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeployError::Rejected {
                status: status.as_u16(),
                message: platform_message(&body),
            });
        }
        let created: ApiDeployment = resp
            .json()
            .await
            .map_err(|e| DeployError::Request(format!("Invalid deployment response: {}", e)))?;
        info!(deployment_id = %created.id, "Deployment created; waiting for build");

        let deployment_url = self.wait_for_build(&created.id).await?.or(created.url);
        let url = match self.resolve_domain(&target.platform_project_id).await {
            Some(domain) => Some(domain),
            None => deployment_url.map(|u| {
                if u.starts_with("http") {
                    u
                } else {
                    format!("https://{}", u)
                }
            }),
        };
        Ok(Release {
            deployment_id: created.id,
            url,
        })
    }
}

async fn reject_provision(resp: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProvisionError::Rejected {
        status: status.as_u16(),
        message: platform_message(&body),
    })
}
