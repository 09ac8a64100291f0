//! Agent worker: the external process that turns a prompt into code.
//!
//! The controller only sees `AgentWorker::run_iteration`. The bundled
//! `ClaudeAgentWorker` drives the Claude CLI in stream-json mode inside the
//! job's workspace, exporting the leased backend credentials as environment
//! variables and reading session id, completion and blocker signals back
//! from the stream.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::models::{Credentials, GenerationMode};
use crate::errors::AgentError;
use crate::util::tail;

/// Completion signal the agent prints when the app is finished.
pub const DONE_SIGNAL: &str = "<promise>DONE</promise>";

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").expect("valid blocker regex"));

/// One request to the agent worker.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub job_id: i64,
    pub credentials: Credentials,
    pub prompt: String,
    pub mode: GenerationMode,
    /// Continuation token from the previous iteration, if any.
    pub session_id: Option<String>,
    /// 1-based number of the iteration being run.
    pub iteration: u32,
    pub workspace: PathBuf,
}

/// What one iteration produced.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationEvent {
    pub artifact: serde_json::Value,
    pub warnings: Vec<String>,
    pub done: bool,
    pub session_id: String,
}

#[async_trait]
pub trait AgentWorker: Send + Sync {
    async fn run_iteration(&self, request: &AgentRequest) -> Result<IterationEvent, AgentError>;
}

/// Subset of Claude CLI stream-json events the worker reads.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

/// Everything read from one agent run's stdout.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedRun {
    pub session_id: Option<String>,
    pub text: String,
    pub final_result: Option<String>,
    pub is_error: bool,
    pub tool_uses: Vec<String>,
    pub num_turns: Option<u32>,
    pub cost_usd: Option<f64>,
}

impl ParsedRun {
    /// Feed one stdout line. Lines that are not stream-json are kept as text.
    pub fn push_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<StreamEvent>(trimmed) {
            Ok(StreamEvent::System { session_id }) => self.note_session(session_id),
            Ok(StreamEvent::Assistant {
                message,
                session_id,
            }) => {
                self.note_session(session_id);
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::ToolUse { name } => self.tool_uses.push(name),
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error,
                session_id,
                num_turns,
                total_cost_usd,
            }) => {
                self.note_session(session_id);
                self.final_result = result;
                self.is_error = is_error;
                self.num_turns = num_turns;
                self.cost_usd = total_cost_usd;
            }
            Ok(StreamEvent::Other) => {}
            Err(_) => {
                self.text.push_str(trimmed);
                self.text.push('\n');
            }
        }
    }

    fn note_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            self.session_id = Some(id);
        }
    }

    /// All text the agent produced, final result included.
    fn full_text(&self) -> String {
        match &self.final_result {
            Some(result) => format!("{}\n{}", self.text, result),
            None => self.text.clone(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.full_text().contains(DONE_SIGNAL)
    }

    pub fn blockers(&self) -> Vec<String> {
        let text = self.full_text();
        let mut found: Vec<String> = Vec::new();
        for cap in BLOCKER_REGEX.captures_iter(&text) {
            let description = cap[1].trim().to_string();
            if !description.is_empty() && !found.contains(&description) {
                found.push(description);
            }
        }
        found
    }

    /// Artifact recorded in the job's iteration log.
    pub fn artifact(&self) -> serde_json::Value {
        let summary = self
            .final_result
            .clone()
            .unwrap_or_else(|| self.text.trim().to_string());
        json!({
            "summary": tail(&summary, 2000),
            "tool_uses": self.tool_uses.len(),
            "num_turns": self.num_turns,
            "cost_usd": self.cost_usd,
        })
    }
}

/// Prompt for one iteration. The first iteration carries the full brief;
/// later ones continue the same session.
pub fn build_prompt(request: &AgentRequest) -> String {
    if request.session_id.is_some() {
        return format!(
            "Continue building the application (iteration {}). Pick up where you left off, \
             fix anything broken, and keep going toward the original request.\n\n\
             When the application is complete and builds cleanly, output {}.\n\
             If you are blocked on something only a human can resolve, output \
             <blocker>description</blocker>.",
            request.iteration, DONE_SIGNAL
        );
    }

    let backend = match &request.credentials {
        Credentials::Pooled { .. } => {
            "A Supabase backend is already provisioned for you. Its connection details are in the \
             environment variables NEXT_PUBLIC_SUPABASE_URL, NEXT_PUBLIC_SUPABASE_ANON_KEY, \
             SUPABASE_SERVICE_ROLE_KEY and DATABASE_URL. Do not create another project."
        }
        Credentials::PerJob { .. } => {
            "No backend exists yet. Use the Supabase management token in SUPABASE_ACCESS_TOKEN to \
             create a project for this application, and write its connection details to .env.local."
        }
    };
    let pacing = match request.mode {
        GenerationMode::SinglePass => "You have a single pass: deliver a complete, working result now.",
        GenerationMode::Autonomous => "Work in focused increments; you will be called again to continue.",
        GenerationMode::ConfirmEachIteration => {
            "Work in one focused increment, then stop and summarize what you did; \
             the user reviews each increment before you continue."
        }
    };

    format!(
        "Build a Next.js web application in the current directory.\n\n\
         ## Request\n{}\n\n## Backend\n{}\n\n## Pacing\n{}\n\n\
         When the application is complete and builds cleanly, output {}.\n\
         If you are blocked on something only a human can resolve, output \
         <blocker>description</blocker>.",
        request.prompt.trim(),
        backend,
        pacing,
        DONE_SIGNAL
    )
}

/// Runs the Claude CLI as the agent worker.
pub struct ClaudeAgentWorker {
    cmd: String,
}

impl ClaudeAgentWorker {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    fn args(request: &AgentRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(session) = &request.session_id {
            args.push("--resume".into());
            args.push(session.clone());
        }
        args
    }
}

#[async_trait]
impl AgentWorker for ClaudeAgentWorker {
    async fn run_iteration(&self, request: &AgentRequest) -> Result<IterationEvent, AgentError> {
        std::fs::create_dir_all(&request.workspace).map_err(AgentError::SpawnFailed)?;

        let mut cmd = Command::new(&self.cmd);
        cmd.args(Self::args(request))
            .envs(request.credentials.agent_env())
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            job_id = request.job_id,
            iteration = request.iteration,
            resume = request.session_id.is_some(),
            "Spawning agent"
        );
        let mut child = cmd.spawn().map_err(AgentError::SpawnFailed)?;

        let prompt = build_prompt(request);
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(AgentError::SpawnFailed)?;
            stdin.shutdown().await.map_err(AgentError::SpawnFailed)?;
        }

        // Drain stderr alongside stdout so a chatty agent cannot fill the pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut parsed = ParsedRun::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| AgentError::Other(e.into()))?
            {
                parsed.push_line(&line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Other(e.into()))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            let message = if stderr.trim().is_empty() {
                tail(parsed.full_text().trim(), 500)
            } else {
                tail(stderr.trim(), 500)
            };
            warn!(job_id = request.job_id, exit_code, "Agent exited with failure");
            return Err(AgentError::NonZeroExit { exit_code, message });
        }
        if parsed.is_error {
            let message = parsed.final_result.clone().unwrap_or_default();
            return Err(AgentError::Other(anyhow::anyhow!(
                "Agent reported an error: {}",
                tail(&message, 500)
            )));
        }

        let session_id = parsed
            .session_id
            .clone()
            .or_else(|| request.session_id.clone())
            .ok_or(AgentError::MissingSession)?;
        let event = IterationEvent {
            artifact: parsed.artifact(),
            warnings: parsed.blockers(),
            done: parsed.is_done(),
            session_id,
        };
        debug!(
            job_id = request.job_id,
            done = event.done,
            warnings = event.warnings.len(),
            "Agent iteration finished"
        );
        Ok(event)
    }
}
