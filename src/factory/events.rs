use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use super::api::AppState;
use super::models::{GenerationJob, JobStatus, Release};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Job events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    JobQueued {
        job_id: i64,
    },
    /// The job is waiting for a pool slot.
    JobBackpressure {
        job_id: i64,
        capacity: usize,
    },
    StatusChanged {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },
    IterationCompleted {
        job_id: i64,
        iteration: u32,
        done: bool,
        warnings: Vec<String>,
    },
    DeployStarted {
        job_id: i64,
    },
    DeployCompleted {
        job_id: i64,
        release: Release,
    },
    DeployFailed {
        job_id: i64,
        error: String,
    },
    /// Terminal or paused snapshot of the job.
    JobFinished {
        job: Box<GenerationJob>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> i64 {
        match self {
            Self::JobQueued { job_id }
            | Self::JobBackpressure { job_id, .. }
            | Self::StatusChanged { job_id, .. }
            | Self::IterationCompleted { job_id, .. }
            | Self::DeployStarted { job_id }
            | Self::DeployCompleted { job_id, .. }
            | Self::DeployFailed { job_id, .. } => *job_id,
            Self::JobFinished { job } => job.id,
        }
    }
}

/// Broadcast a job event. Returns silently when nobody is listening.
pub fn publish(tx: &broadcast::Sender<JobEvent>, event: JobEvent) {
    let _ = tx.send(event);
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<JobEvent>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward job events to one client with ping/pong keepalive.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<JobEvent>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize job event");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
