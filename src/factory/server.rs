use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::agent::ClaudeAgentWorker;
use super::api::{self, AppState};
use super::config::FactoryConfig;
use super::controller::{ControllerSettings, GenerationJobController};
use super::db::{DbHandle, FactoryDb};
use super::deploy::DeployProvisioner;
use super::events::{self, JobEvent};
use super::models::JobStatus;
use super::pool::ResourcePool;

/// Configuration for the HTTP control surface.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
    /// Skip deployment of completed jobs.
    pub no_deploy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            dev_mode: false,
            no_deploy: false,
        }
    }
}

/// Wire a controller from configuration: pool, agent worker, deployer and job store.
///
/// Jobs left `generating` by a previous process are failed first, since the
/// in-memory lease table they relied on is gone.
pub fn assemble(
    config: &FactoryConfig,
    events: broadcast::Sender<JobEvent>,
    deploy: bool,
) -> Result<Arc<GenerationJobController>> {
    let db = FactoryDb::new(&config.db_path).context("Failed to initialize factory database")?;
    let interrupted = db
        .fail_interrupted_jobs()
        .context("Failed to reconcile interrupted jobs")?;
    if !interrupted.is_empty() {
        warn!(jobs = ?interrupted, "Marked jobs interrupted by a restart as failed");
    }
    // Paused jobs lost their in-memory lease; resume acquires a fresh one.
    for mut job in db.list_jobs(Some(JobStatus::Paused))? {
        if job.pool_slot_index.take().is_some() {
            db.save_job(&job)?;
            info!(job_id = job.id, "Cleared stale slot of paused job");
        }
    }

    let pool = ResourcePool::from_config(config)?;
    info!(mode = %pool.mode(), capacity = pool.capacity(), "Resource pool ready");

    let deployer = deploy.then(|| {
        let deployer = DeployProvisioner::from_settings(&config.vercel);
        info!(channels = ?deployer.channel_names(), "Deploy channels configured");
        Arc::new(deployer)
    });

    Ok(Arc::new(GenerationJobController::new(
        Arc::new(pool),
        Arc::new(ClaudeAgentWorker::new(config.agent_cmd.clone())),
        deployer,
        Arc::new(DbHandle::new(db)),
        events,
        ControllerSettings {
            default_max_iterations: config.max_iterations,
            workspace_root: config.workspace_dir.clone(),
        },
    )))
}

/// Build the full application router with the API and the event socket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(events::ws_handler))
        .with_state(state)
}

/// Start the factory server.
pub async fn start_server(factory: &FactoryConfig, config: ServerConfig) -> Result<()> {
    let (events, _rx) = broadcast::channel::<JobEvent>(256);
    let controller = assemble(factory, events.clone(), !config.no_deploy)?;

    let state = Arc::new(AppState {
        controller,
        events,
        backpressure_retry: api::BACKPRESSURE_RETRY,
    });
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "App factory listening");
    println!("App factory running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; server runs until killed");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
