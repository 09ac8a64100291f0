use anyhow::Result;
use clap::{Parser, Subcommand};

use appfactory::factory::models::GenerationMode;

mod cmd;

#[derive(Parser)]
#[command(name = "appfactory")]
#[command(version, about = "Prompt-to-application generation factory")]
pub struct Cli {
    /// Log at debug level (overrides LOG_LEVEL)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the backend and deploy platforms are reachable
    Doctor {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the provisioning mode, pool slots and jobs holding them
    Pool,
    /// Create one backend project and print its pool slot variables
    Provision {
        /// Project name (a unique suffix is appended)
        name: String,
        /// Slot index to use in the printed variable names
        #[arg(long, default_value = "0")]
        slot: usize,
    },
    /// Submit a job and drive it in this process
    Run {
        /// What to build
        #[arg(short, long)]
        prompt: String,
        /// Application id (defaults to a generated one)
        #[arg(long)]
        app_id: Option<String>,
        /// single-pass, autonomous or confirm-each-iteration
        #[arg(long, default_value = "autonomous")]
        mode: GenerationMode,
        /// Iteration budget (defaults to MAX_ITERATIONS)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Skip deployment when the job completes
        #[arg(long)]
        no_deploy: bool,
        /// Confirm every iteration without asking
        #[arg(long)]
        yes: bool,
    },
    /// Resume a paused job, or a failed job that has an agent session
    Resume {
        job_id: i64,
        /// Raise the iteration budget before continuing
        #[arg(long, default_value = "0")]
        extra_iterations: u32,
        #[arg(long)]
        no_deploy: bool,
        #[arg(long)]
        yes: bool,
    },
    /// List jobs in the store
    Jobs {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Serve the job control API
    Serve {
        #[arg(long, default_value = "3141")]
        port: u16,
        /// Bind all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
        #[arg(long)]
        no_deploy: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    appfactory::logging::init_subscriber(&level, &format);

    match cli.command {
        Commands::Doctor { json } => cmd::cmd_doctor(json).await?,
        Commands::Pool => cmd::cmd_pool()?,
        Commands::Provision { name, slot } => cmd::cmd_provision(&name, slot).await?,
        Commands::Run {
            prompt,
            app_id,
            mode,
            max_iterations,
            no_deploy,
            yes,
        } => {
            cmd::cmd_run(
                cmd::RunArgs {
                    prompt,
                    app_id,
                    mode,
                    max_iterations,
                },
                !no_deploy,
                yes,
            )
            .await?
        }
        Commands::Resume {
            job_id,
            extra_iterations,
            no_deploy,
            yes,
        } => cmd::cmd_resume(job_id, extra_iterations, !no_deploy, yes).await?,
        Commands::Jobs { status } => cmd::cmd_jobs(status.as_deref())?,
        Commands::Serve {
            port,
            dev,
            no_deploy,
        } => cmd::cmd_serve(port, dev, no_deploy).await?,
    }

    Ok(())
}
