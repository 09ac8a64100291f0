//! In-process job driving: `appfactory run`, `appfactory resume`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use console::{Term, style};
use tokio::sync::broadcast;

use appfactory::factory::config::FactoryConfig;
use appfactory::factory::controller::{GenerationJobController, RunOutcome};
use appfactory::factory::events::JobEvent;
use appfactory::factory::models::{GenerationJob, GenerationMode, JobStatus, NewJob};
use appfactory::factory::server::assemble;

const BACKPRESSURE_RETRY: Duration = Duration::from_secs(5);

pub struct RunArgs {
    pub prompt: String,
    pub app_id: Option<String>,
    pub mode: GenerationMode,
    pub max_iterations: Option<u32>,
}

pub async fn cmd_run(args: RunArgs, deploy: bool, yes: bool) -> Result<()> {
    let (controller, printer) = start(deploy)?;

    let job = controller
        .submit(NewJob {
            app_id: args.app_id.unwrap_or_default(),
            prompt: args.prompt,
            mode: args.mode,
            max_iterations: args.max_iterations,
        })
        .await?;
    println!(
        "{} Job #{} ({}, up to {} iterations)",
        style("→").cyan(),
        job.id,
        job.mode,
        job.max_iterations
    );

    let outcome = controller.run_when_available(job.id, BACKPRESSURE_RETRY).await?;
    let result = finish(&controller, job.id, outcome, yes).await;
    printer.abort();
    result
}

pub async fn cmd_resume(job_id: i64, extra_iterations: u32, deploy: bool, yes: bool) -> Result<()> {
    let (controller, printer) = start(deploy)?;
    let outcome = controller
        .resume_when_available(job_id, extra_iterations, BACKPRESSURE_RETRY)
        .await?;
    let result = finish(&controller, job_id, outcome, yes).await;
    printer.abort();
    result
}

fn start(deploy: bool) -> Result<(Arc<GenerationJobController>, tokio::task::JoinHandle<()>)> {
    let config = FactoryConfig::from_env()?;
    for warning in &config.warnings {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }
    let (events, rx) = broadcast::channel::<JobEvent>(256);
    let controller = assemble(&config, events, deploy)?;
    let printer = tokio::spawn(print_events(rx));
    Ok((controller, printer))
}

/// Keep confirming paused iterations, then report how the job ended.
async fn finish(
    controller: &GenerationJobController,
    job_id: i64,
    mut outcome: RunOutcome,
    yes: bool,
) -> Result<()> {
    while outcome == RunOutcome::Paused {
        if !yes && !confirm_next_iteration()? {
            println!(
                "Job #{} paused. Continue later with: appfactory resume {}",
                job_id, job_id
            );
            return Ok(());
        }
        outcome = controller.resume(job_id, 0).await?;
    }

    // Let the printer drain the final events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = controller.get_job(job_id).await?;
    print_summary(&job);

    match job.status {
        JobStatus::Completed | JobStatus::Cancelled => Ok(()),
        _ => bail!(
            "Job #{} {}: {}",
            job.id,
            job.status,
            job.error_message.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn confirm_next_iteration() -> Result<bool> {
    let term = Term::stderr();
    term.write_str("Run the next iteration? [Y/n] ")?;
    let answer = term.read_line()?;
    Ok(!matches!(answer.trim().to_lowercase().as_str(), "n" | "no"))
}

async fn print_events(mut rx: broadcast::Receiver<JobEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::JobBackpressure { capacity, .. } => println!(
            "{} All {} pool slots are busy; waiting",
            style("…").yellow(),
            capacity
        ),
        JobEvent::StatusChanged { from, to, .. } => {
            println!("{} {} → {}", style("•").dim(), from, style(to).bold())
        }
        JobEvent::IterationCompleted {
            iteration,
            done,
            warnings,
            ..
        } => {
            let mark = if *done { style("✓").green() } else { style("·").cyan() };
            println!("{} Iteration {} finished", mark, iteration);
            for warning in warnings {
                println!("  {} {}", style("blocker:").yellow(), warning);
            }
        }
        JobEvent::DeployStarted { .. } => println!("{} Deploying", style("→").cyan()),
        JobEvent::DeployCompleted { release, .. } => println!(
            "{} Deployed {}",
            style("✓").green(),
            release.url.as_deref().unwrap_or(&release.deployment_id)
        ),
        JobEvent::DeployFailed { error, .. } => {
            println!("{} Deploy failed: {}", style("✗").red(), error)
        }
        JobEvent::JobQueued { .. } | JobEvent::JobFinished { .. } => {}
    }
}

fn print_summary(job: &GenerationJob) {
    println!();
    println!(
        "Job #{} {} after {}/{} iterations",
        job.id,
        style(job.status).bold(),
        job.iteration_count,
        job.max_iterations
    );
    if !job.warnings.is_empty() {
        println!("Warnings:");
        for warning in &job.warnings {
            println!("  - {}", warning);
        }
    }
    if let Some(path) = &job.workspace_path {
        println!("Workspace: {}", path);
    }
    if let Some(err) = &job.deploy_error {
        println!("{} {}", style("Deploy error:").red(), err);
    }
}
