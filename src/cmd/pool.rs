//! Pool and job listing: `appfactory pool`, `appfactory jobs`.

use anyhow::{Context, Result};
use console::style;
use std::str::FromStr;

use appfactory::factory::config::{FactoryConfig, ProvisioningMode};
use appfactory::factory::db::FactoryDb;
use appfactory::factory::models::JobStatus;

pub fn cmd_pool() -> Result<()> {
    let config = FactoryConfig::from_env()?;
    for warning in &config.warnings {
        println!("{} {}", style("warning:").yellow(), warning);
    }

    println!();
    println!("Provisioning mode: {}", style(config.mode).bold());
    if config.mode == ProvisioningMode::PerJob {
        println!("Each job provisions its own backend project; there is no pool.");
        println!();
        return Ok(());
    }

    // Leases live in the serving process; the store records which slot each live job used.
    let db = FactoryDb::new(&config.db_path).context("Failed to open factory database")?;
    let mut holders = db.list_jobs(Some(JobStatus::Generating))?;
    holders.extend(db.list_jobs(Some(JobStatus::Paused))?);

    println!("{} slot(s)", config.pool_slots.len());
    println!();
    println!("{:<6} {:<45} Job", "Slot", "URL");
    println!("{:<6} {:<45} ---", "------", "---------------------------------------------");
    for slot in &config.pool_slots {
        let holder = holders
            .iter()
            .find(|j| j.pool_slot_index == Some(slot.index))
            .map(|j| format!("#{} ({})", j.id, j.status))
            .unwrap_or_else(|| style("free").dim().to_string());
        println!("{:<6} {:<45} {}", slot.index, slot.project.url, holder);
    }
    println!();
    Ok(())
}

pub fn cmd_jobs(status: Option<&str>) -> Result<()> {
    let status = status
        .map(JobStatus::from_str)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let config = FactoryConfig::from_env()?;
    let db = FactoryDb::new(&config.db_path).context("Failed to open factory database")?;
    let jobs = db.list_jobs(status)?;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<24} {:<11} {:<8} Error",
        "Id", "App", "Mode", "Status", "Iter"
    );
    for job in &jobs {
        println!(
            "{:<6} {:<20} {:<24} {:<11} {:<8} {}",
            job.id,
            job.app_id,
            job.mode,
            job.status,
            format!("{}/{}", job.iteration_count, job.max_iterations),
            job.error_message
                .as_deref()
                .or(job.deploy_error.as_deref())
                .unwrap_or("")
        );
    }
    Ok(())
}
