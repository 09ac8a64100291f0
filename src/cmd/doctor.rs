//! Connectivity self-test: `appfactory doctor`.

use anyhow::{Result, bail};
use console::style;

use appfactory::factory::config::{SupabaseSettings, VercelSettings};
use appfactory::factory::selftest::{PlatformCheck, run_self_test};

pub async fn cmd_doctor(json: bool) -> Result<()> {
    let supabase = SupabaseSettings::from_env()?;
    let vercel = VercelSettings::from_env()?;
    let report = run_self_test(&supabase, &vercel).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        for check in &report.checks {
            print_check(check);
        }
        println!();
    }

    if !report.all_reachable() {
        let unreachable = report.checks.iter().filter(|c| !c.reachable).count();
        bail!("{} platform(s) unreachable", unreachable);
    }
    Ok(())
}

fn print_check(check: &PlatformCheck) {
    let mark = if check.reachable {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!("{} {:<10} {}", mark, check.platform, check.detail);
    let cli = match (check.cli_installed, check.cli_authenticated) {
        (false, _) => style("not installed").dim(),
        (true, false) => style("installed, not authenticated").yellow(),
        (true, true) => style("installed, authenticated").green(),
    };
    println!("  {:<10} cli {}", "", cli);
}
