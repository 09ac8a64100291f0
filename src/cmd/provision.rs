//! One-off backend project creation: `appfactory provision`.

use anyhow::{Context, Result};
use console::style;

use appfactory::factory::config::SupabaseSettings;
use appfactory::factory::provisioner::{ProjectProvisioner, SupabaseProvisioner};

pub async fn cmd_provision(name: &str, slot: usize) -> Result<()> {
    let settings = SupabaseSettings::from_env()?;
    let provisioner = SupabaseProvisioner::from_settings(&settings)?;

    eprintln!(
        "{} Creating backend project '{}' (this can take a few minutes)...",
        style("→").cyan(),
        name
    );
    let project = provisioner
        .create(name)
        .await
        .with_context(|| format!("Failed to provision project '{}'", name))?;
    eprintln!("{} Project {} is healthy", style("✓").green(), project.id);

    // Printed to stdout so the lines can be appended to a .env file.
    println!("SUPABASE_POOL_{}_URL={}", slot, project.url);
    println!("SUPABASE_POOL_{}_ANON_KEY={}", slot, project.anon_key);
    println!("SUPABASE_POOL_{}_SERVICE_ROLE_KEY={}", slot, project.service_role_key);
    println!("SUPABASE_POOL_{}_DATABASE_URL={}", slot, project.database_url);
    Ok(())
}
