//! Environment configuration for the factory.
//!
//! Values come from the process environment after an optional `.env` is
//! loaded with `dotenvy`. Parsing goes through a lookup function so tests
//! can feed a plain map instead of mutating the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::warn;

use super::models::BackendProject;
use super::poll::PollPolicy;

pub const DEFAULT_SUPABASE_API_URL: &str = "https://api.supabase.com";
pub const DEFAULT_VERCEL_API_URL: &str = "https://api.vercel.com";
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Which backend provisioning mode the process runs in. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMode {
    Pooled,
    PerJob,
}

impl ProvisioningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pooled => "pooled",
            Self::PerJob => "per-job",
        }
    }
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProvisioningMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pooled" | "pool" => Ok(Self::Pooled),
            "per-job" | "per_job" | "perjob" => Ok(Self::PerJob),
            _ => bail!(
                "Invalid provisioning mode '{}'. Valid values: pooled, per-job",
                s
            ),
        }
    }
}

/// A configured pool slot: its index and the project it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSlot {
    pub index: usize,
    pub project: BackendProject,
}

/// Backend platform (Supabase management API) settings.
#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub api_url: String,
    pub access_token: Option<String>,
    pub organization_id: Option<String>,
    pub region: String,
    pub poll: PollPolicy,
}

/// Deploy platform (Vercel) settings.
#[derive(Debug, Clone)]
pub struct VercelSettings {
    pub api_url: String,
    pub token: Option<String>,
    pub team_id: Option<String>,
    pub cli_cmd: String,
    pub poll: PollPolicy,
}

impl SupabaseSettings {
    /// Platform settings alone, without pool or mode resolution.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            api_url: get("SUPABASE_API_URL").unwrap_or_else(|| DEFAULT_SUPABASE_API_URL.to_string()),
            access_token: get("SUPABASE_ACCESS_TOKEN"),
            organization_id: get("SUPABASE_ORGANIZATION_ID"),
            region: get("SUPABASE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            poll: PollPolicy::new(
                secs(&get, "PROVISION_POLL_INTERVAL_SECS", 5)?,
                secs(&get, "PROVISION_TIMEOUT_SECS", 300)?,
            ),
        })
    }
}

impl VercelSettings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            api_url: get("VERCEL_API_URL").unwrap_or_else(|| DEFAULT_VERCEL_API_URL.to_string()),
            token: get("VERCEL_TOKEN"),
            team_id: get("VERCEL_TEAM_ID"),
            cli_cmd: get("VERCEL_CMD").unwrap_or_else(|| "vercel".to_string()),
            poll: PollPolicy::new(
                secs(&get, "DEPLOY_POLL_INTERVAL_SECS", 5)?,
                secs(&get, "DEPLOY_TIMEOUT_SECS", 600)?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub mode: ProvisioningMode,
    pub pool_slots: Vec<PoolSlot>,
    pub supabase: SupabaseSettings,
    pub vercel: VercelSettings,
    pub agent_cmd: String,
    pub max_iterations: u32,
    pub db_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
    /// Non-fatal problems found while loading (dropped slots and similar).
    pub warnings: Vec<String>,
}

impl FactoryConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a map of key/value pairs.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut warnings = Vec::new();

        let access_token = get("SUPABASE_ACCESS_TOKEN");
        let explicit_mode = get("SUPABASE_PROVISIONING_MODE")
            .map(|m| m.parse::<ProvisioningMode>())
            .transpose()?;
        let pool_size = get("SUPABASE_POOL_SIZE")
            .map(|v| {
                v.trim()
                    .parse::<usize>()
                    .with_context(|| format!("SUPABASE_POOL_SIZE must be a number, got '{}'", v))
            })
            .transpose()?;

        let pool_slots = load_pool_slots(&get, pool_size, &mut warnings);

        let mode = match explicit_mode {
            Some(ProvisioningMode::PerJob) => {
                if access_token.is_none() {
                    bail!("Per-job provisioning requires SUPABASE_ACCESS_TOKEN");
                }
                if !pool_slots.is_empty() {
                    let msg = format!(
                        "Per-job mode selected; ignoring {} configured pool slot(s)",
                        pool_slots.len()
                    );
                    warn!("{}", msg);
                    warnings.push(msg);
                }
                ProvisioningMode::PerJob
            }
            Some(ProvisioningMode::Pooled) | None => {
                if pool_slots.is_empty() {
                    bail!(
                        "No valid pool slots configured. Set SUPABASE_POOL_0_URL, \
                         SUPABASE_POOL_0_ANON_KEY, SUPABASE_POOL_0_SERVICE_ROLE_KEY and \
                         SUPABASE_POOL_0_DATABASE_URL, or select per-job mode with \
                         SUPABASE_PROVISIONING_MODE=per-job and SUPABASE_ACCESS_TOKEN"
                    );
                }
                ProvisioningMode::Pooled
            }
        };

        let max_iterations = match get("MAX_ITERATIONS") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .with_context(|| format!("MAX_ITERATIONS must be a number, got '{}'", v))?,
            None => DEFAULT_MAX_ITERATIONS,
        };
        if max_iterations == 0 {
            bail!("MAX_ITERATIONS must be at least 1");
        }

        Ok(Self {
            mode,
            pool_slots: if mode == ProvisioningMode::Pooled {
                pool_slots
            } else {
                Vec::new()
            },
            supabase: SupabaseSettings::from_lookup(&get)?,
            vercel: VercelSettings::from_lookup(&get)?,
            agent_cmd: get("AGENT_CMD").unwrap_or_else(|| "claude".to_string()),
            max_iterations,
            db_path: get("FACTORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".appfactory/factory.db")),
            workspace_dir: get("FACTORY_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".appfactory/workspaces")),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: get("LOG_FORMAT").unwrap_or_else(|| "pretty".to_string()),
            warnings,
        })
    }
}

const SLOT_FIELDS: [&str; 4] = ["URL", "ANON_KEY", "SERVICE_ROLE_KEY", "DATABASE_URL"];

fn slot_key(index: usize, field: &str) -> String {
    format!("SUPABASE_POOL_{}_{}", index, field)
}

/// Read pool slots. With an explicit size every index below it is checked;
/// otherwise indices are scanned until one has none of the four keys.
/// Partial slots are dropped, never partially used.
fn load_pool_slots<G>(get: &G, pool_size: Option<usize>, warnings: &mut Vec<String>) -> Vec<PoolSlot>
where
    G: Fn(&str) -> Option<String>,
{
    let mut slots = Vec::new();
    let mut index = 0;
    loop {
        if let Some(size) = pool_size
            && index >= size
        {
            break;
        }

        let values: Vec<Option<String>> = SLOT_FIELDS
            .iter()
            .map(|field| get(&slot_key(index, field)))
            .collect();
        let present = values.iter().filter(|v| v.is_some()).count();

        if present == 0 && pool_size.is_none() {
            break;
        }

        if present == SLOT_FIELDS.len() {
            let mut it = values.into_iter().flatten();
            // All four are present; the iterator yields them in SLOT_FIELDS order.
            if let (Some(url), Some(anon_key), Some(service_role_key), Some(database_url)) =
                (it.next(), it.next(), it.next(), it.next())
            {
                slots.push(PoolSlot {
                    index,
                    project: BackendProject {
                        id: format!("pool-{}", index),
                        url,
                        anon_key,
                        service_role_key,
                        database_url,
                    },
                });
            }
        } else {
            let missing: Vec<String> = SLOT_FIELDS
                .iter()
                .zip(values.iter())
                .filter(|(_, v)| v.is_none())
                .map(|(field, _)| slot_key(index, field))
                .collect();
            let msg = format!(
                "Dropping pool slot {}: missing {}",
                index,
                missing.join(", ")
            );
            warn!(slot = index, "{}", msg);
            warnings.push(msg);
        }

        index += 1;
    }
    slots
}

fn secs<G>(get: &G, key: &str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => {
            let n = v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", key, v))?;
            if n == 0 {
                bail!("{} must be at least 1", key);
            }
            Ok(Duration::from_secs(n))
        }
        None => Ok(Duration::from_secs(default)),
    }
}
