//! Resource pool: leases backend projects to generation jobs.
//!
//! In pooled mode a fixed set of pre-created projects is shared across jobs
//! over time, one job per project at a time. In per-job mode the pool only
//! hands the platform access token to the job and tracks nothing.
//!
//! The lease table is the only shared mutable state in the subsystem. The
//! check-for-free-slot and the assignment happen under a single lock
//! acquisition, and the lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info};

use super::config::{FactoryConfig, PoolSlot, ProvisioningMode};
use super::models::Credentials;
use crate::errors::PoolError;

enum Backing {
    Pooled(Vec<PoolSlot>),
    PerJob { access_token: String },
}

#[derive(Default)]
struct LeaseTable {
    /// job id -> position in the slot vector
    by_job: HashMap<i64, usize>,
    releases: u64,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub mode: String,
    pub capacity: usize,
    pub leased: Vec<LeaseInfo>,
    /// Number of leases actually returned (no-op releases not counted).
    pub releases: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LeaseInfo {
    pub slot: usize,
    pub job_id: i64,
}

pub struct ResourcePool {
    backing: Backing,
    leases: Mutex<LeaseTable>,
}

impl ResourcePool {
    pub fn pooled(slots: Vec<PoolSlot>) -> Self {
        Self {
            backing: Backing::Pooled(slots),
            leases: Mutex::new(LeaseTable::default()),
        }
    }

    pub fn per_job(access_token: impl Into<String>) -> Self {
        Self {
            backing: Backing::PerJob {
                access_token: access_token.into(),
            },
            leases: Mutex::new(LeaseTable::default()),
        }
    }

    pub fn from_config(config: &FactoryConfig) -> anyhow::Result<Self> {
        match config.mode {
            ProvisioningMode::Pooled => Ok(Self::pooled(config.pool_slots.clone())),
            ProvisioningMode::PerJob => {
                let token = config
                    .supabase
                    .access_token
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("Per-job mode requires an access token"))?;
                Ok(Self::per_job(token))
            }
        }
    }

    pub fn mode(&self) -> ProvisioningMode {
        match self.backing {
            Backing::Pooled(_) => ProvisioningMode::Pooled,
            Backing::PerJob { .. } => ProvisioningMode::PerJob,
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Pooled(slots) => slots.len(),
            Backing::PerJob { .. } => 0,
        }
    }

    // Every mutation leaves the table consistent, so a poisoned lock is still usable.
    fn table(&self) -> MutexGuard<'_, LeaseTable> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease credentials to a job. Never blocks: an exhausted pool fails fast.
    ///
    /// A job that already holds a lease gets the same slot back.
    pub fn acquire(&self, job_id: i64) -> Result<Credentials, PoolError> {
        let slots = match &self.backing {
            Backing::PerJob { access_token } => {
                debug!(job_id, "Per-job mode: handing off access token");
                return Ok(Credentials::PerJob {
                    access_token: access_token.clone(),
                });
            }
            Backing::Pooled(slots) => slots,
        };

        let mut table = self.table();
        if let Some(&pos) = table.by_job.get(&job_id) {
            let slot = &slots[pos];
            return Ok(Credentials::Pooled {
                slot: slot.index,
                project: slot.project.clone(),
            });
        }

        let free = (0..slots.len()).find(|pos| !table.by_job.values().any(|held| held == pos));
        match free {
            Some(pos) => {
                table.by_job.insert(job_id, pos);
                let slot = &slots[pos];
                info!(job_id, slot = slot.index, "Leased pool slot");
                Ok(Credentials::Pooled {
                    slot: slot.index,
                    project: slot.project.clone(),
                })
            }
            None => {
                debug!(job_id, capacity = slots.len(), "Pool exhausted");
                Err(PoolError::PoolExhausted {
                    capacity: slots.len(),
                })
            }
        }
    }

    /// Return a job's lease. Releasing a job with no lease is a no-op.
    pub fn release(&self, job_id: i64) {
        let Backing::Pooled(slots) = &self.backing else {
            return;
        };
        let mut table = self.table();
        if let Some(pos) = table.by_job.remove(&job_id) {
            table.releases += 1;
            info!(job_id, slot = slots[pos].index, "Released pool slot");
        }
    }

    /// The slot index a job currently holds, if any.
    pub fn slot_of(&self, job_id: i64) -> Option<usize> {
        let Backing::Pooled(slots) = &self.backing else {
            return None;
        };
        self.table().by_job.get(&job_id).map(|&pos| slots[pos].index)
    }

    pub fn status(&self) -> PoolStatus {
        let table = self.table();
        let mut leased: Vec<LeaseInfo> = match &self.backing {
            Backing::Pooled(slots) => table
                .by_job
                .iter()
                .map(|(&job_id, &pos)| LeaseInfo {
                    slot: slots[pos].index,
                    job_id,
                })
                .collect(),
            Backing::PerJob { .. } => Vec::new(),
        };
        leased.sort_by_key(|l| l.slot);
        PoolStatus {
            mode: self.mode().to_string(),
            capacity: self.capacity(),
            leased,
            releases: table.releases,
        }
    }
}
