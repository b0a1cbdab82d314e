// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence boundary. The core keeps all state in memory; durability
//! across process restarts is an external collaborator's responsibility.
//! This module defines the data shapes and trait boundary plus an
//! in-memory reference implementation used by tests.

use dashmap::DashMap;
use gantry_core::{Artifact, Job, JobId, MeteringEvent, TenantId};
use gantry_policy::PolicyLimits;
use gantry_vault::PersistedSecret;
use std::fmt;

/// Per-tenant state a backend may wish to persist.
#[derive(Debug, Clone)]
pub struct TenantPersistedState {
    /// The tenant's sealed secret records, as the vault stores them
    /// (still encrypted; see [`gantry_vault::Vault::export_secrets`]).
    pub secrets: Vec<PersistedSecret>,
    /// Rate-limit window counters, serialized opaquely by the backend.
    pub rate_state: gantry_core::RateLimitState,
    /// Cost/concurrency usage counters.
    pub usage_state: gantry_core::UsageState,
    /// Tenant-specific policy override, if one was set.
    pub policy_override: Option<PolicyLimits>,
}

/// Per-job state a backend may wish to persist.
#[derive(Debug, Clone)]
pub struct JobPersistedState {
    /// The job record itself.
    pub job: Job,
    /// The job's metering event log.
    pub events: Vec<MeteringEvent>,
    /// The job's captured artifacts.
    pub artifacts: Vec<Artifact>,
}

/// Failure persisting or loading state. The core never surfaces this as a
/// job or admission error — it is logged only, per the infrastructure-error
/// handling rule.
#[derive(Debug)]
pub struct PersistenceError(pub String);

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persistence error: {}", self.0)
    }
}

impl std::error::Error for PersistenceError {}

/// External durability boundary. The core carries no format commitment;
/// backends serialize as they wish.
pub trait PersistenceSink: Send + Sync {
    /// Persist a tenant's rate/usage/override state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to write the state.
    fn save_tenant(&self, tenant_id: &TenantId, state: &TenantPersistedState) -> Result<(), PersistenceError>;

    /// Load a previously persisted tenant state, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to read the state.
    fn load_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantPersistedState>, PersistenceError>;

    /// Persist a job's record, events, and artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to write the state.
    fn save_job(&self, state: &JobPersistedState) -> Result<(), PersistenceError>;

    /// Load a previously persisted job state, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to read the state.
    fn load_job(&self, job_id: JobId) -> Result<Option<JobPersistedState>, PersistenceError>;
}

/// In-memory reference implementation, used by tests. Not durable across
/// process restarts — it exists to exercise the trait boundary.
#[derive(Default)]
pub struct InMemoryPersistenceSink {
    tenants: DashMap<TenantId, TenantPersistedState>,
    jobs: DashMap<JobId, JobPersistedState>,
}

impl InMemoryPersistenceSink {
    /// Construct an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceSink for InMemoryPersistenceSink {
    fn save_tenant(&self, tenant_id: &TenantId, state: &TenantPersistedState) -> Result<(), PersistenceError> {
        self.tenants.insert(tenant_id.clone(), state.clone());
        Ok(())
    }

    fn load_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantPersistedState>, PersistenceError> {
        Ok(self.tenants.get(tenant_id).map(|e| e.clone()))
    }

    fn save_job(&self, state: &JobPersistedState) -> Result<(), PersistenceError> {
        self.jobs.insert(state.job.id, state.clone());
        Ok(())
    }

    fn load_job(&self, job_id: JobId) -> Result<Option<JobPersistedState>, PersistenceError> {
        Ok(self.jobs.get(&job_id).map(|e| e.clone()))
    }
}
