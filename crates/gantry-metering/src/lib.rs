// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-job, append-only cost accounting with per-step and per-job rollups.
//!
//! Per-job event logs are owned by the job and need no cross-job
//! synchronization; contention is per-job, not global (`DashMap<JobId,
//! Mutex<Vec<MeteringEvent>>>`).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_core::{EventType, JobId, MeteringEvent, TenantId};
use gantry_error::ErrorCode;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// Failure modes for building a [`MeteringTracker`]. Recording events
/// against an open job never fails: an unpriced `(provider, operation)`
/// simply costs `0.0`.
#[derive(Debug, Error)]
pub enum MeteringError {
    /// The price table has more than one entry for the same
    /// `(provider, operation)` pair, which would make the price of a
    /// recorded event depend on table iteration order.
    #[error("duplicate price table entry for {provider}/{operation}")]
    DuplicatePriceEntry {
        /// The repeated provider tag.
        provider: String,
        /// The repeated operation name.
        operation: String,
    },
    /// A price table entry carried a negative `unit_price_usd`.
    #[error("negative unit price for {provider}/{operation}: {unit_price_usd}")]
    NegativePrice {
        /// The offending provider tag.
        provider: String,
        /// The offending operation name.
        operation: String,
        /// The negative price that was rejected.
        unit_price_usd: f64,
    },
}

impl MeteringError {
    /// The stable wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigError
    }
}

fn validate_price_table(table: &[PriceTableEntry]) -> Result<(), MeteringError> {
    let mut seen = std::collections::BTreeSet::new();
    for entry in table {
        if entry.unit_price_usd < 0.0 {
            return Err(MeteringError::NegativePrice {
                provider: entry.provider.clone(),
                operation: entry.operation.clone(),
                unit_price_usd: entry.unit_price_usd,
            });
        }
        if !seen.insert((entry.provider.clone(), entry.operation.clone())) {
            return Err(MeteringError::DuplicatePriceEntry {
                provider: entry.provider.clone(),
                operation: entry.operation.clone(),
            });
        }
    }
    Ok(())
}

/// A single `(provider, operation)` price-table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTableEntry {
    /// Third-party provider tag.
    pub provider: String,
    /// Operation name, e.g. `"search"`, `"llm_tokens_input"`.
    pub operation: String,
    /// Price per unit of `quantity`, in USD.
    pub unit_price_usd: f64,
}

/// The compiled-in default price table. Overridable at [`MeteringTracker::new`].
#[must_use]
pub fn default_price_table() -> Vec<PriceTableEntry> {
    vec![
        PriceTableEntry { provider: "dataforseo".into(), operation: "search".into(), unit_price_usd: 0.002 },
        PriceTableEntry { provider: "perplexity".into(), operation: "query".into(), unit_price_usd: 0.005 },
        PriceTableEntry { provider: "openai".into(), operation: "llm_tokens_input".into(), unit_price_usd: 0.000_003 },
        PriceTableEntry { provider: "openai".into(), operation: "llm_tokens_output".into(), unit_price_usd: 0.000_015 },
    ]
}

fn lookup_price(table: &[PriceTableEntry], provider: &str, operation: &str) -> f64 {
    table
        .iter()
        .find(|e| e.provider == provider && e.operation == operation)
        .map_or(0.0, |e| e.unit_price_usd)
}

/// Per-`step_index` cost and duration rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCost {
    /// The step these events belong to.
    pub step_index: u32,
    /// Summed cost across every event in the step.
    pub total_cost_usd: f64,
    /// Summed duration across every event in the step (may exceed wall time).
    pub total_duration_ms: u64,
}

/// Whole-job cost summary.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCostSummary {
    /// Total cost across every event.
    pub total_cost_usd: f64,
    /// Summed duration across every event (may exceed wall time).
    pub total_duration_ms: u64,
    /// Cost broken down by `(provider, event_type)`.
    pub breakdown: BTreeMap<(String, EventType), f64>,
    /// The distinct step indices that recorded at least one event.
    pub step_indices: std::collections::BTreeSet<u32>,
}

/// Per-job append-only metering log with a replaceable price table.
#[derive(Debug)]
pub struct MeteringTracker {
    jobs: DashMap<JobId, Mutex<Vec<MeteringEvent>>>,
    price_table: Vec<PriceTableEntry>,
}

impl MeteringTracker {
    /// Construct a tracker with the given price table, trusting it is
    /// already well-formed (the compiled-in default always is). Use
    /// [`MeteringTracker::try_new`] for a table sourced from outside the
    /// binary.
    #[must_use]
    pub fn new(price_table: Vec<PriceTableEntry>) -> Self {
        Self {
            jobs: DashMap::new(),
            price_table,
        }
    }

    /// Construct a tracker, rejecting a price table with duplicate
    /// `(provider, operation)` entries or a negative `unit_price_usd`.
    ///
    /// # Errors
    ///
    /// Returns [`MeteringError`] if `price_table` fails validation.
    pub fn try_new(price_table: Vec<PriceTableEntry>) -> Result<Self, MeteringError> {
        validate_price_table(&price_table)?;
        Ok(Self::new(price_table))
    }

    /// Open a job's event log.
    pub fn start_job(&self, job_id: JobId) {
        self.jobs.entry(job_id).or_insert_with(|| Mutex::new(Vec::new()));
    }

    /// Append a tool-call or API-call event, pricing it from the table.
    /// Unknown `(provider, operation)` combinations cost `0.0`, never error.
    #[allow(clippy::too_many_arguments)]
    pub fn record_tool_call(
        &self,
        job_id: JobId,
        tenant_id: TenantId,
        step_index: u32,
        step_name: Option<String>,
        tool_id: Option<String>,
        event_type: EventType,
        provider: &str,
        operation: &str,
        quantity: f64,
        unit: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) {
        let cost_usd = lookup_price(&self.price_table, provider, operation) * quantity;
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let event = MeteringEvent {
            job_id,
            tenant_id,
            step_index,
            step_name,
            tool_id,
            event_type,
            provider: Some(provider.to_string()),
            quantity,
            unit: unit.into(),
            cost_usd,
            started_at,
            completed_at,
            duration_ms,
            metadata: None,
        };
        self.append(job_id, event);
    }

    /// Append an LLM token-usage event. `is_output` selects the `_input`/
    /// `_output` price-table variant.
    #[allow(clippy::too_many_arguments)]
    pub fn record_llm_tokens(
        &self,
        job_id: JobId,
        tenant_id: TenantId,
        step_index: u32,
        step_name: Option<String>,
        provider: &str,
        token_count: u64,
        is_output: bool,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) {
        let operation = if is_output { "llm_tokens_output" } else { "llm_tokens_input" };
        let cost_usd = lookup_price(&self.price_table, provider, operation) * token_count as f64;
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let event = MeteringEvent {
            job_id,
            tenant_id,
            step_index,
            step_name,
            tool_id: None,
            event_type: EventType::LlmTokens,
            provider: Some(provider.to_string()),
            quantity: token_count as f64,
            unit: "tokens".to_string(),
            cost_usd,
            started_at,
            completed_at,
            duration_ms,
            metadata: None,
        };
        self.append(job_id, event);
    }

    fn append(&self, job_id: JobId, event: MeteringEvent) {
        tracing::debug!(
            target: "gantry.metering",
            job_id = %job_id,
            provider = ?event.provider,
            cost_usd = event.cost_usd,
            "metering event recorded"
        );
        self.jobs
            .entry(job_id)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .expect("metering lock poisoned")
            .push(event);
    }

    /// Events grouped by `step_index`, each with summed cost and duration,
    /// ordered ascending by step index.
    #[must_use]
    pub fn get_step_costs(&self, job_id: JobId) -> Vec<StepCost> {
        let Some(events) = self.jobs.get(&job_id) else {
            return Vec::new();
        };
        let events = events.lock().expect("metering lock poisoned");
        let mut by_step: BTreeMap<u32, (f64, u64)> = BTreeMap::new();
        for event in events.iter() {
            let entry = by_step.entry(event.step_index).or_insert((0.0, 0));
            entry.0 += event.cost_usd;
            entry.1 += event.duration_ms;
        }
        by_step
            .into_iter()
            .map(|(step_index, (total_cost_usd, total_duration_ms))| StepCost {
                step_index,
                total_cost_usd,
                total_duration_ms,
            })
            .collect()
    }

    /// Total cost, total duration, provider/event-type breakdown, and the
    /// set of distinct step indices touched.
    #[must_use]
    pub fn get_job_cost_summary(&self, job_id: JobId) -> JobCostSummary {
        let Some(events) = self.jobs.get(&job_id) else {
            return JobCostSummary {
                total_cost_usd: 0.0,
                total_duration_ms: 0,
                breakdown: BTreeMap::new(),
                step_indices: std::collections::BTreeSet::new(),
            };
        };
        let events = events.lock().expect("metering lock poisoned");

        let mut total_cost_usd = 0.0;
        let mut total_duration_ms = 0u64;
        let mut breakdown: BTreeMap<(String, EventType), f64> = BTreeMap::new();
        let mut step_indices = std::collections::BTreeSet::new();

        for event in events.iter() {
            total_cost_usd += event.cost_usd;
            total_duration_ms += event.duration_ms;
            step_indices.insert(event.step_index);
            let provider = event.provider.clone().unwrap_or_default();
            *breakdown.entry((provider, event.event_type)).or_insert(0.0) += event.cost_usd;
        }

        JobCostSummary {
            total_cost_usd,
            total_duration_ms,
            breakdown,
            step_indices,
        }
    }

    /// Finalize and return the job's cost summary. The log remains until `clear_job`.
    #[must_use]
    pub fn complete_job(&self, job_id: JobId) -> JobCostSummary {
        let summary = self.get_job_cost_summary(job_id);
        tracing::info!(target: "gantry.metering", job_id = %job_id, total_cost_usd = summary.total_cost_usd, "job cost finalized");
        summary
    }

    /// Drop a job's event log entirely.
    pub fn clear_job(&self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }
}
