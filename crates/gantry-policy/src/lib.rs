// SPDX-License-Identifier: MIT OR Apache-2.0
//! Admission control for the gantry runtime.
//!
//! Per-tenant state (rate windows, usage, concurrency) lives behind a
//! sharded concurrent map so admission-check contention is per-tenant, not
//! global: a `DashMap` shard's own lock guards one tenant's counters, and
//! unrelated tenants proceed without contending on each other.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_core::{RateLimitState, TenantId, Tier, UsageState};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Whether a tier or tenant override permits `*` (any tool) or only an
/// explicit allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedTools {
    /// Any tool not explicitly blocked is admitted.
    Any,
    /// Only tools named here are admitted.
    Explicit(BTreeSet<String>),
}

/// Per-tier (or per-tenant override) admission limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyLimits {
    /// Requests admitted per rolling 60-second window.
    pub reqs_per_minute: u32,
    /// Requests admitted per rolling 3600-second window.
    pub reqs_per_hour: u32,
    /// Requests admitted per rolling 86400-second window.
    pub reqs_per_day: u32,
    /// Maximum estimated cost for a single job.
    pub max_cost_per_job_usd: f64,
    /// Maximum accrued cost per rolling day.
    pub max_cost_per_day_usd: f64,
    /// Maximum accrued cost per calendar month.
    pub max_cost_per_month_usd: f64,
    /// Maximum simultaneously running jobs.
    pub max_concurrent_jobs: u32,
    /// Maximum wall-clock budget for a single job.
    pub max_job_duration_ms: u64,
    /// Tools admitted by default.
    pub allowed_tools: AllowedTools,
    /// Tools always denied, regardless of `allowed_tools`.
    pub blocked_tools: BTreeSet<String>,
}

/// The tier-indexed default limits named in the admission-control table.
#[must_use]
pub fn tier_defaults(tier: Tier) -> PolicyLimits {
    match tier {
        Tier::Free => PolicyLimits {
            reqs_per_minute: 5,
            reqs_per_hour: 20,
            reqs_per_day: 50,
            max_cost_per_job_usd: 0.50,
            max_cost_per_day_usd: 2.00,
            max_cost_per_month_usd: 10.00,
            max_concurrent_jobs: 1,
            max_job_duration_ms: 60_000,
            allowed_tools: AllowedTools::Explicit(BTreeSet::new()),
            blocked_tools: BTreeSet::new(),
        },
        Tier::Starter => PolicyLimits {
            reqs_per_minute: 20,
            reqs_per_hour: 100,
            reqs_per_day: 500,
            max_cost_per_job_usd: 2.00,
            max_cost_per_day_usd: 20.00,
            max_cost_per_month_usd: 100.00,
            max_concurrent_jobs: 3,
            max_job_duration_ms: 300_000,
            allowed_tools: AllowedTools::Any,
            blocked_tools: BTreeSet::new(),
        },
        Tier::Pro => PolicyLimits {
            reqs_per_minute: 60,
            reqs_per_hour: 500,
            reqs_per_day: 2_000,
            max_cost_per_job_usd: 10.00,
            max_cost_per_day_usd: 100.00,
            max_cost_per_month_usd: 500.00,
            max_concurrent_jobs: 10,
            max_job_duration_ms: 600_000,
            allowed_tools: AllowedTools::Any,
            blocked_tools: BTreeSet::new(),
        },
        Tier::Enterprise => PolicyLimits {
            reqs_per_minute: 200,
            reqs_per_hour: 2_000,
            reqs_per_day: 10_000,
            max_cost_per_job_usd: 100.00,
            max_cost_per_day_usd: 1_000.00,
            max_cost_per_month_usd: 10_000.00,
            max_concurrent_jobs: 50,
            max_job_duration_ms: 1_800_000,
            allowed_tools: AllowedTools::Any,
            blocked_tools: BTreeSet::new(),
        },
    }
}

/// Why `check_request` rejected a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    /// Human-readable reason.
    pub reason: String,
    /// Milliseconds the caller should wait before retrying, if known.
    pub retry_after_ms: Option<u64>,
}

impl Denial {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after_ms: None,
        }
    }

    fn with_retry_after(reason: impl Into<String>, retry_after_ms: i64) -> Self {
        Self {
            reason: reason.into(),
            retry_after_ms: Some(retry_after_ms.max(0) as u64),
        }
    }
}

impl Denial {
    /// Bridge to the unified wire error taxonomy. Every denial maps to
    /// `PolicyDenied`; `reason` and `retry_after_ms` carry the detail.
    #[must_use]
    pub fn code(&self) -> gantry_error::ErrorCode {
        gantry_error::ErrorCode::PolicyDenied
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for Denial {}

struct TenantRecord {
    rate: RateLimitState,
    usage: UsageState,
    override_limits: Option<PolicyLimits>,
}

impl TenantRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            rate: RateLimitState::starting_at(now),
            usage: UsageState::starting_at(now),
            override_limits: None,
        }
    }
}

/// Sharded, per-tenant admission-control engine.
#[derive(Default)]
pub struct PolicyEngine {
    tenants: DashMap<TenantId, Mutex<TenantRecord>>,
}

impl PolicyEngine {
    /// Construct an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace this tenant's limits wholesale with a custom override.
    pub fn set_policy(&self, tenant: &TenantId, limits: PolicyLimits, now: DateTime<Utc>) {
        let entry = self.tenants.entry(tenant.clone()).or_insert_with(|| Mutex::new(TenantRecord::new(now)));
        entry.lock().expect("policy lock poisoned").override_limits = Some(limits);
    }

    /// Return this tenant's effective limits: the override if set, else the tier default.
    #[must_use]
    pub fn get_policy(&self, tenant: &TenantId, tier: Tier) -> PolicyLimits {
        self.tenants
            .get(tenant)
            .and_then(|entry| entry.lock().expect("policy lock poisoned").override_limits.clone())
            .unwrap_or_else(|| tier_defaults(tier))
    }

    /// Current usage snapshot for a tenant, if any requests have been made.
    #[must_use]
    pub fn get_usage(&self, tenant: &TenantId) -> Option<UsageState> {
        self.tenants.get(tenant).map(|entry| entry.lock().expect("policy lock poisoned").usage)
    }

    /// Admission check, in order; the first failure short-circuits and no
    /// counter is incremented. On success, all three rate counters are
    /// incremented atomically for this tenant.
    pub fn check_request(
        &self,
        tenant: &TenantId,
        tool_id: &str,
        estimated_cost_usd: f64,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        let entry = self.tenants.entry(tenant.clone()).or_insert_with(|| Mutex::new(TenantRecord::new(now)));
        let mut record = entry.lock().expect("policy lock poisoned");

        let limits = record.override_limits.clone().unwrap_or_else(|| tier_defaults(tier));

        let deny = |denial: Denial| {
            tracing::warn!(target: "gantry.policy", tenant_id = %tenant, tool_id, reason = %denial.reason, "admission denied");
            denial
        };

        if limits.blocked_tools.contains(tool_id) {
            return Err(deny(Denial::new(format!("tool '{tool_id}' is blocked"))));
        }
        if let AllowedTools::Explicit(allowed) = &limits.allowed_tools {
            if !allowed.contains(tool_id) {
                return Err(deny(Denial::new(format!("tool '{tool_id}' is not in the allowed set"))));
            }
        }

        record.rate.roll_forward(now);

        if record.rate.minute.count >= limits.reqs_per_minute {
            let retry_after = (record.rate.minute.reset_at - now).num_milliseconds();
            return Err(deny(Denial::with_retry_after("per-minute rate limit exceeded", retry_after)));
        }
        if record.rate.hour.count >= limits.reqs_per_hour {
            let retry_after = (record.rate.hour.reset_at - now).num_milliseconds();
            return Err(deny(Denial::with_retry_after("per-hour rate limit exceeded", retry_after)));
        }
        if record.rate.day.count >= limits.reqs_per_day {
            let retry_after = (record.rate.day.reset_at - now).num_milliseconds();
            return Err(deny(Denial::with_retry_after("per-day rate limit exceeded", retry_after)));
        }

        if estimated_cost_usd > limits.max_cost_per_job_usd {
            return Err(deny(Denial::new("per-job cost ceiling exceeded")));
        }
        roll_usage_windows(&mut record.usage, now);
        if record.usage.day_cost_usd + estimated_cost_usd > limits.max_cost_per_day_usd {
            let retry_after = (record.usage.day_reset_at - now).num_milliseconds();
            return Err(deny(Denial::with_retry_after("Daily quota exceeded", retry_after)));
        }
        if record.usage.month_cost_usd + estimated_cost_usd > limits.max_cost_per_month_usd {
            let retry_after = (record.usage.month_reset_at - now).num_milliseconds();
            return Err(deny(Denial::with_retry_after("monthly quota exceeded", retry_after)));
        }

        if record.usage.concurrent_jobs >= limits.max_concurrent_jobs {
            return Err(deny(Denial::new("concurrency limit exceeded")));
        }

        record.rate.minute.count += 1;
        record.rate.hour.count += 1;
        record.rate.day.count += 1;

        Ok(())
    }

    /// Record that an admitted job actually started running: increments
    /// `concurrent_jobs`. Separate from `check_request` so dry-runs don't
    /// consume a concurrency slot.
    pub fn job_started(&self, tenant: &TenantId, now: DateTime<Utc>) {
        let entry = self.tenants.entry(tenant.clone()).or_insert_with(|| Mutex::new(TenantRecord::new(now)));
        entry.lock().expect("policy lock poisoned").usage.concurrent_jobs += 1;
    }

    /// Record job completion: decrements `concurrent_jobs` (floored at
    /// zero) and adds `actual_cost_usd` to both day and month totals.
    pub fn job_completed(&self, tenant: &TenantId, actual_cost_usd: f64, now: DateTime<Utc>) {
        let entry = self.tenants.entry(tenant.clone()).or_insert_with(|| Mutex::new(TenantRecord::new(now)));
        let mut record = entry.lock().expect("policy lock poisoned");
        tracing::info!(target: "gantry.policy", tenant_id = %tenant, actual_cost_usd, "job completed");
        record.usage.concurrent_jobs = record.usage.concurrent_jobs.saturating_sub(1);
        roll_usage_windows(&mut record.usage, now);
        record.usage.day_cost_usd += actual_cost_usd;
        record.usage.month_cost_usd += actual_cost_usd;
    }
}

/// Roll the day/month cost windows forward if their reset instant has passed.
fn roll_usage_windows(usage: &mut UsageState, now: DateTime<Utc>) {
    if now >= usage.day_reset_at {
        usage.day_cost_usd = 0.0;
        usage.day_reset_at = now + chrono::Duration::seconds(86_400);
    }
    if now >= usage.month_reset_at {
        usage.month_cost_usd = 0.0;
        usage.month_reset_at = gantry_core::UsageState::starting_at(now).month_reset_at;
    }
}
