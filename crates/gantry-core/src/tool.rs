// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool (workflow) definitions: the typed catalog entries registered at
//! process start.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Coarse cost bucket used by dashboards and per-tier `allowed_tools` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    /// No per-call cost.
    Free,
    /// Sub-cent calls.
    Cheap,
    /// Typical third-party API calls.
    Medium,
    /// LLM-heavy or high-volume calls.
    Expensive,
}

/// Outbound network access rules for a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkPolicy {
    /// Wildcard or literal domain patterns the tool may reach. `"*"` means any.
    pub allowed_domains: BTreeSet<String>,
    /// Wildcard or literal domain patterns that are always denied, even if allowed.
    pub blocked_domains: BTreeSet<String>,
    /// Whether `localhost`/`127.0.0.1` is reachable regardless of domain lists.
    pub allow_localhost: bool,
}

impl NetworkPolicy {
    /// A permissive default: any domain, no localhost.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            allowed_domains: BTreeSet::from(["*".to_string()]),
            blocked_domains: BTreeSet::new(),
            allow_localhost: false,
        }
    }

    /// Evaluate whether `domain` is reachable under this policy.
    ///
    /// Blocked list wins; `*` in the allow list short-circuits to allowed;
    /// `*.suffix` matches the bare suffix or any subdomain of it; otherwise
    /// an exact literal match is required. Localhost requires the explicit
    /// flag regardless of the allow list.
    #[must_use]
    pub fn is_domain_allowed(&self, domain: &str) -> bool {
        if self.blocked_domains.iter().any(|p| domain_matches(p, domain)) {
            return false;
        }
        if domain == "localhost" || domain == "127.0.0.1" {
            return self.allow_localhost;
        }
        self.allowed_domains.iter().any(|p| domain_matches(p, domain))
    }
}

fn domain_matches(pattern: &str, domain: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    pattern == domain
}

/// Advisory retry metadata. The core runner never retries on a tool's
/// behalf; handlers apply this to their own outbound calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Maximum attempts, inclusive, in `[1, 10]`.
    pub max_attempts: u8,
    /// Initial backoff, in `[100, 60_000]` milliseconds.
    pub backoff_ms: u32,
    /// Backoff multiplier applied between attempts, in `[1, 4]`.
    pub multiplier: u8,
    /// Error kinds considered retryable; unrecognized kinds are never retried.
    pub retryable_kinds: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 100,
            multiplier: 1,
            retryable_kinds: BTreeSet::new(),
        }
    }
}

/// Immutable-after-registration workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolDefinition {
    /// Kebab-case identifier, unique within the registry (`^[a-z0-9-]+$`).
    pub id: String,
    /// Semver version string.
    pub version: String,
    /// Provider tags whose secrets this tool needs to run (e.g. `"dataforseo"`).
    pub required_secrets: BTreeSet<String>,
    /// Outbound network access rules.
    pub network_policy: NetworkPolicy,
    /// Coarse cost bucket.
    pub cost_class: CostClass,
    /// Non-negative estimated cost in USD, used for quota admission.
    pub estimated_cost_usd: f64,
    /// Advisory retry metadata for the handler's own outbound calls.
    pub retry_policy: RetryPolicy,
    /// Wall-clock budget in `[1_000, 600_000]` milliseconds.
    pub timeout_ms: u32,
    /// Whether re-running with the same input is safe.
    pub idempotent: bool,
}

/// Reasons a [`ToolDefinition`] fails its own structural invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDefinitionError {
    /// `id` does not match `^[a-z0-9-]+$`.
    InvalidId(String),
    /// `estimated_cost_usd` is negative.
    NegativeCost,
    /// `timeout_ms` is outside `[1_000, 600_000]`.
    TimeoutOutOfRange(u32),
    /// `retry_policy.max_attempts` is outside `[1, 10]`.
    MaxAttemptsOutOfRange(u8),
    /// `retry_policy.backoff_ms` is outside `[100, 60_000]`.
    BackoffOutOfRange(u32),
    /// `retry_policy.multiplier` is outside `[1, 4]`.
    MultiplierOutOfRange(u8),
}

impl ToolDefinition {
    /// Check the structural invariants named in the data model.
    ///
    /// Accumulates every violation rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ToolDefinitionError>> {
        let mut errors = Vec::new();

        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            errors.push(ToolDefinitionError::InvalidId(self.id.clone()));
        }
        if self.estimated_cost_usd < 0.0 {
            errors.push(ToolDefinitionError::NegativeCost);
        }
        if !(1_000..=600_000).contains(&self.timeout_ms) {
            errors.push(ToolDefinitionError::TimeoutOutOfRange(self.timeout_ms));
        }
        if !(1..=10).contains(&self.retry_policy.max_attempts) {
            errors.push(ToolDefinitionError::MaxAttemptsOutOfRange(
                self.retry_policy.max_attempts,
            ));
        }
        if !(100..=60_000).contains(&self.retry_policy.backoff_ms) {
            errors.push(ToolDefinitionError::BackoffOutOfRange(self.retry_policy.backoff_ms));
        }
        if !(1..=4).contains(&self.retry_policy.multiplier) {
            errors.push(ToolDefinitionError::MultiplierOutOfRange(
                self.retry_policy.multiplier,
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
