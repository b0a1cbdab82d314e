// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-job, append-only cost accounting events.

use crate::ids::{JobId, TenantId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The kind of billable activity a [`MeteringEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A handler-initiated tool invocation.
    ToolCall,
    /// An outbound third-party API call.
    ApiCall,
    /// LLM token consumption; `quantity` is token count.
    LlmTokens,
    /// Network bandwidth consumption.
    Bandwidth,
    /// Artifact/object storage consumption.
    Storage,
}

/// One append-only cost event within a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MeteringEvent {
    /// Owning job.
    pub job_id: JobId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Step index active when the event was recorded.
    pub step_index: u32,
    /// Human-readable step name.
    pub step_name: Option<String>,
    /// The tool id that triggered this event, if applicable.
    pub tool_id: Option<String>,
    /// Kind of activity.
    pub event_type: EventType,
    /// Third-party provider, if applicable (e.g. `"openai"`).
    pub provider: Option<String>,
    /// Quantity in the event's natural unit (tokens, bytes, requests).
    pub quantity: f64,
    /// Unit string (e.g. `"tokens"`, `"requests"`, `"bytes"`).
    pub unit: String,
    /// Cost in USD, looked up from the price table; `0.0` for unknown combinations.
    pub cost_usd: f64,
    /// When the underlying operation started.
    #[schemars(with = "String")]
    pub started_at: DateTime<Utc>,
    /// When the underlying operation completed.
    #[schemars(with = "String")]
    pub completed_at: DateTime<Utc>,
    /// Duration in milliseconds, derived from `started_at`/`completed_at`.
    pub duration_ms: u64,
    /// Arbitrary structured metadata.
    pub metadata: Option<serde_json::Value>,
}
