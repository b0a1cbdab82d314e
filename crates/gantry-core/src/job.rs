// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mutable job record and its lifecycle state machine.

use crate::ids::{JobId, TenantId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of log entries retained per job; oldest entries are
/// dropped once the buffer is full.
pub const LOG_BUFFER_CAPACITY: usize = 500;

/// Job lifecycle state.
///
/// ```text
/// pending ──► running ──┬──► completed
///                       ├──► failed
///                       └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet handed to a handler.
    Pending,
    /// Handler is running.
    Running,
    /// Handler returned successfully (or output validation was waived).
    Completed,
    /// Handler raised, or the deadline elapsed.
    Failed,
    /// Cancelled by the caller; handler may still be running cooperatively.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail; suppressed from artifact mirroring unless verbose.
    Debug,
    /// Normal progress narration.
    Info,
    /// Non-fatal anomaly (e.g. a method switch).
    Warn,
    /// Fatal or near-fatal condition.
    Error,
}

/// A single entry in a job's log ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    /// Monotonically assigned at append; the basis for `get_logs_since`.
    #[schemars(with = "String")]
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// The step index active when the entry was appended, if any.
    pub step: Option<u32>,
    /// Arbitrary structured payload.
    pub data: Option<serde_json::Value>,
}

/// A bounded FIFO log buffer. Appending past capacity drops the oldest entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LogBuffer(VecDeque<LogEntry>);

impl LogBuffer {
    /// Append an entry, dropping the oldest if at capacity.
    pub fn push(&mut self, entry: LogEntry) {
        if self.0.len() >= LOG_BUFFER_CAPACITY {
            self.0.pop_front();
        }
        self.0.push_back(entry);
    }

    /// Entries strictly after `since`, in insertion order.
    #[must_use]
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.0.iter().filter(|e| e.timestamp > since).cloned().collect()
    }

    /// All entries currently buffered, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<LogEntry> {
        self.0.iter().cloned().collect()
    }

    /// Number of entries currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mutable record of one workflow invocation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Runtime-generated identifier.
    pub id: JobId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The tool id this job invokes.
    pub workflow_id: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Validated (or raw) input passed to the handler.
    pub input: serde_json::Value,
    /// Output, populated once completed.
    pub output: Option<serde_json::Value>,
    /// Error message, populated once failed.
    pub error: Option<String>,
    /// Current step index, monotone non-decreasing, owned by the handler.
    pub current_step: u32,
    /// Total step count, if known in advance.
    pub total_steps: Option<u32>,
    /// Human-readable name of the current step.
    pub step_name: Option<String>,
    /// Bounded log ring buffer.
    pub logs: LogBuffer,
    /// Late-bound method override, set by `switch_method`.
    pub current_method: Option<String>,
    /// Creation time.
    #[schemars(with = "String")]
    pub created_at: DateTime<Utc>,
    /// When the handler started, if it has.
    #[schemars(with = "String")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state, if it has.
    #[schemars(with = "String")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Estimated cost at admission time.
    pub estimated_cost_usd: f64,
    /// Actual accrued cost, finalized at completion.
    pub actual_cost_usd: f64,
    /// The job this one replays from, if any.
    pub parent_job_id: Option<JobId>,
    /// The step index replay should resume from, if any.
    pub replay_from_step: Option<u32>,
}

impl Job {
    /// Construct a freshly admitted job in `pending` state.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        workflow_id: impl Into<String>,
        input: serde_json::Value,
        estimated_cost_usd: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            workflow_id: workflow_id.into(),
            status: JobStatus::Pending,
            input,
            output: None,
            error: None,
            current_step: 0,
            total_steps: None,
            step_name: None,
            logs: LogBuffer::default(),
            current_method: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_cost_usd,
            actual_cost_usd: 0.0,
            parent_job_id: None,
            replay_from_step: None,
        }
    }

    /// `pending -> running`, exactly once. Returns `false` if already past pending.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        true
    }

    /// Transition to a terminal state. No-op (returns `false`) if already terminal.
    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal(), "finish() requires a terminal status");
        self.status = status;
        self.completed_at = Some(now);
        true
    }

    /// Append a log entry, respecting the bounded FIFO discipline.
    pub fn log(&mut self, now: DateTime<Utc>, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.logs.push(LogEntry {
            timestamp: now,
            level,
            message: message.into(),
            step: Some(self.current_step),
            data,
        });
    }
}
