// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler-facing facade over logging, secrets, metering, cancellation, and
//! method-switch notification for a single job.

use crate::cancel::CancellationToken;
use chrono::Utc;
use gantry_artifact::ArtifactStore;
use gantry_core::{ArtifactKind, EventType, JobId, LogLevel, TenantId};
use gantry_metering::MeteringTracker;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A runner-initiated request for a handler to switch its execution method.
#[derive(Debug, Clone)]
pub struct MethodSwitch {
    /// The new method the handler is asked to adopt.
    pub method: String,
    /// Why the switch was requested.
    pub reason: String,
}

/// Per-job handle given to a workflow handler. Logging appends to the
/// job's ring buffer and, unless suppressed, mirrors to an artifact;
/// metering shortcuts write through to the shared tracker; cancellation
/// and method-switch notification are cooperative, never forced.
pub struct StepContext {
    job_id: JobId,
    tenant_id: TenantId,
    tool_id: String,
    secrets: HashMap<String, String>,
    job: Arc<Mutex<gantry_core::Job>>,
    metering: Arc<MeteringTracker>,
    artifacts: Arc<ArtifactStore>,
    cancellation: CancellationToken,
    method_switch_rx: Mutex<Option<mpsc::Receiver<MethodSwitch>>>,
    artifact_verbose: bool,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: JobId,
        tenant_id: TenantId,
        tool_id: String,
        secrets: HashMap<String, String>,
        job: Arc<Mutex<gantry_core::Job>>,
        metering: Arc<MeteringTracker>,
        artifacts: Arc<ArtifactStore>,
        cancellation: CancellationToken,
        method_switch_rx: mpsc::Receiver<MethodSwitch>,
        artifact_verbose: bool,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            tool_id,
            secrets,
            job,
            metering,
            artifacts,
            cancellation,
            method_switch_rx: Mutex::new(Some(method_switch_rx)),
            artifact_verbose,
        }
    }

    /// The owning job's identifier.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// The tool id this job invokes.
    #[must_use]
    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    /// The job's current step index, owned and advanced by the handler.
    #[must_use]
    pub fn step_index(&self) -> u32 {
        self.job.lock().expect("job lock poisoned").current_step
    }

    /// The job's current step name, if set.
    #[must_use]
    pub fn step_name(&self) -> Option<String> {
        self.job.lock().expect("job lock poisoned").step_name.clone()
    }

    /// Immutable snapshot of hydrated secrets, keyed by provider.
    #[must_use]
    pub fn secrets(&self) -> &HashMap<String, String> {
        &self.secrets
    }

    /// Append a log entry to the job's ring buffer. Unless `level` is
    /// `debug` and verbose artifact mirroring is disabled, the entry is
    /// also captured as a `log` artifact.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        let message = message.into();
        let now = Utc::now();
        let step_index = {
            let mut job = self.job.lock().expect("job lock poisoned");
            job.log(now, level, message.clone(), data);
            job.current_step
        };

        let mirror = !(matches!(level, LogLevel::Debug) && !self.artifact_verbose);
        if mirror {
            let result = self.artifacts.capture(
                self.job_id,
                step_index,
                self.step_name(),
                ArtifactKind::Log,
                "text/plain",
                message.into_bytes(),
                &[],
            );
            if let Err(e) = result {
                tracing::warn!(target: "gantry.runtime", job_id = %self.job_id, error = %e, "log artifact mirroring failed");
            }
        }
    }

    /// Shortcut for recording an outbound API call against the job's
    /// metering log at the current step.
    pub fn record_api_call(&self, provider: &str, operation: &str, quantity: f64) {
        let now = Utc::now();
        let step_index = self.step_index();
        self.metering.record_tool_call(
            self.job_id,
            self.tenant_id.clone(),
            step_index,
            self.step_name(),
            Some(self.tool_id.clone()),
            EventType::ApiCall,
            provider,
            operation,
            quantity,
            "calls",
            now,
            now,
        );
    }

    /// A clone of the job's cooperative cancellation token. Handlers are
    /// expected to check this at suspension points instead of polling job
    /// status.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Take the receiving half of the per-job method-switch channel.
    /// Returns `None` if already taken — this channel is single-consumer.
    pub fn method_switch_channel(&self) -> Option<mpsc::Receiver<MethodSwitch>> {
        self.method_switch_rx.lock().expect("method-switch lock poisoned").take()
    }

    /// Advance the visible progress counter. Write-only from the handler's
    /// perspective; the runner never sets this field itself after job
    /// creation.
    pub fn update_step(&self, step_index: u32, step_name: Option<String>, total_steps: Option<u32>) {
        let mut job = self.job.lock().expect("job lock poisoned");
        job.current_step = step_index;
        job.step_name = step_name;
        if let Some(total) = total_steps {
            job.total_steps = Some(total);
        }
    }
}
