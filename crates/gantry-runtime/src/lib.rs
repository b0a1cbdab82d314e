// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution runner: job lifecycle, admission, secret hydration,
//! deadline-enforced handler invocation, and post-run accounting.
//!
//! A [`Runtime`] owns no state that needs cross-request locking beyond the
//! per-job entries in its concurrent maps; registry, vault, policy, and
//! metering are themselves internally sharded. `execute` is a long-lived
//! async call expected to be spawned by the caller and polled for via
//! [`Runtime::get_job`] — it returns `Err` only for pre-job-creation
//! admission failures, never for a failure that happens after a job exists.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cooperative per-job cancellation signal.
pub mod cancel;
/// Handler-facing facade and the method-switch request type.
pub mod context;
/// The workflow handler trait.
pub mod handler;
/// External durability boundary.
pub mod persistence;
/// Fire-and-forget job-completion notification.
pub mod webhook;

pub use cancel::CancellationToken;
pub use context::{MethodSwitch, StepContext};
pub use handler::{HandlerError, WorkflowHandler};
pub use persistence::{InMemoryPersistenceSink, JobPersistedState, PersistenceError, PersistenceSink, TenantPersistedState};
pub use webhook::{NoopWebhookSink, WebhookSink};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_artifact::ArtifactStore;
use gantry_config::GantryConfig;
use gantry_core::{ArtifactKind, Job, JobId, JobStatus, LogEntry, LogLevel, TenantId, Tier, ToolDefinition};
use gantry_error::ErrorCode;
use gantry_metering::MeteringTracker;
use gantry_policy::{Denial, PolicyEngine};
use gantry_registry::{FieldError, ToolRegistry};
use gantry_vault::Vault;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-`execute` call parameters that do not belong on the tool definition
/// itself: who is calling, at what tier, and how secrets should be unlocked.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// The calling tenant.
    pub tenant_id: TenantId,
    /// Subscription tier, used for admission-control defaults.
    pub tier: Tier,
    /// If set, admission and job creation run normally but the handler is
    /// never invoked; the job completes immediately with a dry-run marker.
    pub dry_run: bool,
    /// A caller-supplied master key, used directly for secret retrieval.
    pub master_key: Option<[u8; 32]>,
    /// A vault session token, unlocked to a master key at hydration time.
    /// Ignored if `master_key` is also set.
    pub session_token: Option<String>,
    /// Set by [`Runtime::replay`]; otherwise left `None`.
    pub parent_job_id: Option<JobId>,
    /// Set by [`Runtime::replay`]; otherwise left `None`.
    pub replay_from_step: Option<u32>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            tenant_id: TenantId::from(""),
            tier: Tier::Free,
            dry_run: false,
            master_key: None,
            session_token: None,
            parent_job_id: None,
            replay_from_step: None,
        }
    }
}

/// Errors returned by [`Runtime::execute`] and [`Runtime::replay`] before a
/// job is created. Every failure after this point is recorded on the job
/// itself; `execute` still returns `Ok`.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// No tool definition or handler is registered under this id.
    #[error("unknown workflow '{workflow_id}'")]
    UnknownWorkflow {
        /// The requested workflow id.
        workflow_id: String,
    },
    /// Input failed the tool's registered schema.
    #[error("input validation failed: {0:?}")]
    ValidationError(Vec<FieldError>),
    /// The policy engine denied admission.
    #[error("policy denied: {0}")]
    PolicyDenied(Denial),
    /// [`Runtime::replay`] was given a job id with no matching record.
    #[error("job '{job_id}' not found")]
    JobNotFound {
        /// The requested job id.
        job_id: JobId,
    },
}

impl RunnerError {
    /// Bridge to the unified wire error taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownWorkflow { .. } => ErrorCode::UnknownWorkflow,
            Self::ValidationError(_) => ErrorCode::ValidationError,
            Self::PolicyDenied(_) => ErrorCode::PolicyDenied,
            Self::JobNotFound { .. } => ErrorCode::JobNotFound,
        }
    }
}

enum HandlerOutcome {
    Returned(Result<serde_json::Value, HandlerError>),
    TimedOut,
    Cancelled,
}

/// The execution runner. Cheap to clone behind an `Arc`; every field is
/// itself a shared, internally-synchronized collaborator.
pub struct Runtime {
    registry: Arc<ToolRegistry>,
    vault: Arc<Vault>,
    policy: Arc<PolicyEngine>,
    metering: Arc<MeteringTracker>,
    artifacts: Arc<ArtifactStore>,
    config: Arc<GantryConfig>,
    webhook: Arc<dyn WebhookSink>,
    jobs: DashMap<JobId, Arc<Mutex<Job>>>,
    tenant_jobs: DashMap<TenantId, Mutex<Vec<JobId>>>,
    cancellations: DashMap<JobId, CancellationToken>,
    method_switches: DashMap<JobId, mpsc::Sender<MethodSwitch>>,
    handlers: RwLock<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl Runtime {
    /// Construct a runner over its subsystem collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        vault: Arc<Vault>,
        policy: Arc<PolicyEngine>,
        metering: Arc<MeteringTracker>,
        artifacts: Arc<ArtifactStore>,
        config: Arc<GantryConfig>,
        webhook: Arc<dyn WebhookSink>,
    ) -> Self {
        Self {
            registry,
            vault,
            policy,
            metering,
            artifacts,
            config,
            webhook,
            jobs: DashMap::new(),
            tenant_jobs: DashMap::new(),
            cancellations: DashMap::new(),
            method_switches: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a workflow handler under `workflow_id`. A tool definition
    /// must also be registered in the [`ToolRegistry`] under the same id for
    /// `execute` to admit jobs against it.
    pub fn register_workflow(&self, workflow_id: impl Into<String>, handler: Arc<dyn WorkflowHandler>) {
        self.handlers.write().expect("handler lock poisoned").insert(workflow_id.into(), handler);
    }

    /// Run the full admission-through-completion protocol for one job.
    ///
    /// # Errors
    ///
    /// Returns `Err` only for failures that occur before a job record
    /// exists: unknown workflow, input validation, or policy denial. Every
    /// later failure (missing secrets, handler error, deadline, cancellation)
    /// is recorded on the returned job instead.
    pub async fn execute(&self, workflow_id: &str, input: serde_json::Value, options: ExecuteOptions) -> Result<Job, RunnerError> {
        let now = Utc::now();

        let tool = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| RunnerError::UnknownWorkflow { workflow_id: workflow_id.to_string() })?;
        let handler = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownWorkflow { workflow_id: workflow_id.to_string() })?;

        let validated_input = self.registry.validate_input(workflow_id, &input).map_err(RunnerError::ValidationError)?;

        self.policy
            .check_request(&options.tenant_id, workflow_id, tool.estimated_cost_usd, options.tier, now)
            .map_err(RunnerError::PolicyDenied)?;

        let mut job = Job::new(options.tenant_id.clone(), workflow_id, validated_input.clone(), tool.estimated_cost_usd, now);
        job.parent_job_id = options.parent_job_id;
        job.replay_from_step = options.replay_from_step;
        if let Some(step) = options.replay_from_step {
            job.current_step = step;
        }
        let job_id = job.id;
        let job = Arc::new(Mutex::new(job));
        self.jobs.insert(job_id, job.clone());
        self.tenant_jobs
            .entry(options.tenant_id.clone())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .expect("tenant index lock poisoned")
            .push(job_id);

        let cancellation = CancellationToken::new();
        self.cancellations.insert(job_id, cancellation.clone());

        if options.dry_run {
            let mut j = job.lock().expect("job lock poisoned");
            j.output = Some(serde_json::json!({ "dry_run": true }));
            j.finish(JobStatus::Completed, Utc::now());
            let snapshot = j.clone();
            drop(j);
            self.cancellations.remove(&job_id);
            self.dispatch_webhook(snapshot.clone());
            return Ok(snapshot);
        }

        let secrets = match self.hydrate_secrets(&tool, &options, now).await {
            Ok(secrets) => secrets,
            Err((code, message)) => {
                self.capture_error_artifact(job_id, &job, &message);
                let mut j = job.lock().expect("job lock poisoned");
                j.error = Some(format!("[{code}] {message}"));
                j.finish(JobStatus::Failed, Utc::now());
                let snapshot = j.clone();
                drop(j);
                self.cancellations.remove(&job_id);
                self.dispatch_webhook(snapshot.clone());
                return Ok(snapshot);
            }
        };

        if cancellation.is_cancelled() {
            let mut j = job.lock().expect("job lock poisoned");
            j.finish(JobStatus::Cancelled, Utc::now());
            let snapshot = j.clone();
            drop(j);
            self.cancellations.remove(&job_id);
            self.dispatch_webhook(snapshot.clone());
            return Ok(snapshot);
        }

        {
            let mut j = job.lock().expect("job lock poisoned");
            j.start(now);
        }
        self.policy.job_started(&options.tenant_id, now);
        self.metering.start_job(job_id);

        let (switch_tx, switch_rx) = mpsc::channel(8);
        self.method_switches.insert(job_id, switch_tx);

        let ctx = StepContext::new(
            job_id,
            options.tenant_id.clone(),
            tool.id.clone(),
            secrets,
            job.clone(),
            self.metering.clone(),
            self.artifacts.clone(),
            cancellation.clone(),
            switch_rx,
            self.config.artifact_verbose,
        );

        let policy_limits = self.policy.get_policy(&options.tenant_id, options.tier);
        let deadline_ms = u64::from(tool.timeout_ms).min(policy_limits.max_job_duration_ms);

        let outcome = {
            let handler_fut = handler.call(&ctx, input);
            tokio::pin!(handler_fut);
            tokio::select! {
                res = &mut handler_fut => HandlerOutcome::Returned(res),
                () = tokio::time::sleep(Duration::from_millis(deadline_ms)) => HandlerOutcome::TimedOut,
                () = cancellation.cancelled() => HandlerOutcome::Cancelled,
            }
        };
        drop(ctx);

        self.method_switches.remove(&job_id);
        self.cancellations.remove(&job_id);

        let finished_at = Utc::now();
        match outcome {
            HandlerOutcome::Returned(Ok(output)) => {
                if let Err(field_errors) = self.registry.validate_output(workflow_id, &output) {
                    let mut j = job.lock().expect("job lock poisoned");
                    let messages: Vec<String> = field_errors.iter().map(|e| e.message.clone()).collect();
                    j.log(finished_at, LogLevel::Warn, "output failed schema validation", Some(serde_json::json!({ "errors": messages })));
                }
                let summary = self.metering.complete_job(job_id);
                let mut j = job.lock().expect("job lock poisoned");
                j.output = Some(output);
                j.actual_cost_usd = summary.total_cost_usd;
                j.finish(JobStatus::Completed, finished_at);
            }
            HandlerOutcome::Returned(Err(handler_err)) => {
                self.capture_error_artifact(job_id, &job, &handler_err.message);
                let summary = self.metering.complete_job(job_id);
                let mut j = job.lock().expect("job lock poisoned");
                j.actual_cost_usd = summary.total_cost_usd;
                j.error = Some(handler_err.message);
                j.finish(JobStatus::Failed, finished_at);
            }
            HandlerOutcome::TimedOut => {
                self.capture_error_artifact(job_id, &job, "deadline exceeded");
                let summary = self.metering.complete_job(job_id);
                let mut j = job.lock().expect("job lock poisoned");
                j.actual_cost_usd = summary.total_cost_usd;
                j.error = Some("deadline exceeded".to_string());
                j.finish(JobStatus::Failed, finished_at);
            }
            HandlerOutcome::Cancelled => {
                let summary = self.metering.complete_job(job_id);
                let mut j = job.lock().expect("job lock poisoned");
                j.actual_cost_usd = summary.total_cost_usd;
                j.finish(JobStatus::Cancelled, finished_at);
            }
        }

        let (actual_cost, snapshot) = {
            let j = job.lock().expect("job lock poisoned");
            (j.actual_cost_usd, j.clone())
        };
        self.policy.job_completed(&options.tenant_id, actual_cost, finished_at);
        self.dispatch_webhook(snapshot.clone());

        Ok(snapshot)
    }

    /// Re-run a previously created job's workflow and input from a given
    /// step. The replay is a fresh job: `parent_job_id` points back at
    /// `job_id` and `replay_from_step` records where it resumed.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::JobNotFound`] if `job_id` has no record, or
    /// any error `execute` itself can return.
    pub async fn replay(&self, job_id: JobId, from_step: u32, mut options: ExecuteOptions) -> Result<Job, RunnerError> {
        let parent = self.get_job(job_id).ok_or(RunnerError::JobNotFound { job_id })?;
        options.tenant_id = parent.tenant_id.clone();
        options.parent_job_id = Some(job_id);
        options.replay_from_step = Some(from_step);
        self.execute(&parent.workflow_id, parent.input.clone(), options).await
    }

    /// Fetch a snapshot of a job's current state.
    #[must_use]
    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|j| j.lock().expect("job lock poisoned").clone())
    }

    /// List a tenant's jobs, most recently created first.
    #[must_use]
    pub fn list_jobs(&self, tenant_id: &TenantId, limit: usize) -> Vec<Job> {
        let Some(ids) = self.tenant_jobs.get(tenant_id) else {
            return Vec::new();
        };
        let ids = ids.lock().expect("tenant index lock poisoned").clone();
        let mut jobs: Vec<Job> = ids.iter().filter_map(|id| self.get_job(*id)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Request cancellation of a running job. Cooperative: the handler
    /// notices at its next suspension point, or the runner's own deadline
    /// race notices immediately if the handler hasn't started. Returns
    /// `false` if the job doesn't exist or has already reached a terminal state.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let Some(token) = self.cancellations.get(&job_id) else {
            return false;
        };
        token.cancel();
        true
    }

    /// Request a running handler to switch execution method. Returns
    /// `false` if the job has no open method-switch channel (not running,
    /// or the handler never took the receiver).
    pub fn switch_method(&self, job_id: JobId, method: impl Into<String>, reason: impl Into<String>) -> bool {
        let method = method.into();
        let reason = reason.into();
        let Some(tx) = self.method_switches.get(&job_id) else {
            return false;
        };
        let sent = tx.try_send(MethodSwitch { method: method.clone(), reason: reason.clone() }).is_ok();
        if sent {
            if let Some(job) = self.jobs.get(&job_id) {
                let mut j = job.lock().expect("job lock poisoned");
                j.current_method = Some(method.clone());
                j.log(Utc::now(), LogLevel::Warn, format!("method switch requested: {method} ({reason})"), None);
            }
        }
        sent
    }

    /// Log entries appended strictly after `since`.
    #[must_use]
    pub fn get_logs_since(&self, job_id: JobId, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.jobs.get(&job_id).map(|j| j.lock().expect("job lock poisoned").logs.since(since)).unwrap_or_default()
    }

    async fn hydrate_secrets(&self, tool: &ToolDefinition, options: &ExecuteOptions, now: DateTime<Utc>) -> Result<HashMap<String, String>, (ErrorCode, String)> {
        let master_key = if let Some(mk) = options.master_key {
            Some(mk)
        } else if let Some(token) = &options.session_token {
            match self.vault.unlock_with_session(&options.tenant_id, token, now) {
                Ok(key) => Some(key),
                Err(e) => return Err((e.code(), e.to_string())),
            }
        } else {
            None
        };

        let mut secrets = HashMap::new();
        for provider in &tool.required_secrets {
            let mut value = None;
            if let Some(mk) = &master_key {
                match self.vault.retrieve(&options.tenant_id, provider, mk, &tool.id, now) {
                    Ok(Some(plaintext)) => value = Some(String::from_utf8_lossy(&plaintext).into_owned()),
                    Ok(None) => {}
                    Err(e) => return Err((e.code(), e.to_string())),
                }
            }
            if value.is_none() {
                let env_key = format!("{}_API_KEY", provider.to_uppercase());
                if let Ok(v) = std::env::var(&env_key) {
                    value = Some(v);
                }
            }
            match value {
                Some(v) => {
                    secrets.insert(provider.clone(), v);
                }
                None if master_key.is_some() => {
                    return Err((ErrorCode::MissingSecrets, format!("missing secret for provider '{provider}'")));
                }
                None => {}
            }
        }
        Ok(secrets)
    }

    fn capture_error_artifact(&self, job_id: JobId, job: &Arc<Mutex<Job>>, message: &str) {
        let step_index = job.lock().expect("job lock poisoned").current_step;
        if let Err(e) = self.artifacts.capture(job_id, step_index, None, ArtifactKind::Error, "text/plain", message.as_bytes().to_vec(), &[]) {
            tracing::warn!(target: "gantry.runtime", job_id = %job_id, error = %e, "failed to capture error artifact");
        }
    }

    fn dispatch_webhook(&self, job: Job) {
        let webhook = self.webhook.clone();
        tokio::spawn(async move {
            webhook.notify(&job).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_core::{CostClass, NetworkPolicy, RetryPolicy};
    use gantry_registry::Schema;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct EchoHandler;

    #[async_trait]
    impl WorkflowHandler for EchoHandler {
        async fn call(&self, _ctx: &StepContext, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            Ok(input)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl WorkflowHandler for FailingHandler {
        async fn call(&self, _ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            Err(HandlerError::new("boom"))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl WorkflowHandler for SlowHandler {
        async fn call(&self, _ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    struct CancelAwareHandler;

    #[async_trait]
    impl WorkflowHandler for CancelAwareHandler {
        async fn call(&self, ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
            ctx.cancellation_token().cancelled().await;
            Ok(json!({}))
        }
    }

    struct NoopSchema;
    impl Schema for NoopSchema {
        fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
            Ok(value.clone())
        }
    }

    fn tool(id: &str, timeout_ms: u32, required_secrets: BTreeSet<String>) -> ToolDefinition {
        ToolDefinition {
            id: id.into(),
            version: "1.0.0".into(),
            required_secrets,
            network_policy: NetworkPolicy::allow_all(),
            cost_class: CostClass::Cheap,
            estimated_cost_usd: 0.1,
            retry_policy: RetryPolicy::default(),
            timeout_ms,
            idempotent: true,
        }
    }

    fn test_runtime() -> Runtime {
        Runtime::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(Vault::new([7u8; 32])),
            Arc::new(PolicyEngine::new()),
            Arc::new(MeteringTracker::new(gantry_metering::default_price_table())),
            Arc::new(ArtifactStore::new(Box::new(gantry_artifact::MemorySink::new()), 64 * 1024, vec![])),
            Arc::new(GantryConfig::default()),
            Arc::new(NoopWebhookSink),
        )
    }

    fn admit_tier(runtime: &Runtime, tenant: &TenantId) {
        runtime.policy.set_policy(
            tenant,
            gantry_policy::PolicyLimits { allowed_tools: gantry_policy::AllowedTools::Any, ..gantry_policy::tier_defaults(Tier::Free) },
            Utc::now(),
        );
    }

    #[tokio::test]
    async fn happy_path_completes_and_echoes_input() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("echo", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("echo", Arc::new(EchoHandler));

        let job = runtime
            .execute("echo", json!({"x": 1}), ExecuteOptions { tenant_id: tenant, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected_before_job_creation() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        let err = runtime.execute("missing", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownWorkflow { .. }));
    }

    #[tokio::test]
    async fn admission_denial_is_returned_as_err() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        runtime.registry.register(tool("echo", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("echo", Arc::new(EchoHandler));
        let err = runtime.execute("echo", json!({}), ExecuteOptions { tenant_id: tenant, tier: Tier::Free, ..Default::default() }).await.unwrap_err();
        assert!(matches!(err, RunnerError::PolicyDenied(_)), "free tier has an empty allow-list by default");
    }

    #[tokio::test]
    async fn dry_run_completes_without_invoking_handler() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("echo", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("echo", Arc::new(FailingHandler));

        let job = runtime
            .execute("echo", json!({}), ExecuteOptions { tenant_id: tenant.clone(), dry_run: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"dry_run": true})));

        let usage = runtime.policy.get_usage(&tenant).expect("admit_tier seeds a tenant record");
        assert_eq!(usage.day_cost_usd, 0.0, "dry run must not touch policy counters");
        assert_eq!(usage.concurrent_jobs, 0, "dry run must not touch policy counters");
        let summary = runtime.metering.get_job_cost_summary(job.id);
        assert_eq!(summary.total_cost_usd, 0.0, "dry run must not record metering events");
    }

    #[tokio::test]
    async fn missing_secrets_with_master_key_fails_the_job() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime
            .registry
            .register(tool("needs-secret", 5_000, BTreeSet::from(["dataforseo".to_string()])), Arc::new(NoopSchema), Arc::new(NoopSchema))
            .unwrap();
        runtime.register_workflow("needs-secret", Arc::new(EchoHandler));

        let job = runtime
            .execute("needs-secret", json!({}), ExecuteOptions { tenant_id: tenant, master_key: Some([1u8; 32]), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("MISSING_SECRETS"));
    }

    #[tokio::test]
    async fn missing_secrets_without_master_key_is_not_fatal() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime
            .registry
            .register(tool("needs-secret", 5_000, BTreeSet::from(["dataforseo".to_string()])), Arc::new(NoopSchema), Arc::new(NoopSchema))
            .unwrap();
        runtime.register_workflow("needs-secret", Arc::new(EchoHandler));

        let job = runtime.execute("needs-secret", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "no master key was ever supplied, so absent secrets are not fatal");
    }

    #[tokio::test]
    async fn handler_error_fails_the_job_without_an_err_return() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("boom", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("boom", Arc::new(FailingHandler));

        let job = runtime.execute("boom", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn deadline_exceeded_fails_the_job() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("slow", 50, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("slow", Arc::new(SlowHandler));

        let job = runtime.execute("slow", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn cancellation_before_handler_observes_it_still_cancels() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("cancel-aware", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("cancel-aware", Arc::new(CancelAwareHandler));

        let runtime = Arc::new(runtime);
        let rt2 = runtime.clone();
        let exec = tokio::spawn(async move {
            rt2.execute("cancel-aware", json!({}), ExecuteOptions { tenant_id: TenantId::from("T1"), ..Default::default() }).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = runtime.list_jobs(&tenant, 10);
        assert_eq!(jobs.len(), 1);
        assert!(runtime.cancel_job(jobs[0].id));

        let job = exec.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn output_validation_failure_is_non_fatal() {
        struct RejectAllSchema;
        impl Schema for RejectAllSchema {
            fn validate(&self, _value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
                Err(vec![FieldError { field_path: String::new(), message: "always rejected".into() }])
            }
        }

        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("echo", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(RejectAllSchema)).unwrap();
        runtime.register_workflow("echo", Arc::new(EchoHandler));

        let job = runtime.execute("echo", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "output validation failures are logged, not fatal");
    }

    #[tokio::test]
    async fn replay_creates_a_child_job_pointing_at_the_parent() {
        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("echo", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("echo", Arc::new(EchoHandler));

        let original = runtime.execute("echo", json!({"a": 1}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        let replayed = runtime.replay(original.id, 2, ExecuteOptions::default()).await.unwrap();
        assert_eq!(replayed.parent_job_id, Some(original.id));
        assert_eq!(replayed.replay_from_step, Some(2));
    }

    #[tokio::test]
    async fn replay_of_unknown_job_fails() {
        let runtime = test_runtime();
        let err = runtime.replay(JobId::new(), 0, ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RunnerError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn switch_method_updates_job_and_delivers_to_handler() {
        struct MethodSwitchHandler;
        #[async_trait]
        impl WorkflowHandler for MethodSwitchHandler {
            async fn call(&self, ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
                let mut rx = ctx.method_switch_channel().expect("channel already taken");
                let switch = rx.recv().await.expect("sender dropped");
                Ok(json!({ "method": switch.method }))
            }
        }

        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("switchable", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("switchable", Arc::new(MethodSwitchHandler));

        let runtime = Arc::new(runtime);
        let rt2 = runtime.clone();
        let exec = tokio::spawn(async move {
            rt2.execute("switchable", json!({}), ExecuteOptions { tenant_id: TenantId::from("T1"), ..Default::default() }).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = runtime.list_jobs(&tenant, 10);
        assert!(runtime.switch_method(jobs[0].id, "headless-browser", "bot detection triggered"));

        let job = exec.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"method": "headless-browser"})));
        assert_eq!(job.current_method.as_deref(), Some("headless-browser"));
    }

    #[tokio::test]
    async fn get_logs_since_reflects_handler_logging() {
        struct LoggingHandler;
        #[async_trait]
        impl WorkflowHandler for LoggingHandler {
            async fn call(&self, ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
                ctx.log(LogLevel::Info, "starting audit", None);
                Ok(json!({}))
            }
        }

        let runtime = test_runtime();
        let tenant = TenantId::from("T1");
        admit_tier(&runtime, &tenant);
        runtime.registry.register(tool("logging", 5_000, BTreeSet::new()), Arc::new(NoopSchema), Arc::new(NoopSchema)).unwrap();
        runtime.register_workflow("logging", Arc::new(LoggingHandler));

        let before = Utc::now() - chrono::Duration::seconds(1);
        let job = runtime.execute("logging", json!({}), ExecuteOptions { tenant_id: tenant, ..Default::default() }).await.unwrap();
        let logs = runtime.get_logs_since(job.id, before);
        assert!(logs.iter().any(|l| l.message == "starting audit"));
    }
}
