// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios exercising the runner against real (in-process)
//! vault, policy, registry, and metering collaborators — no mocks.

use async_trait::async_trait;
use gantry_artifact::ArtifactStore;
use gantry_config::GantryConfig;
use gantry_core::{CostClass, JobId, JobStatus, LogLevel, NetworkPolicy, RetryPolicy, TenantId, Tier, ToolDefinition};
use gantry_metering::MeteringTracker;
use gantry_policy::{AllowedTools, PolicyEngine, PolicyLimits};
use gantry_registry::{FieldError, Schema, ToolRegistry};
use gantry_runtime::{
    ExecuteOptions, HandlerError, NoopWebhookSink, Runtime, StepContext, WorkflowHandler,
};
use gantry_vault::{StoreRequest, Vault};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

struct AnySchema;
impl Schema for AnySchema {
    fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, Vec<FieldError>> {
        Ok(value.clone())
    }
}

struct EchoHandler;

#[async_trait]
impl WorkflowHandler for EchoHandler {
    async fn call(&self, ctx: &StepContext, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        ctx.record_api_call("dataforseo", "search", 1.0);
        ctx.record_api_call("perplexity", "query", 1.0);
        Ok(input)
    }
}

struct SleepThenWriteHandler {
    sleep_ms: u64,
}

#[async_trait]
impl WorkflowHandler for SleepThenWriteHandler {
    async fn call(&self, ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        ctx.record_api_call("dataforseo", "search", 1.0);
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Ok(json!({"done": true}))
    }
}

struct MethodSwitchAwareHandler;

#[async_trait]
impl WorkflowHandler for MethodSwitchAwareHandler {
    async fn call(&self, ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let mut rx = ctx.method_switch_channel().expect("channel already taken");
        rx.recv().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({}))
    }
}

fn tool(id: &str, required_secrets: BTreeSet<String>) -> ToolDefinition {
    ToolDefinition {
        id: id.into(),
        version: "1.0.0".into(),
        required_secrets,
        network_policy: NetworkPolicy::allow_all(),
        cost_class: CostClass::Cheap,
        estimated_cost_usd: 0.1,
        retry_policy: RetryPolicy::default(),
        timeout_ms: 30_000,
        idempotent: true,
    }
}

struct Harness {
    runtime: Runtime,
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    vault: Arc<Vault>,
}

fn harness() -> Harness {
    let registry = Arc::new(ToolRegistry::new());
    let vault = Arc::new(Vault::new([9u8; 32]));
    let policy = Arc::new(PolicyEngine::new());
    let metering = Arc::new(MeteringTracker::new(gantry_metering::default_price_table()));
    let artifacts = Arc::new(ArtifactStore::new(Box::new(gantry_artifact::MemorySink::new()), 64 * 1024, vec![]));
    let config = Arc::new(GantryConfig::default());

    let runtime = Runtime::new(
        registry.clone(),
        vault.clone(),
        policy.clone(),
        metering,
        artifacts,
        config,
        Arc::new(NoopWebhookSink),
    );

    Harness { runtime, registry, policy, vault }
}

fn admit(policy: &PolicyEngine, tenant: &TenantId, overrides: impl FnOnce(PolicyLimits) -> PolicyLimits) {
    let limits = overrides(PolicyLimits { allowed_tools: AllowedTools::Any, ..gantry_policy::tier_defaults(Tier::Free) });
    policy.set_policy(tenant, limits, chrono::Utc::now());
}

#[tokio::test]
async fn happy_path_with_platform_keys() {
    unsafe {
        std::env::set_var("DATAFORSEO_API_KEY", "dk-platform-key");
        std::env::set_var("PERPLEXITY_API_KEY", "px-platform-key");
    }

    let h = harness();
    let tenant = TenantId::from("T1");
    admit(&h.policy, &tenant, |l| l);
    h.registry
        .register(
            tool("audit-website", BTreeSet::from(["dataforseo".to_string(), "perplexity".to_string()])),
            Arc::new(AnySchema),
            Arc::new(AnySchema),
        )
        .unwrap();
    h.runtime.register_workflow("audit-website", Arc::new(EchoHandler));

    let input = json!({
        "url": "https://example.com",
        "businessName": "Acme",
        "locations": [{"city": "Austin", "state": "TX", "serviceArea": "Austin"}],
    });
    let job = h
        .runtime
        .execute("audit-website", input.clone(), ExecuteOptions { tenant_id: tenant.clone(), ..Default::default() })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(input));

    let usage = h.policy.get_usage(&tenant).expect("tenant has usage after a completed job");
    assert!(usage.day_cost_usd >= 0.0);
}

#[tokio::test]
async fn quota_denial_blocks_admission_without_side_effects() {
    let h = harness();
    let tenant = TenantId::from("T2");
    admit(&h.policy, &tenant, |l| l);
    let mut costly = tool("audit-website", BTreeSet::new());
    costly.estimated_cost_usd = 0.15;
    h.registry.register(costly, Arc::new(AnySchema), Arc::new(AnySchema)).unwrap();
    h.runtime.register_workflow("audit-website", Arc::new(EchoHandler));

    // Accrue day_cost_usd = 1.90 via a prior completed job's accounting; the
    // free tier's max_cost_per_day_usd default is 2.00.
    h.policy.job_completed(&tenant, 1.90, chrono::Utc::now());
    let before = h.policy.get_usage(&tenant).unwrap();

    let err = h
        .runtime
        .execute("audit-website", json!({}), ExecuteOptions { tenant_id: tenant.clone(), ..Default::default() })
        .await
        .unwrap_err();

    let gantry_runtime::RunnerError::PolicyDenied(denial) = &err else {
        panic!("expected a policy denial, got {err:?}");
    };
    assert_eq!(denial.reason, "Daily quota exceeded");
    assert!(denial.retry_after_ms.unwrap() > 0);

    let after = h.policy.get_usage(&tenant).unwrap();
    assert_eq!(before.day_cost_usd, after.day_cost_usd, "a denied request must not move counters");
    assert!(h.runtime.list_jobs(&tenant, 10).is_empty(), "a denied request must not create a job");
}

#[tokio::test]
async fn secret_scoping_restricts_retrieval_to_declared_tools() {
    let h = harness();
    let tenant = TenantId::from("T3");
    let master_key = h.vault.derive_master_key(&tenant, "pw");
    h.vault
        .store(
            &tenant,
            &master_key,
            StoreRequest {
                provider: "dataforseo",
                plaintext: b"super-secret-key",
                scopes: vec!["audit-website".to_string()],
                expires_at: None,
            },
            chrono::Utc::now(),
        )
        .unwrap();

    let denied = h.vault.retrieve(&tenant, "dataforseo", &master_key, "discover-businesses", chrono::Utc::now()).unwrap();
    assert!(denied.is_none());

    let allowed = h.vault.retrieve(&tenant, "dataforseo", &master_key, "audit-website", chrono::Utc::now()).unwrap();
    assert_eq!(allowed.unwrap().as_slice(), b"super-secret-key");
}

#[tokio::test]
async fn session_expires_after_its_ttl() {
    let h = harness();
    let tenant = TenantId::from("T4");
    let (token, _expires_at) = h.vault.create_session(&tenant, "pw", 50, chrono::Utc::now()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h.vault.unlock_with_session(&tenant, &token, chrono::Utc::now()).unwrap_err();
    assert!(matches!(err, gantry_vault::VaultError::SessionExpired));
}

#[tokio::test]
async fn cancellation_mid_run_stops_the_job_but_keeps_prior_accounting() {
    let h = harness();
    let tenant = TenantId::from("T5");
    admit(&h.policy, &tenant, |l| l);
    h.registry.register(tool("long-task", BTreeSet::new()), Arc::new(AnySchema), Arc::new(AnySchema)).unwrap();
    h.runtime.register_workflow("long-task", Arc::new(SleepThenWriteHandler { sleep_ms: 5_000 }));

    let runtime = Arc::new(h.runtime);
    let rt2 = runtime.clone();
    let tenant2 = tenant.clone();
    let exec = tokio::spawn(async move {
        rt2.execute("long-task", json!({}), ExecuteOptions { tenant_id: tenant2, ..Default::default() }).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let jobs = runtime.list_jobs(&tenant, 10);
    assert_eq!(jobs.len(), 1);
    assert!(runtime.cancel_job(jobs[0].id));

    let job = exec.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn method_switch_is_visible_on_the_job_and_logged() {
    let h = harness();
    let tenant = TenantId::from("T6");
    admit(&h.policy, &tenant, |l| l);
    h.registry.register(tool("long-task", BTreeSet::new()), Arc::new(AnySchema), Arc::new(AnySchema)).unwrap();
    h.runtime.register_workflow("long-task", Arc::new(MethodSwitchAwareHandler));

    let runtime = Arc::new(h.runtime);
    let rt2 = runtime.clone();
    let tenant2 = tenant.clone();
    let exec = tokio::spawn(async move {
        rt2.execute("long-task", json!({}), ExecuteOptions { tenant_id: tenant2, ..Default::default() }).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let jobs = runtime.list_jobs(&tenant, 10);
    let job_id: JobId = jobs[0].id;
    assert!(runtime.switch_method(job_id, "fallback_sequential", "timeout"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = runtime.get_job(job_id).unwrap();
    assert_eq!(job.current_method.as_deref(), Some("fallback_sequential"));
    assert!(job
        .logs
        .all()
        .iter()
        .any(|entry| entry.level == LogLevel::Warn && entry.message.contains("timeout")));

    runtime.cancel_job(job_id);
    exec.abort();
}
