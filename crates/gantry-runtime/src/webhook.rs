// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fire-and-forget job-completion notification.

use async_trait::async_trait;
use gantry_core::Job;

/// External notification boundary, dispatched on a detached task once a
/// job reaches a terminal state. Failures are logged and never alter job
/// state — this is an infrastructure error, not a job error.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    /// Notify the sink that `job` reached a terminal state.
    async fn notify(&self, job: &Job);
}

/// No-op sink used when no webhook is configured and in tests.
#[derive(Debug, Default)]
pub struct NoopWebhookSink;

#[async_trait]
impl WebhookSink for NoopWebhookSink {
    async fn notify(&self, _job: &Job) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::TenantId;
    use serde_json::json;

    #[tokio::test]
    async fn noop_sink_does_nothing() {
        let job = Job::new(TenantId::from("T1"), "audit-website", json!({}), 0.0, chrono::Utc::now());
        NoopWebhookSink.notify(&job).await;
    }
}
