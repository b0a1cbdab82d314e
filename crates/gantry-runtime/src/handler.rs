// SPDX-License-Identifier: MIT OR Apache-2.0
//! The handler-facing contract: workflows are opaque functions over a
//! [`StepContext`](crate::context::StepContext) and a JSON input value.

use crate::context::StepContext;
use async_trait::async_trait;
use std::fmt;

/// An error raised by a workflow handler during execution.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Human-readable failure description, copied verbatim onto the job's `error` field.
    pub message: String,
}

impl HandlerError {
    /// Construct a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A registered workflow implementation. The runner invokes `call` once
/// per job after admission, secret hydration, and job creation; it does
/// not interpret the handler's internals — step index, progress, and
/// method switches are the handler's own cooperative responsibility.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    /// Run the workflow body against `input`, using `ctx` to log, meter,
    /// and observe cancellation/method-switch requests.
    async fn call(&self, ctx: &StepContext, input: serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}
