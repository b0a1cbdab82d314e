// SPDX-License-Identifier: MIT OR Apache-2.0
//! Captured step output: logs, API traffic, screenshots, and conversations.

use crate::ids::{ArtifactId, JobId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The kind of payload an [`Artifact`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A mirrored log line.
    Log,
    /// A captured screenshot.
    Screenshot,
    /// A captured HTML snapshot.
    HtmlSnapshot,
    /// An outbound API request payload.
    ApiRequest,
    /// An inbound API response payload.
    ApiResponse,
    /// A full LLM conversation transcript.
    LlmConversation,
    /// A captured handler error.
    Error,
    /// The job's final output.
    Output,
}

/// Where an out-of-line artifact's bytes actually live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExternalHandle {
    /// Opaque locator understood by the configured `ExternalArtifactSink`.
    pub reference: String,
}

/// Captured payload, either stored inline or referenced externally.
///
/// Invariant: exactly one of `content` / `external_handle` is populated,
/// and it is inline iff `size_bytes <= max_inline_bytes`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Runtime-generated identifier.
    pub id: ArtifactId,
    /// Owning job.
    pub job_id: JobId,
    /// Step index active at capture time.
    pub step_index: u32,
    /// Human-readable step name.
    pub step_name: Option<String>,
    /// Kind of payload.
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    /// MIME content type, e.g. `"text/plain"`, `"image/png"`.
    pub content_type: String,
    /// Inline text content, populated iff `size_bytes <= max_inline_bytes`.
    pub content: Option<String>,
    /// External storage handle, populated iff content is not inline.
    pub external_handle: Option<ExternalHandle>,
    /// Size of the original payload in bytes.
    pub size_bytes: u64,
    /// Capture time.
    #[schemars(with = "String")]
    pub created_at: DateTime<Utc>,
    /// Whether redaction rules were applied to this payload.
    pub redacted: bool,
    /// Names of the redaction rules that matched, if any.
    pub redaction_rules: Option<Vec<String>>,
}

impl Artifact {
    /// Whether the storage-location invariant holds: exactly one of
    /// `content`/`external_handle` populated.
    #[must_use]
    pub fn has_valid_storage(&self) -> bool {
        self.content.is_some() != self.external_handle.is_some()
    }
}
