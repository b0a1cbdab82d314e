// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sized artifact capture, redaction, and inline-vs-external storage.
//!
//! Per-job artifact lists are per-job (`DashMap<JobId, Mutex<Vec<Artifact>>>`);
//! the storage backend for out-of-line payloads is pluggable behind
//! [`ExternalArtifactSink`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use gantry_config::{ArtifactMode, GantryConfig, RedactionRule};
use gantry_core::{Artifact, ArtifactId, ArtifactKind, ExternalHandle, JobId};
use gantry_error::ErrorCode;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Failure modes for artifact capture and storage.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The external sink could not persist the payload.
    #[error("artifact write failed: {reason}")]
    WriteFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// `artifact_mode = "external"` was configured but no sink was supplied.
    #[error("external artifact mode requires a caller-supplied sink")]
    NoExternalSinkConfigured,
}

impl ArtifactError {
    /// The stable wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InfrastructureError
    }
}

/// Out-of-line storage boundary for artifacts that exceed the inline-size
/// threshold. Implementations own the durability and addressing scheme;
/// the store only holds the returned [`ExternalHandle`].
pub trait ExternalArtifactSink: Send + Sync {
    /// Persist `bytes` for `(job_id, artifact_id)` and return an opaque
    /// handle the sink can later resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be persisted.
    fn store(&self, job_id: JobId, artifact_id: ArtifactId, bytes: &[u8]) -> Result<ExternalHandle, ArtifactError>;
}

/// In-process sink backed by a concurrent map. Default for `artifact_mode
/// = "memory"` and used in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemorySink {
    /// Construct an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previously stored payload by its reference string.
    #[must_use]
    pub fn load(&self, reference: &str) -> Option<Vec<u8>> {
        self.blobs.get(reference).map(|v| v.clone())
    }
}

impl ExternalArtifactSink for MemorySink {
    fn store(&self, job_id: JobId, artifact_id: ArtifactId, bytes: &[u8]) -> Result<ExternalHandle, ArtifactError> {
        let reference = format!("mem://{job_id}/{artifact_id}");
        self.blobs.insert(reference.clone(), bytes.to_vec());
        Ok(ExternalHandle { reference })
    }
}

/// Filesystem sink for `artifact_mode = "filesystem"`. Payloads are written
/// under `root/<job_id>/<artifact_id>.bin`.
#[derive(Debug)]
pub struct FilesystemSink {
    root: PathBuf,
}

impl FilesystemSink {
    /// Construct a sink rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, job_id: JobId, artifact_id: ArtifactId) -> PathBuf {
        self.root.join(job_id.to_string()).join(format!("{artifact_id}.bin"))
    }
}

impl ExternalArtifactSink for FilesystemSink {
    fn store(&self, job_id: JobId, artifact_id: ArtifactId, bytes: &[u8]) -> Result<ExternalHandle, ArtifactError> {
        let path = self.path_for(job_id, artifact_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArtifactError::WriteFailed {
                reason: format!("create artifact dir {}: {e}", parent.display()),
            })?;
        }
        std::fs::write(&path, bytes).map_err(|e| ArtifactError::WriteFailed {
            reason: format!("write artifact {}: {e}", path.display()),
        })?;
        Ok(ExternalHandle {
            reference: path.display().to_string(),
        })
    }
}

fn is_text_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}

/// Apply redaction rules to `text`, returning the redacted text and the
/// names of rules that matched. Rules with an uncompilable pattern are
/// skipped rather than failing the capture.
fn redact(text: &str, rules: &[RedactionRule]) -> (String, Vec<String>) {
    let mut redacted = text.to_string();
    let mut matched = Vec::new();
    for rule in rules {
        let Ok(re) = Regex::new(&rule.pattern) else {
            tracing::warn!(target: "gantry.artifact", rule = %rule.name, "skipping redaction rule with invalid pattern");
            continue;
        };
        if re.is_match(&redacted) {
            let replacement = format!("[REDACTED:{}]", rule.name);
            redacted = re.replace_all(&redacted, replacement.as_str()).into_owned();
            matched.push(rule.name.clone());
        }
    }
    (redacted, matched)
}

/// Per-job artifact capture and retrieval, backed by a pluggable
/// [`ExternalArtifactSink`] for out-of-line payloads.
pub struct ArtifactStore {
    jobs: DashMap<JobId, Mutex<Vec<Artifact>>>,
    index: DashMap<ArtifactId, JobId>,
    sink: Box<dyn ExternalArtifactSink>,
    max_inline_bytes: u64,
    redaction_rules: Vec<RedactionRule>,
}

impl ArtifactStore {
    /// Construct a store with an explicit sink, inline-size threshold, and
    /// redaction-rule set.
    #[must_use]
    pub fn new(sink: Box<dyn ExternalArtifactSink>, max_inline_bytes: u64, redaction_rules: Vec<RedactionRule>) -> Self {
        Self {
            jobs: DashMap::new(),
            index: DashMap::new(),
            sink,
            max_inline_bytes,
            redaction_rules,
        }
    }

    /// Build a store from configuration, selecting a default sink for
    /// `memory`/`filesystem` modes.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NoExternalSinkConfigured`] for
    /// `artifact_mode = "external"`; callers must build the store with
    /// [`ArtifactStore::new`] and their own sink in that case.
    pub fn from_config(config: &GantryConfig) -> Result<Self, ArtifactError> {
        let sink: Box<dyn ExternalArtifactSink> = match config.artifact_mode {
            ArtifactMode::Memory => Box::new(MemorySink::new()),
            ArtifactMode::Filesystem => {
                let dir = config.artifact_dir.clone().unwrap_or_else(|| "./artifacts".to_string());
                Box::new(FilesystemSink::new(dir))
            }
            ArtifactMode::External => return Err(ArtifactError::NoExternalSinkConfigured),
        };
        Ok(Self::new(sink, config.max_inline_bytes, config.redaction_rules.clone()))
    }

    /// Capture a payload, applying redaction to text content types and
    /// choosing inline vs. external storage by size.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds `max_inline_bytes` and the
    /// external sink fails to persist it.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        &self,
        job_id: JobId,
        step_index: u32,
        step_name: Option<String>,
        kind: ArtifactKind,
        content_type: &str,
        bytes: Vec<u8>,
        extra_rules: &[RedactionRule],
    ) -> Result<Artifact, ArtifactError> {
        let artifact_id = ArtifactId::new();

        let (payload, redacted, redaction_rules) = if is_text_content_type(content_type) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let mut rules = self.redaction_rules.clone();
            rules.extend(extra_rules.iter().cloned());
            let (redacted_text, matched) = redact(&text, &rules);
            let redacted_bytes = redacted_text.into_bytes();
            let was_redacted = !matched.is_empty();
            let rule_names = if was_redacted { Some(matched) } else { None };
            (redacted_bytes, was_redacted, rule_names)
        } else {
            (bytes, false, None)
        };

        let size_bytes = payload.len() as u64;

        let (content, external_handle) = if size_bytes <= self.max_inline_bytes {
            let inline = if is_text_content_type(content_type) {
                String::from_utf8_lossy(&payload).into_owned()
            } else {
                base64::engine::general_purpose::STANDARD.encode(&payload)
            };
            (Some(inline), None)
        } else {
            let handle = self.sink.store(job_id, artifact_id, &payload)?;
            (None, Some(handle))
        };

        let artifact = Artifact {
            id: artifact_id,
            job_id,
            step_index,
            step_name,
            kind,
            content_type: content_type.to_string(),
            content,
            external_handle,
            size_bytes,
            created_at: Utc::now(),
            redacted,
            redaction_rules,
        };

        self.jobs
            .entry(job_id)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .expect("artifact lock poisoned")
            .push(artifact.clone());
        self.index.insert(artifact_id, job_id);

        tracing::debug!(
            target: "gantry.artifact",
            job_id = %job_id,
            artifact_id = %artifact_id,
            size_bytes,
            redacted,
            "captured artifact"
        );

        Ok(artifact)
    }

    /// Artifacts for a job, in capture order.
    #[must_use]
    pub fn list_for_job(&self, job_id: JobId) -> Vec<Artifact> {
        self.jobs
            .get(&job_id)
            .map(|entries| entries.lock().expect("artifact lock poisoned").clone())
            .unwrap_or_default()
    }

    /// Look up a single artifact by id.
    #[must_use]
    pub fn get(&self, artifact_id: ArtifactId) -> Option<Artifact> {
        let job_id = *self.index.get(&artifact_id)?;
        self.jobs.get(&job_id)?.lock().expect("artifact lock poisoned").iter().find(|a| a.id == artifact_id).cloned()
    }

    /// Drop all artifacts for a job.
    pub fn clear_job(&self, job_id: JobId) {
        if let Some((_, entries)) = self.jobs.remove(&job_id) {
            for artifact in entries.into_inner().expect("artifact lock poisoned") {
                self.index.remove(&artifact.id);
            }
        }
    }
}
