//! Unified error taxonomy with stable error codes for the gantry runtime.
//!
//! Every gantry error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag matching the wire vocabulary every subsystem error converts
//! into), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. Use the builder returned by [`GantryError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Pre-job-creation admission errors: unknown workflow, bad input, policy denial.
    Admission,
    /// Post-creation, pre-handler setup errors.
    Setup,
    /// Errors raised by a workflow handler during execution.
    Handler,
    /// Authenticated-encryption and key-derivation failures in the vault.
    Crypto,
    /// Job lookup / lifecycle errors.
    Job,
    /// Infrastructure errors that are logged but never propagated into job state.
    Infrastructure,
    /// Configuration loading/validation errors.
    Config,
    /// Catch-all for errors that do not map to a wire kind.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admission => "admission",
            Self::Setup => "setup",
            Self::Handler => "handler",
            Self::Crypto => "crypto",
            Self::Job => "job",
            Self::Infrastructure => "infrastructure",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Stable, machine-readable error kind. This is the wire vocabulary named in
/// the runtime's external-interfaces contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The requested workflow id has no registered definition.
    UnknownWorkflow,
    /// Input or output failed schema validation.
    ValidationError,
    /// The policy engine denied admission.
    PolicyDenied,
    /// A tenant-supplied master key was present but required secrets were absent.
    MissingSecrets,
    /// Vault decryption failed: wrong key, tampered ciphertext, or tampered AAD.
    AuthError,
    /// A vault session token was presented after its `expires_at`.
    SessionExpired,
    /// No job exists with the given id.
    JobNotFound,
    /// The workflow handler raised an error.
    HandlerError,
    /// The job's effective deadline elapsed before the handler finished.
    Timeout,
    /// A tool definition failed to register (duplicate id, malformed fields).
    RegistrationError,
    /// Configuration failed to load or validate.
    ConfigError,
    /// An infrastructure-level failure (webhook dispatch, artifact write) that is
    /// logged only and never surfaces as a job failure.
    InfrastructureError,
}

impl ErrorCode {
    /// The [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownWorkflow | Self::ValidationError | Self::PolicyDenied => {
                ErrorCategory::Admission
            }
            Self::MissingSecrets => ErrorCategory::Setup,
            Self::HandlerError => ErrorCategory::Handler,
            Self::AuthError => ErrorCategory::Crypto,
            Self::SessionExpired => ErrorCategory::Crypto,
            Self::JobNotFound => ErrorCategory::Job,
            Self::Timeout => ErrorCategory::Job,
            Self::RegistrationError => ErrorCategory::Internal,
            Self::ConfigError => ErrorCategory::Config,
            Self::InfrastructureError => ErrorCategory::Infrastructure,
        }
    }

    /// Stable string form, suitable for wire serialization or log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownWorkflow => "UNKNOWN_WORKFLOW",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::MissingSecrets => "MISSING_SECRETS",
            Self::AuthError => "AUTH_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RegistrationError => "REGISTRATION_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::InfrastructureError => "INFRASTRUCTURE_ERROR",
        }
    }

    /// All known codes, for exhaustive testing.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::UnknownWorkflow,
            Self::ValidationError,
            Self::PolicyDenied,
            Self::MissingSecrets,
            Self::AuthError,
            Self::SessionExpired,
            Self::JobNotFound,
            Self::HandlerError,
            Self::Timeout,
            Self::RegistrationError,
            Self::ConfigError,
            Self::InfrastructureError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GantryError
// ---------------------------------------------------------------------------

/// A unified error value carrying a stable [`ErrorCode`], a human-readable
/// message, optional structured context, and an optional cause chain.
///
/// The cause chain is intentionally excluded from [`Serialize`]; use
/// [`GantryError::to_dto`] to obtain a wire-safe representation.
pub struct GantryError {
    code: ErrorCode,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    context: BTreeMap<String, serde_json::Value>,
}

impl GantryError {
    /// Construct a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a structured context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach a boxed source error as the cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The category the code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured context attached to this error.
    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.context
    }

    /// Convert into a serializable DTO without the opaque source chain.
    #[must_use]
    pub fn to_dto(&self) -> GantryErrorDto {
        GantryErrorDto {
            code: self.code,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for GantryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl fmt::Debug for GantryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GantryError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl std::error::Error for GantryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|b| b.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable, source-free representation of a [`GantryError`], suitable
/// for sending across a wire boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GantryErrorDto {
    /// The stable error code.
    pub code: ErrorCode,
    /// The human-readable message.
    pub message: String,
    /// Structured context, deterministically ordered.
    pub context: BTreeMap<String, serde_json::Value>,
}
