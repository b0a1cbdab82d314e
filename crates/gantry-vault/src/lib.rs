// SPDX-License-Identifier: MIT OR Apache-2.0
//! Authenticated, per-tenant encrypted secret storage with password-derived
//! keys and time-bounded session unlocks.
//!
//! See [`crypto`] for the key-derivation and AEAD primitives and
//! [`session`] for the ephemeral session-token table.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Key derivation and authenticated encryption primitives.
pub mod crypto;
/// Ephemeral session-token table.
pub mod session;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_core::TenantId;
use session::{SessionError, SessionTable};
use zeroize::Zeroizing;

/// Errors raised by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// `GANTRY_PEPPER` was not set, was not valid base64, or was not exactly 32 bytes.
    #[error("vault pepper is missing or malformed: {reason}")]
    MissingPepper {
        /// Why the pepper was rejected.
        reason: String,
    },
    /// Decryption failed: wrong key, tampered ciphertext, or tampered AAD.
    ///
    /// Never recovered — callers must treat this as fatal, not retry with
    /// silently-narrower scope.
    #[error("authentication failed")]
    AuthError,
    /// A session token was presented after its `expires_at`.
    #[error("session expired")]
    SessionExpired,
}

impl VaultError {
    /// Bridge to the unified wire error taxonomy.
    #[must_use]
    pub fn code(&self) -> gantry_error::ErrorCode {
        match self {
            Self::MissingPepper { .. } => gantry_error::ErrorCode::ConfigError,
            Self::AuthError => gantry_error::ErrorCode::AuthError,
            Self::SessionExpired => gantry_error::ErrorCode::SessionExpired,
        }
    }
}

impl From<SessionError> for VaultError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Expired => Self::SessionExpired,
            SessionError::NotFound | SessionError::Corrupt => Self::AuthError,
        }
    }
}

/// Read and validate the 32-byte pepper from the named environment variable.
///
/// Base64-decodes the value; fails process start (returns `Err`) if the
/// variable is absent, not valid base64, or not exactly 32 bytes.
pub fn load_pepper(env_var: &str) -> Result<[u8; 32], VaultError> {
    use base64::Engine;
    let raw = std::env::var(env_var).map_err(|_| VaultError::MissingPepper {
        reason: format!("{env_var} is not set"),
    })?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| VaultError::MissingPepper {
            reason: format!("not valid base64: {e}"),
        })?;
    decoded.try_into().map_err(|bytes: Vec<u8>| VaultError::MissingPepper {
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

/// Metadata-only view of a stored secret, returned by [`Vault::list`].
/// Never includes plaintext or ciphertext.
#[derive(Debug, Clone)]
pub struct SecretMetadata {
    /// Third-party provider tag.
    pub provider: String,
    /// Tool ids permitted to retrieve this secret (empty = any).
    pub scopes: Vec<String>,
    /// Optional absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the secret was stored.
    pub created_at: DateTime<Utc>,
}

struct EncryptedSecretRecord {
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
    scopes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// A tenant's encrypted secret record in the shape a durability backend
/// persists and restores it: still sealed, never plaintext. This is the
/// `secrets` half of the per-tenant persisted-state layout.
#[derive(Debug, Clone)]
pub struct PersistedSecret {
    /// Third-party provider tag; the other half of the `(tenant, provider)` key.
    pub provider: String,
    /// AEAD nonce used to seal `ciphertext`.
    pub nonce: [u8; 12],
    /// Sealed secret bytes; opaque without the tenant's master key.
    pub ciphertext: Vec<u8>,
    /// Tool ids permitted to retrieve this secret (empty = any).
    pub scopes: Vec<String>,
    /// Optional absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the secret was stored.
    pub created_at: DateTime<Utc>,
}

/// Parameters for [`Vault::store`].
pub struct StoreRequest<'a> {
    /// Third-party provider tag.
    pub provider: &'a str,
    /// Plaintext secret value.
    pub plaintext: &'a [u8],
    /// Tool ids permitted to retrieve this secret (empty = any).
    pub scopes: Vec<String>,
    /// Optional absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Authenticated, per-tenant encrypted secret storage.
pub struct Vault {
    pepper: Zeroizing<[u8; 32]>,
    secrets: DashMap<(TenantId, String), EncryptedSecretRecord>,
    sessions: SessionTable,
}

impl Vault {
    /// Construct a vault rooted at the given process-wide pepper.
    #[must_use]
    pub fn new(pepper: [u8; 32]) -> Self {
        Self {
            pepper: Zeroizing::new(pepper),
            secrets: DashMap::new(),
            sessions: SessionTable::new(),
        }
    }

    /// Derive this tenant's master key from a password. Does not persist the key.
    #[must_use]
    pub fn derive_master_key(&self, tenant_id: &TenantId, password: &str) -> Zeroizing<[u8; 32]> {
        let salt = crypto::tenant_salt(&self.pepper, tenant_id.as_str());
        crypto::derive_master_key(password, &salt)
    }

    /// Encrypt and upsert a secret under `(tenant, provider)`. Replacing an
    /// existing record discards the old ciphertext.
    pub fn store(
        &self,
        tenant_id: &TenantId,
        master_key: &[u8; 32],
        req: StoreRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        let sealed = crypto::seal(master_key, tenant_id.as_str(), req.provider, &req.scopes, req.plaintext)
            .map_err(|_| VaultError::AuthError)?;
        self.secrets.insert(
            (tenant_id.clone(), req.provider.to_string()),
            EncryptedSecretRecord {
                nonce: sealed.nonce,
                ciphertext: sealed.ciphertext,
                scopes: req.scopes,
                expires_at: req.expires_at,
                created_at: now,
            },
        );
        tracing::info!(target: "gantry.vault", tenant_id = %tenant_id, provider = req.provider, "secret stored");
        Ok(())
    }

    /// Retrieve plaintext iff a record exists, is unexpired, and `scopes` is
    /// empty or contains `requesting_tool_id`. Decryption failure (wrong
    /// key, tampered record) yields [`VaultError::AuthError`].
    pub fn retrieve(
        &self,
        tenant_id: &TenantId,
        provider: &str,
        master_key: &[u8; 32],
        requesting_tool_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        let key = (tenant_id.clone(), provider.to_string());
        let Some(record) = self.secrets.get(&key) else {
            return Ok(None);
        };

        if let Some(expires_at) = record.expires_at {
            if now >= expires_at {
                return Ok(None);
            }
        }
        if !record.scopes.is_empty() && !record.scopes.iter().any(|s| s == requesting_tool_id) {
            return Ok(None);
        }

        crypto::open(master_key, &record.nonce, tenant_id.as_str(), provider, &record.scopes, &record.ciphertext)
            .map(Some)
            .map_err(|_| VaultError::AuthError)
    }

    /// List metadata for every secret stored for `tenant_id`. Never returns plaintext.
    #[must_use]
    pub fn list(&self, tenant_id: &TenantId) -> Vec<SecretMetadata> {
        let mut out: Vec<SecretMetadata> = self
            .secrets
            .iter()
            .filter(|entry| &entry.key().0 == tenant_id)
            .map(|entry| SecretMetadata {
                provider: entry.key().1.clone(),
                scopes: entry.value().scopes.clone(),
                expires_at: entry.value().expires_at,
                created_at: entry.value().created_at,
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Export every sealed secret record stored for `tenant_id`, for a
    /// durability backend to persist. Still sealed: restoring these later
    /// needs no master key and never touches plaintext.
    #[must_use]
    pub fn export_secrets(&self, tenant_id: &TenantId) -> Vec<PersistedSecret> {
        let mut out: Vec<PersistedSecret> = self
            .secrets
            .iter()
            .filter(|entry| &entry.key().0 == tenant_id)
            .map(|entry| PersistedSecret {
                provider: entry.key().1.clone(),
                nonce: entry.value().nonce,
                ciphertext: entry.value().ciphertext.clone(),
                scopes: entry.value().scopes.clone(),
                expires_at: entry.value().expires_at,
                created_at: entry.value().created_at,
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Restore previously exported sealed secret records for `tenant_id`,
    /// upserting each by `(tenant, provider)`. The records are trusted to
    /// have come from a prior [`Vault::export_secrets`] call; a tampered
    /// record is only caught later, at `retrieve`, via its auth tag.
    pub fn restore_secrets(&self, tenant_id: &TenantId, secrets: Vec<PersistedSecret>) {
        for secret in secrets {
            self.secrets.insert(
                (tenant_id.clone(), secret.provider),
                EncryptedSecretRecord {
                    nonce: secret.nonce,
                    ciphertext: secret.ciphertext,
                    scopes: secret.scopes,
                    expires_at: secret.expires_at,
                    created_at: secret.created_at,
                },
            );
        }
    }

    /// Derive the master key from `password`, seal it under a fresh random
    /// session token, and return `{session_token, expires_at}`.
    pub fn create_session(
        &self,
        tenant_id: &TenantId,
        password: &str,
        ttl_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), VaultError> {
        let master_key = self.derive_master_key(tenant_id, password);
        self.sessions
            .create(tenant_id.clone(), &master_key, ttl_ms, now)
            .map_err(|_| VaultError::AuthError)
    }

    /// Unwrap and return the master key bound to `session_token`, if it
    /// exists, is unexpired, and belongs to `tenant_id`.
    pub fn unlock_with_session(
        &self,
        tenant_id: &TenantId,
        session_token: &str,
        now: DateTime<Utc>,
    ) -> Result<[u8; 32], VaultError> {
        self.sessions.unlock(tenant_id, session_token, now).map_err(VaultError::from)
    }
}
