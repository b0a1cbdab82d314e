// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ephemeral session tokens that unlock a tenant's master key without
//! re-prompting for a password on every call.

use crate::crypto::{self, CryptoFailure};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_core::TenantId;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

struct SessionEntry {
    tenant_id: TenantId,
    token: String,
    wrapped_key_nonce: [u8; 12],
    wrapped_key_ciphertext: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// A concurrent table of outstanding vault sessions, each holding a
/// master key sealed under a process-local ephemeral wrap key.
pub struct SessionTable {
    sessions: DashMap<String, SessionEntry>,
    wrap_key: Zeroizing<[u8; 32]>,
}

impl SessionTable {
    /// Construct an empty table with a fresh random wrap key.
    #[must_use]
    pub fn new() -> Self {
        let mut wrap_key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *wrap_key);
        Self {
            sessions: DashMap::new(),
            wrap_key,
        }
    }

    /// Seal `master_key` under the process wrap key, generate a random
    /// 256-bit token, and insert the session. Returns the token and expiry.
    pub fn create(
        &self,
        tenant_id: TenantId,
        master_key: &[u8; 32],
        ttl_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), CryptoFailure> {
        let mut token_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut token_bytes);
        let token = base64::engine::general_purpose::STANDARD.encode(token_bytes);

        // The wrap key's own AAD is the token itself: a session-table dump
        // cannot be used to unwrap a different session's key material.
        let sealed = crypto::seal(&self.wrap_key, &token, "session-wrap", &[], master_key)?;
        let expires_at = now + chrono::Duration::milliseconds(ttl_ms as i64);

        self.sessions.insert(
            token.clone(),
            SessionEntry {
                tenant_id,
                token: token.clone(),
                wrapped_key_nonce: sealed.nonce,
                wrapped_key_ciphertext: sealed.ciphertext,
                expires_at,
            },
        );
        Ok((token, expires_at))
    }

    /// Look up `token`, verify it belongs to `tenant_id`, is unexpired, and
    /// matches the stored value under constant-time comparison, then unwrap
    /// and return the master key.
    pub fn unlock(
        &self,
        tenant_id: &TenantId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<[u8; 32], SessionError> {
        let entry = self.sessions.get(token).ok_or(SessionError::NotFound)?;

        if entry.token.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() != 1 {
            return Err(SessionError::NotFound);
        }
        if &entry.tenant_id != tenant_id {
            return Err(SessionError::NotFound);
        }
        if now >= entry.expires_at {
            return Err(SessionError::Expired);
        }

        let plaintext = crypto::open(&self.wrap_key, &entry.wrapped_key_nonce, token, "session-wrap", &[], &entry.wrapped_key_ciphertext)
            .map_err(|_| SessionError::Corrupt)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&plaintext);
        Ok(key)
    }

    /// Remove every session whose `expires_at` has already passed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) {
        self.sessions.retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure modes for [`SessionTable::unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this token (or it belongs to a different tenant).
    #[error("session not found")]
    NotFound,
    /// The session existed but its TTL has elapsed.
    #[error("session expired")]
    Expired,
    /// The wrapped key could not be unwrapped (should not happen absent tampering).
    #[error("session entry corrupt")]
    Corrupt,
}
