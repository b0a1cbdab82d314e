// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key derivation and authenticated encryption primitives.
//!
//! Key hierarchy: a process-wide pepper (32 bytes from the environment) is
//! combined with a tenant id to form a per-tenant salt; the salt and a
//! tenant-supplied password are fed through PBKDF2-HMAC-SHA256 to derive the
//! 256-bit master key used for AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// PBKDF2 iteration count. Matches the source specification's literal
/// "iterations >= 100_000" requirement.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Errors from a cryptographic operation.
#[derive(Debug, thiserror::Error)]
pub enum CryptoFailure {
    /// AEAD encryption failed (should not happen with a well-formed key).
    #[error("encryption failed")]
    EncryptionFailed,
    /// AEAD decryption failed: wrong key, tampered ciphertext, or tampered AAD.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Derive the per-tenant salt `S = SHA256(pepper || tenant_id)`.
#[must_use]
pub fn tenant_salt(pepper: &[u8; 32], tenant_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pepper);
    hasher.update(tenant_id.as_bytes());
    hasher.finalize().into()
}

/// Derive a 256-bit master key from a password and tenant salt via
/// PBKDF2-HMAC-SHA256 with [`KDF_ITERATIONS`] rounds.
#[must_use]
pub fn derive_master_key(password: &str, salt: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, KDF_ITERATIONS, &mut *key)
        .expect("pbkdf2 output length is valid for hmac-sha256");
    key
}

/// Hash of a sorted, comma-joined scope list, bound into the AEAD's AAD.
#[must_use]
pub fn scopes_hash(scopes: &[String]) -> [u8; 32] {
    let mut sorted: Vec<&str> = scopes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join(",");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.finalize().into()
}

fn build_aad(tenant_id: &str, provider: &str, scopes: &[String]) -> Vec<u8> {
    let mut aad = Vec::new();
    aad.extend_from_slice(tenant_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(provider.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&scopes_hash(scopes));
    aad
}

/// Ciphertext plus the random nonce it was sealed with.
pub struct Sealed {
    /// 96-bit random nonce used for this encryption.
    pub nonce: [u8; 12],
    /// AES-256-GCM ciphertext, including the 128-bit auth tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key`, binding `tenant_id`/`provider`/`scopes` as AAD.
pub fn seal(
    key: &[u8; 32],
    tenant_id: &str,
    provider: &str,
    scopes: &[String],
    plaintext: &[u8],
) -> Result<Sealed, CryptoFailure> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let aad = build_aad(tenant_id, provider, scopes);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoFailure::EncryptionFailed)?;
    Ok(Sealed {
        nonce: nonce.into(),
        ciphertext,
    })
}

/// Decrypt `ciphertext` under `key`, verifying the same AAD used at seal time.
///
/// Any mismatch in `key`, `nonce`, `ciphertext`, or the AAD-bound fields
/// yields [`CryptoFailure::DecryptionFailed`] — never a partial result.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    tenant_id: &str,
    provider: &str,
    scopes: &[String],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoFailure> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce);
    let aad = build_aad(tenant_id, provider, scopes);
    let plaintext = cipher
        .decrypt(nonce, aes_gcm::aead::Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| CryptoFailure::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let salt = tenant_salt(&[7u8; 32], "T1");
        let key = derive_master_key("hunter2", &salt);
        let scopes = vec!["audit-website".to_string()];
        let sealed = seal(&key, "T1", "dataforseo", &scopes, b"secret-value").unwrap();
        let plaintext = open(&key, &sealed.nonce, "T1", "dataforseo", &scopes, &sealed.ciphertext).unwrap();
        assert_eq!(&*plaintext, b"secret-value");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let salt = tenant_salt(&[7u8; 32], "T1");
        let key = derive_master_key("hunter2", &salt);
        let wrong_key = derive_master_key("wrong", &salt);
        let scopes = vec![];
        let sealed = seal(&key, "T1", "dataforseo", &scopes, b"secret-value").unwrap();
        assert!(open(&wrong_key, &sealed.nonce, "T1", "dataforseo", &scopes, &sealed.ciphertext).is_err());
    }

    #[test]
    fn tampered_aad_field_fails_to_decrypt() {
        let salt = tenant_salt(&[7u8; 32], "T1");
        let key = derive_master_key("hunter2", &salt);
        let scopes = vec![];
        let sealed = seal(&key, "T1", "dataforseo", &scopes, b"secret-value").unwrap();
        // provider mismatch changes the AAD
        assert!(open(&key, &sealed.nonce, "T1", "perplexity", &scopes, &sealed.ciphertext).is_err());
    }

    #[test]
    fn tampered_ciphertext_byte_fails_to_decrypt() {
        let salt = tenant_salt(&[7u8; 32], "T1");
        let key = derive_master_key("hunter2", &salt);
        let scopes = vec![];
        let mut sealed = seal(&key, "T1", "dataforseo", &scopes, b"secret-value").unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(open(&key, &sealed.nonce, "T1", "dataforseo", &scopes, &sealed.ciphertext).is_err());
    }

    #[test]
    fn scopes_hash_is_order_independent() {
        let a = scopes_hash(&["b".to_string(), "a".to_string()]);
        let b = scopes_hash(&["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
    }
}
