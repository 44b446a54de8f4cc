//! Field-level encryption at rest (component 4.I).
//!
//! Sensitive entity fields are never persisted in the clear. Each tenant
//! gets its own AES-256-GCM key, derived from a server-wide secret with
//! PBKDF2-HMAC-SHA512 and cached after first use. Ciphertext is stored as a
//! self-describing marker string so a reader can tell a vaulted field from a
//! plain one without consulting a schema:
//!
//! ```text
//! vault:v1:<tenantId>:<base64(nonce || ciphertext)>
//! ```
//!
//! This crate only holds the primitives. The sweep that walks entities and
//! rewrites their sensitive fields through this marker lives in
//! `ledgercore-orchestrator`, which is the crate that already knows about
//! tenants and entity registries.

#![deny(unsafe_code)]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha512;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

const MARKER_PREFIX: &str = "vault:v1:";
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Fixed salt for tenant-key derivation. The marker already binds the
/// tenant id into the string a reader sees, so this salt only needs to
/// separate this derivation from any other use of the server secret — it
/// is not meant to be unique per tenant.
const KEY_SALT: &[u8] = b"ledgercore-vault-v1";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("malformed vault marker")]
    MalformedMarker,
    #[error("marker tenant {marker_tenant} does not match requested tenant {requested_tenant}")]
    TenantMismatch {
        marker_tenant: String,
        requested_tenant: String,
    },
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Encrypts and decrypts sensitive field values, one AES-256-GCM key per
/// tenant, derived on first use and cached for the lifetime of the vault.
pub struct Vault {
    server_secret: Vec<u8>,
    keys: Mutex<HashMap<String, [u8; 32]>>,
}

impl Vault {
    /// Build a vault from the server-wide secret (see `VAULT_SECRET` in
    /// the server's configuration). The secret must never be logged or
    /// persisted alongside ciphertext.
    pub fn new(server_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            server_secret: server_secret.into(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    async fn key_for(&self, tenant: &str) -> [u8; 32] {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get(tenant) {
            return *key;
        }
        let mut derived = [0u8; 32];
        let mut ikm = Vec::with_capacity(self.server_secret.len() + tenant.len());
        ikm.extend_from_slice(&self.server_secret);
        ikm.extend_from_slice(tenant.as_bytes());
        pbkdf2::<Hmac<Sha512>>(&ikm, KEY_SALT, PBKDF2_ROUNDS, &mut derived)
            .expect("pbkdf2 output length is fixed at 32 bytes");
        keys.insert(tenant.to_string(), derived);
        derived
    }

    /// Encrypt `plaintext` for `tenant`, returning the `vault:v1:...`
    /// marker string.
    pub async fn encrypt(&self, tenant: &str, plaintext: &[u8]) -> Result<String> {
        let key_bytes = self.key_for(tenant).await;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{MARKER_PREFIX}{tenant}:{}", STANDARD.encode(blob)))
    }

    /// Decrypt a `vault:v1:...` marker previously produced for `tenant`.
    /// Rejects markers stamped with a different tenant id, even if the
    /// caller happens to hold that tenant's key.
    pub async fn decrypt(&self, tenant: &str, marker: &str) -> Result<Vec<u8>> {
        let (marker_tenant, blob_b64) = parse_marker(marker)?;
        if marker_tenant != tenant {
            return Err(VaultError::TenantMismatch {
                marker_tenant: marker_tenant.to_string(),
                requested_tenant: tenant.to_string(),
            });
        }

        let blob = STANDARD
            .decode(blob_b64)
            .map_err(|_| VaultError::MalformedMarker)?;
        if blob.len() < NONCE_LEN {
            return Err(VaultError::MalformedMarker);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

        let key_bytes = self.key_for(tenant).await;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VaultError::Decrypt(e.to_string()))
    }

    /// True if `value` looks like a marker this vault produced. Does not
    /// verify the tenant or attempt to decrypt.
    pub fn is_ciphertext(value: &str) -> bool {
        parse_marker(value).is_ok()
    }
}

fn parse_marker(marker: &str) -> Result<(&str, &str)> {
    let rest = marker.strip_prefix(MARKER_PREFIX).ok_or(VaultError::MalformedMarker)?;
    let (tenant, blob) = rest.rsplit_once(':').ok_or(VaultError::MalformedMarker)?;
    if tenant.is_empty() || blob.is_empty() {
        return Err(VaultError::MalformedMarker);
    }
    Ok((tenant, blob))
}
