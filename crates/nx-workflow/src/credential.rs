//! Credential Store
//!
//! Tenant-scoped connector credentials encrypted at rest with AES-256-GCM
//! (base64 key, random nonce per secret). Storage only ever holds
//! ciphertext; `decrypt` hands the plaintext to exactly one adapter
//! invocation and nothing else retains it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Result, WorkflowError};

const NONCE_LEN: usize = 12;

/// A stored credential. The secret is ciphertext; cleartext never leaves
/// `decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub tenant_id: String,
    pub connector_type: String,
    pub encrypted_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

pub struct CredentialStore {
    cipher: Aes256Gcm,
    credentials: DashMap<(String, String), Credential>,
}

impl CredentialStore {
    /// `encryption_key` is a base64-encoded 32-byte key.
    pub fn new(encryption_key: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(encryption_key)
            .map_err(|e| WorkflowError::Credential(format!("invalid base64 key: {}", e)))?;
        if key_bytes.len() != 32 {
            return Err(WorkflowError::Credential(format!(
                "key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| WorkflowError::Credential(e.to_string()))?;
        Ok(Self {
            cipher,
            credentials: DashMap::new(),
        })
    }

    /// Generate a fresh random key, base64-encoded (dev mode bootstrap).
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt and store a secret.
    pub fn put(
        &self,
        tenant_id: &str,
        id: &str,
        connector_type: &str,
        secret: &str,
        scopes: Vec<String>,
    ) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, secret.as_bytes())
            .map_err(|e| WorkflowError::Credential(format!("encrypt: {}", e)))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);

        self.credentials.insert(
            (tenant_id.to_string(), id.to_string()),
            Credential {
                id: id.to_string(),
                tenant_id: tenant_id.to_string(),
                connector_type: connector_type.to_string(),
                encrypted_secret: BASE64.encode(blob),
                scopes,
            },
        );
        Ok(())
    }

    pub fn contains(&self, tenant_id: &str, id: &str) -> bool {
        self.credentials
            .contains_key(&(tenant_id.to_string(), id.to_string()))
    }

    /// Metadata only; never returns the secret.
    pub fn get(&self, tenant_id: &str, id: &str) -> Option<Credential> {
        self.credentials
            .get(&(tenant_id.to_string(), id.to_string()))
            .map(|c| c.clone())
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> bool {
        self.credentials
            .remove(&(tenant_id.to_string(), id.to_string()))
            .is_some()
    }

    /// Decrypt for one adapter invocation.
    pub fn decrypt(&self, tenant_id: &str, id: &str) -> Result<String> {
        let credential = self
            .get(tenant_id, id)
            .ok_or_else(|| WorkflowError::Credential(format!("unknown credential '{}'", id)))?;

        let blob = BASE64
            .decode(&credential.encrypted_secret)
            .map_err(|e| WorkflowError::Credential(format!("corrupt ciphertext: {}", e)))?;
        if blob.len() < NONCE_LEN {
            return Err(WorkflowError::Credential("corrupt ciphertext".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| WorkflowError::Credential(format!("decrypt: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| WorkflowError::Credential(format!("secret is not UTF-8: {}", e)))
    }
}
