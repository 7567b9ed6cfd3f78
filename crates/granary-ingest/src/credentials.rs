//! Provider credential resolution
//!
//! Encrypted providers carry base64 RSA (PKCS#1 v1.5) ciphertexts for their
//! username and password. The stack key and any provider SSH keys live under
//! `{stack}/crypto/` in the internal bucket.

use crate::error::{IngestError, Result};
use crate::models::Provider;
use crate::storage::ObjectStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const STACK_KEY_NAME: &str = "private.pem";

/// Plaintext credentials for opening a transport session
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM text of an SSH private key
    pub private_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Parse an RSA private key in PKCS#8 or PKCS#1 PEM form
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| IngestError::Auth(format!("Invalid RSA private key: {}", e)))
}

/// Decrypt one base64 ciphertext with the stack key
pub fn decrypt(key: &RsaPrivateKey, ciphertext_b64: &str) -> Result<String> {
    let ciphertext = STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|e| IngestError::Auth(format!("Credential is not valid base64: {}", e)))?;
    let plaintext = key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(|e| IngestError::Auth(format!("Failed to decrypt credential: {}", e)))?;
    String::from_utf8(plaintext)
        .map_err(|_| IngestError::Auth("Decrypted credential is not UTF-8".to_string()))
}

pub struct CredentialResolver {
    store: Arc<dyn ObjectStore>,
    internal_bucket: String,
    stack: String,
    stack_key: OnceCell<RsaPrivateKey>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn ObjectStore>, internal_bucket: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            store,
            internal_bucket: internal_bucket.into(),
            stack: stack.into(),
            stack_key: OnceCell::new(),
        }
    }

    /// Use a key given directly instead of loading it from the store
    pub fn with_stack_key(self, key: RsaPrivateKey) -> Self {
        Self {
            stack_key: OnceCell::new_with(Some(key)),
            ..self
        }
    }

    fn crypto_key(&self, name: &str) -> String {
        format!("{}/crypto/{}", self.stack, name)
    }

    async fn stack_key(&self) -> Result<&RsaPrivateKey> {
        self.stack_key
            .get_or_try_init(|| async {
                let key = self.crypto_key(STACK_KEY_NAME);
                debug!(bucket = %self.internal_bucket, key = %key, "Loading stack private key");
                let pem = self
                    .store
                    .get(&self.internal_bucket, &key)
                    .await
                    .map_err(|e| IngestError::Auth(format!("Stack key unavailable: {}", e)))?;
                let pem = String::from_utf8(pem)
                    .map_err(|_| IngestError::Auth("Stack key is not UTF-8".to_string()))?;
                parse_private_key(&pem)
            })
            .await
    }

    pub async fn resolve(&self, provider: &Provider) -> Result<Credentials> {
        let mut credentials = Credentials {
            username: provider.username.clone(),
            password: provider.password.clone(),
            private_key: None,
        };

        if provider.encrypted {
            let key = self.stack_key().await?;
            credentials.username = provider
                .username
                .as_deref()
                .map(|u| decrypt(key, u))
                .transpose()?;
            credentials.password = provider
                .password
                .as_deref()
                .map(|p| decrypt(key, p))
                .transpose()?;
        }

        if let Some(name) = &provider.private_key {
            let pem = self
                .store
                .get(&self.internal_bucket, &self.crypto_key(name))
                .await
                .map_err(|e| IngestError::Auth(format!("Provider key {} unavailable: {}", name, e)))?;
            credentials.private_key = Some(
                String::from_utf8(pem)
                    .map_err(|_| IngestError::Auth(format!("Provider key {} is not UTF-8", name)))?,
            );
        }

        Ok(credentials)
    }
}
