//! Assembly signature checks against a `<assembly>.sig` sidecar
//!
//! `Digest` only proves the sidecar was produced from the same bytes; it
//! offers no authenticity. `Ed25519` verifies a signature over the SHA-256
//! digest of the assembly with a trusted issuer key.

use super::{ValidationResult, ValidationRule};
use crate::{PluginDescriptor, PluginError, PluginResult};
use addinhost_core::config::PluginsConfig;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum SignatureScheme {
    /// Sidecar holds the SHA-256 digest of the assembly (raw or hex)
    Digest,
    /// Sidecar holds a 64-byte ed25519 signature over the digest (raw or base64)
    Ed25519 { issuer_key: VerifyingKey },
}

#[derive(Debug, Clone)]
pub struct SignatureRule {
    enabled: bool,
    scheme: SignatureScheme,
}

/// `<assembly>.sig`, next to the assembly
pub fn signature_path(assembly: &Path) -> PathBuf {
    let mut name = assembly.as_os_str().to_owned();
    name.push(".sig");
    PathBuf::from(name)
}

pub async fn assembly_digest(assembly: &Path) -> PluginResult<Vec<u8>> {
    let bytes = tokio::fs::read(assembly).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().to_vec())
}

/// Parse a base64 encoded ed25519 public key
pub fn decode_issuer_key(key_b64: &str) -> PluginResult<VerifyingKey> {
    let invalid = |reason: String| PluginError::ValidationFailed {
        plugin_id: String::new(),
        errors: vec![reason],
    };

    let key_bytes = BASE64_STANDARD
        .decode(key_b64.trim())
        .map_err(|e| invalid(format!("Invalid issuer key encoding: {e}")))?;

    let key_array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| invalid("Issuer key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_array).map_err(|e| invalid(format!("Invalid issuer key: {e}")))
}

impl SignatureRule {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scheme: SignatureScheme::Digest,
        }
    }

    pub fn digest() -> Self {
        Self {
            enabled: true,
            scheme: SignatureScheme::Digest,
        }
    }

    pub fn ed25519(issuer_key: VerifyingKey) -> Self {
        Self {
            enabled: true,
            scheme: SignatureScheme::Ed25519 { issuer_key },
        }
    }

    /// Build the rule described by the `plugins` config section
    pub fn from_config(config: &PluginsConfig) -> PluginResult<Self> {
        if !config.require_signature {
            return Ok(Self::disabled());
        }

        match config.signature_scheme.as_str() {
            "ed25519" => {
                let key = config.issuer_key.as_deref().ok_or_else(|| {
                    PluginError::ValidationFailed {
                        plugin_id: String::new(),
                        errors: vec![
                            "plugins.issuer_key is required for the ed25519 scheme".to_string(),
                        ],
                    }
                })?;
                Ok(Self::ed25519(decode_issuer_key(key)?))
            }
            _ => Ok(Self::digest()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scheme(&self) -> &SignatureScheme {
        &self.scheme
    }

    async fn check(&self, descriptor: &PluginDescriptor) -> Result<(), String> {
        let sidecar = signature_path(&descriptor.assembly_path);
        let signature = tokio::fs::read(&sidecar)
            .await
            .map_err(|_| format!("Signature file {} not found", sidecar.display()))?;

        let digest = assembly_digest(&descriptor.assembly_path)
            .await
            .map_err(|e| format!("Cannot hash assembly: {e}"))?;

        match &self.scheme {
            SignatureScheme::Digest => {
                let expected = decode_sidecar(&signature, digest.len(), |text| hex::decode(text).ok());
                if expected.as_deref() == Some(digest.as_slice()) {
                    Ok(())
                } else {
                    Err(format!(
                        "Signature of '{}' does not match assembly digest",
                        descriptor.id
                    ))
                }
            }
            SignatureScheme::Ed25519 { issuer_key } => {
                let raw = decode_sidecar(&signature, ed25519_dalek::SIGNATURE_LENGTH, |text| {
                    BASE64_STANDARD.decode(text).ok()
                })
                .ok_or_else(|| "Signature file is not a valid ed25519 signature".to_string())?;

                let sig = Signature::from_slice(&raw).map_err(|e| format!("Invalid signature: {e}"))?;
                issuer_key
                    .verify(&digest, &sig)
                    .map_err(|e| format!("Signature verification failed for '{}': {e}", descriptor.id))
            }
        }
    }
}

/// Sidecars may hold the raw bytes or a text encoding of them
fn decode_sidecar(
    contents: &[u8],
    raw_len: usize,
    decode_text: impl Fn(&str) -> Option<Vec<u8>>,
) -> Option<Vec<u8>> {
    if contents.len() == raw_len {
        return Some(contents.to_vec());
    }
    std::str::from_utf8(contents)
        .ok()
        .and_then(|text| decode_text(text.trim()))
        .filter(|decoded| decoded.len() == raw_len)
}

#[async_trait]
impl ValidationRule for SignatureRule {
    fn name(&self) -> &str {
        "signature"
    }

    async fn validate(&self, descriptor: &PluginDescriptor) -> ValidationResult {
        if !self.enabled {
            return ValidationResult::success();
        }
        match self.check(descriptor).await {
            Ok(()) => ValidationResult::success(),
            Err(error) => ValidationResult::failure(error),
        }
    }
}
