//! Gateway credentials and the mount fingerprint derived from them

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;

use fsbackup_common::kube_utils::{deterministic_hash, sha256_hex};
use fsbackup_common::{Error, Result};

use crate::cluster::managed_labels;
use crate::naming::{GATEWAY_SECRET_NAME, KEY_ACCESS_KEY, KEY_SECRET_KEY};

/// Access key used for every gateway instance
pub const GATEWAY_ACCESS_KEY: &str = "fsbackup";

const SECRET_KEY_BYTES: usize = 32;

/// Access/secret key pair served by the gateway
#[derive(Clone, PartialEq, Eq)]
pub struct GatewaySecret {
    /// Fixed access key
    pub access_key: String,
    /// Random per-mount secret key
    pub secret_key: String,
}

impl fmt::Debug for GatewaySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySecret")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl GatewaySecret {
    /// Generate a fresh secret key from the system CSPRNG
    pub fn generate() -> Result<Self> {
        let mut raw = [0u8; SECRET_KEY_BYTES];
        aws_lc_rs::rand::fill(&mut raw).map_err(|_| {
            Error::internal_with_context("gateway_secret", "system random generator unavailable")
        })?;
        Ok(Self {
            access_key: GATEWAY_ACCESS_KEY.to_string(),
            secret_key: URL_SAFE_NO_PAD.encode(raw),
        })
    }

    /// Read the key pair out of a cluster Secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let read = |key: &str| -> Result<String> {
            let data = secret.data.as_ref().and_then(|d| d.get(key)).ok_or_else(|| {
                Error::validation(format!("secret {} is missing key {}", GATEWAY_SECRET_NAME, key))
            })?;
            String::from_utf8(data.0.clone()).map_err(|_| {
                Error::serialization_for_kind("Secret", format!("{} is not valid UTF-8", key))
            })
        };
        Ok(Self {
            access_key: read(KEY_ACCESS_KEY)?,
            secret_key: read(KEY_SECRET_KEY)?,
        })
    }

    /// Cluster Secret holding this key pair
    pub fn to_secret(&self, namespace: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            KEY_ACCESS_KEY.to_string(),
            ByteString(self.access_key.as_bytes().to_vec()),
        );
        data.insert(
            KEY_SECRET_KEY.to_string(),
            ByteString(self.secret_key.as_bytes().to_vec()),
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(GATEWAY_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Fingerprint the *mark* probe persists on the mount
    pub fn fingerprint(&self) -> MountFingerprint {
        MountFingerprint::of(&self.access_key, &self.secret_key)
    }
}

/// Checksum over a Secret's data, for the gateway pod template annotation
///
/// Only `data` is hashed, so metadata churn from the API server does not
/// roll the Deployment.
pub fn secret_data_checksum(secret: &Secret) -> Result<String> {
    let data = secret.data.clone().unwrap_or_default();
    let marshaled = serde_json::to_string(&data)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
    Ok(deterministic_hash(&marshaled))
}

/// One-way hash of the access/secret key pair owning a mount
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MountFingerprint(String);

impl MountFingerprint {
    /// SHA-256 hex of the concatenated key pair
    pub fn of(access_key: &str, secret_key: &str) -> Self {
        let mut input = String::with_capacity(access_key.len() + secret_key.len());
        input.push_str(access_key);
        input.push_str(secret_key);
        Self(sha256_hex(input.as_bytes()))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if a fingerprint read back from a mount matches
    pub fn matches(&self, recorded: &str) -> bool {
        self.0 == recorded.trim()
    }
}

impl fmt::Display for MountFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
