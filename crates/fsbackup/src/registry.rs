//! Private registry support for airgapped clusters
//!
//! Images are rewritten onto the override registry and, when credentials are
//! supplied, a `kubernetes.io/dockerconfigjson` pull secret is upserted next
//! to the workloads that need it.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fsbackup_common::Error;

use crate::cluster::{managed_labels, ClusterClient};
use crate::naming::REGISTRY_SECRET_NAME;

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Private registry settings; all empty means public images are used as is
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Registry host (and optional port) replacing the image's registry
    pub override_registry: Option<String>,
    /// Repository namespace inserted between registry and image name
    pub override_namespace: Option<String>,
    /// Registry username
    pub username: Option<String>,
    /// Registry password
    pub password: Option<String>,
}

impl RegistryConfig {
    fn credentials(&self) -> Option<(&str, &str, &str)> {
        let registry = self.override_registry.as_deref().filter(|r| !r.is_empty())?;
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        let password = self.password.as_deref()?;
        Some((registry, username, password))
    }

    /// Name of the pull secret workloads should reference, if any
    pub fn pull_secret_name(&self) -> Option<&'static str> {
        self.credentials().map(|_| REGISTRY_SECRET_NAME)
    }
}

/// Maps an upstream image reference to the reference pods should pull
#[cfg_attr(test, automock)]
pub trait ImageResolver: Send + Sync {
    /// Final image reference for `image` under `registry`
    fn resolve(&self, image: &str, registry: &RegistryConfig) -> String;
}

/// Rewrites `<registry>/<repo>/<name>:<tag>` onto the override registry
///
/// Only the last path component of the upstream reference is kept, so
/// `minio/minio:RELEASE.x` under `registry.corp/airgap` becomes
/// `registry.corp/airgap/minio:RELEASE.x`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegistryRewriter;

impl ImageResolver for RegistryRewriter {
    fn resolve(&self, image: &str, registry: &RegistryConfig) -> String {
        let Some(host) = registry
            .override_registry
            .as_deref()
            .map(|r| r.trim_end_matches('/'))
            .filter(|r| !r.is_empty())
        else {
            return image.to_string();
        };
        let name = image.rsplit('/').next().unwrap_or(image);
        match registry
            .override_namespace
            .as_deref()
            .map(|ns| ns.trim_matches('/'))
            .filter(|ns| !ns.is_empty())
        {
            Some(ns) => format!("{}/{}/{}", host, ns, name),
            None => format!("{}/{}", host, name),
        }
    }
}

/// Pull secret for `registry`, or `None` when no credentials are configured
pub fn build_pull_secret(
    registry: &RegistryConfig,
    namespace: &str,
) -> Result<Option<Secret>, Error> {
    let Some((host, username, password)) = registry.credentials() else {
        return Ok(None);
    };
    let auth = STANDARD.encode(format!("{}:{}", username, password));
    let config = json!({
        "auths": {
            host: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });
    let payload = serde_json::to_vec(&config)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;

    Ok(Some(Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    }))
}

/// Create or refresh the registry pull secret
///
/// Returns the secret name to reference from pod specs, or `None` when no
/// credentials were supplied (nothing is written in that case).
pub async fn ensure_pull_secret(
    client: &dyn ClusterClient,
    namespace: &str,
    registry: &RegistryConfig,
) -> Result<Option<&'static str>, Error> {
    let Some(desired) = build_pull_secret(registry, namespace)? else {
        return Ok(None);
    };

    match client.get_secret(namespace, REGISTRY_SECRET_NAME).await? {
        None => {
            client.create_secret(namespace, &desired).await?;
            info!(secret = REGISTRY_SECRET_NAME, %namespace, "created registry pull secret");
        }
        Some(existing) if existing.data == desired.data && existing.type_ == desired.type_ => {
            debug!(secret = REGISTRY_SECRET_NAME, "registry pull secret unchanged");
        }
        Some(existing) => {
            let mut updated = existing;
            updated.data = desired.data;
            updated.type_ = desired.type_;
            client.replace_secret(namespace, &updated).await?;
            info!(secret = REGISTRY_SECRET_NAME, %namespace, "updated registry pull secret");
        }
    }
    Ok(Some(REGISTRY_SECRET_NAME))
}
