//! Velero BackupStorageLocation types and syncing the registered location
//!
//! Velero's CRDs are not compiled in; locations are read and written through
//! `DynamicObject` and converted into the typed structs below. Fields this
//! engine does not own are carried through untouched so a captured spec can
//! be restored exactly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use fsbackup_common::kube_utils::{is_not_found, HasApiResource};
use fsbackup_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::config::{Backend, FileSystemConfig};
use crate::naming::{
    GATEWAY_BUCKET, GATEWAY_NAME, GATEWAY_PORT, GATEWAY_PROVIDER, HOSTPATH_PROVIDER, NFS_PROVIDER,
    PLUGIN_BUCKET,
};

/// Name Velero gives the location created at install time
pub const DEFAULT_LOCATION_NAME: &str = "default";

const CONFIG_PATH: &str = "path";
const CONFIG_SERVER: &str = "server";

// =============================================================================
// BackupStorageLocation
// =============================================================================

/// Velero BackupStorageLocation resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocation {
    /// API version
    #[serde(default = "BackupStorageLocation::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "BackupStorageLocation::default_kind")]
    pub kind: String,
    /// Resource metadata, including the resourceVersion used on update
    pub metadata: ObjectMeta,
    /// BSL specification
    pub spec: BackupStorageLocationSpec,
}

impl HasApiResource for BackupStorageLocation {
    const API_VERSION: &'static str = "velero.io/v1";
    const KIND: &'static str = "BackupStorageLocation";
}

impl BackupStorageLocation {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new BackupStorageLocation
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        spec: BackupStorageLocationSpec,
    ) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
        }
    }

    /// True if Velero uses this location when none is named
    pub fn is_default(&self) -> bool {
        self.spec.default == Some(true)
    }
}

/// BackupStorageLocation spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Object store plugin (aws, fsbackup.io/hostpath, fsbackup.io/nfs)
    pub provider: String,
    /// Object storage configuration
    pub object_storage: ObjectStorageLocation,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Credential reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<VeleroCredential>,
    /// Whether this is the default BSL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
    /// Fields this engine does not manage (accessMode, backupSyncPeriod, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Object storage configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    /// Bucket name
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Fields this engine does not manage (caCert)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Velero credential reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VeleroCredential {
    /// Name of the Kubernetes Secret
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

impl FileSystemConfig {
    /// Mount served by a plugin location; `None` for any other provider
    pub fn from_location(spec: &BackupStorageLocationSpec) -> Option<Self> {
        let path = spec.config.get(CONFIG_PATH).filter(|p| !p.is_empty());
        match spec.provider.as_str() {
            HOSTPATH_PROVIDER => path.map(|p| Self::host_path(p.clone())),
            NFS_PROVIDER => {
                let server = spec.config.get(CONFIG_SERVER).filter(|s| !s.is_empty())?;
                path.map(|p| Self::nfs(p.clone(), server.clone()))
            }
            _ => None,
        }
    }
}

/// Pick the location Velero writes to: the one flagged default, else the
/// one named `default`
pub fn select_location(locations: Vec<BackupStorageLocation>) -> Option<BackupStorageLocation> {
    let mut fallback = None;
    for location in locations {
        if location.is_default() {
            return Some(location);
        }
        if location.metadata.name.as_deref() == Some(DEFAULT_LOCATION_NAME) {
            fallback = Some(location);
        }
    }
    fallback
}

// =============================================================================
// LocationStore
// =============================================================================

/// Access to the backup engine's registered storage location
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// The location Velero currently writes to, if any
    async fn find_location(&self, namespace: &str) -> Result<Option<BackupStorageLocation>>;

    /// Replace a location; the metadata resourceVersion guards the write
    async fn update_location(&self, location: &BackupStorageLocation) -> Result<()>;
}

/// [`LocationStore`] over the Velero CRDs
pub struct VeleroLocationStore {
    client: Client,
}

impl VeleroLocationStore {
    /// Create a new VeleroLocationStore
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &BackupStorageLocation::api_resource(),
        )
    }
}

fn from_dynamic(obj: &DynamicObject) -> Result<BackupStorageLocation> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(BackupStorageLocation::KIND, e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(BackupStorageLocation::KIND, e.to_string()))
}

fn to_dynamic(location: &BackupStorageLocation) -> Result<DynamicObject> {
    let value = serde_json::to_value(location)
        .map_err(|e| Error::serialization_for_kind(BackupStorageLocation::KIND, e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(BackupStorageLocation::KIND, e.to_string()))
}

#[async_trait]
impl LocationStore for VeleroLocationStore {
    async fn find_location(&self, namespace: &str) -> Result<Option<BackupStorageLocation>> {
        let list = match self.api(namespace).list(&ListParams::default()).await {
            Ok(list) => list,
            // CRD not installed
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let locations = list
            .items
            .iter()
            .map(from_dynamic)
            .collect::<Result<Vec<_>>>()?;
        Ok(select_location(locations))
    }

    async fn update_location(&self, location: &BackupStorageLocation) -> Result<()> {
        let name = location
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("location has no metadata.name"))?;
        let namespace = location
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("location has no metadata.namespace"))?;
        self.api(namespace)
            .replace(name, &PostParams::default(), &to_dynamic(location)?)
            .await?;
        Ok(())
    }
}

// =============================================================================
// BackupLocationSync
// =============================================================================

/// Spec pointing Velero at `config` served by `backend`
///
/// `gateway_namespace` is where the gateway Service runs; it only matters
/// for [`Backend::Gateway`].
pub fn location_spec_for(
    config: &FileSystemConfig,
    backend: Backend,
    gateway_namespace: &str,
) -> BackupStorageLocationSpec {
    match backend {
        Backend::Gateway => BackupStorageLocationSpec {
            provider: GATEWAY_PROVIDER.to_string(),
            object_storage: ObjectStorageLocation {
                bucket: GATEWAY_BUCKET.to_string(),
                ..Default::default()
            },
            config: BTreeMap::from([
                ("region".to_string(), "minio".to_string()),
                ("s3ForcePathStyle".to_string(), "true".to_string()),
                (
                    "s3Url".to_string(),
                    format!("http://{}.{}:{}", GATEWAY_NAME, gateway_namespace, GATEWAY_PORT),
                ),
            ]),
            ..Default::default()
        },
        Backend::Plugin => {
            let mut settings =
                BTreeMap::from([(CONFIG_PATH.to_string(), config.path().to_string())]);
            if let FileSystemConfig::Nfs { server, .. } = config {
                settings.insert(CONFIG_SERVER.to_string(), server.clone());
            }
            BackupStorageLocationSpec {
                provider: config.plugin_provider().to_string(),
                object_storage: ObjectStorageLocation {
                    bucket: PLUGIN_BUCKET.to_string(),
                    ..Default::default()
                },
                config: settings,
                ..Default::default()
            }
        }
    }
}

/// Keeps Velero's registered location in step with the active backend
pub struct BackupLocationSync {
    store: Arc<dyn LocationStore>,
    client: Arc<dyn ClusterClient>,
    velero_namespace: String,
}

impl BackupLocationSync {
    /// Create a syncer for locations in `velero_namespace`
    pub fn new(
        store: Arc<dyn LocationStore>,
        client: Arc<dyn ClusterClient>,
        velero_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            velero_namespace: velero_namespace.into(),
        }
    }

    async fn registered(&self) -> Result<BackupStorageLocation> {
        self.store
            .find_location(&self.velero_namespace)
            .await?
            .ok_or_else(|| Error::location_not_found(self.velero_namespace.clone()))
    }

    /// Point the registered location at `config` served by `backend`
    ///
    /// Returns the spec that was replaced so a failed rollout can be undone
    /// with [`revert`](Self::revert). Fields not owned here (default flag,
    /// access mode, sync period) are kept. Credentials are kept for the
    /// gateway and dropped for the plugin, which does not use them.
    #[instrument(skip_all, fields(namespace = %gateway_namespace, %backend))]
    pub async fn sync(
        &self,
        config: &FileSystemConfig,
        backend: Backend,
        gateway_namespace: &str,
    ) -> Result<BackupStorageLocationSpec> {
        let mut location = self.registered().await?;
        let previous = location.spec.clone();

        let mut spec = location_spec_for(config, backend, gateway_namespace);
        spec.default = previous.default;
        spec.extra = previous.extra.clone();
        if backend == Backend::Gateway {
            spec.credential = previous.credential.clone();
        }

        if spec == previous {
            debug!("backup storage location already up to date");
            return Ok(previous);
        }
        location.spec = spec;
        self.store.update_location(&location).await?;
        info!(
            location = location.metadata.name.as_deref().unwrap_or_default(),
            provider = %location.spec.provider,
            "updated backup storage location"
        );
        Ok(previous)
    }

    /// Restore the registered location to a spec captured by [`sync`](Self::sync)
    #[instrument(skip_all)]
    pub async fn revert(&self, previous: &BackupStorageLocationSpec) -> Result<()> {
        let mut location = self.registered().await?;
        if &location.spec == previous {
            return Ok(());
        }
        location.spec = previous.clone();
        self.store.update_location(&location).await?;
        info!(
            location = location.metadata.name.as_deref().unwrap_or_default(),
            "reverted backup storage location"
        );
        Ok(())
    }

    /// Remove gateway objects after a move to the plugin
    ///
    /// The credentials Secret is kept so the old mount can still be
    /// recovered with the same identity.
    #[instrument(skip(self))]
    pub async fn delete_gateway(&self, namespace: &str) -> Result<()> {
        self.client.delete_deployment(namespace, GATEWAY_NAME).await?;
        self.client.delete_service(namespace, GATEWAY_NAME).await?;
        self.client.delete_config_map(namespace, GATEWAY_NAME).await?;
        info!(%namespace, "deleted gateway objects");
        Ok(())
    }
}
