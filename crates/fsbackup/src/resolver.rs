//! Which mount is configured, and which backend serves it

use std::sync::Arc;

use tracing::debug;

use fsbackup_common::Result;

use crate::cluster::ClusterClient;
use crate::config::{Backend, FileSystemConfig};
use crate::naming::{GATEWAY_NAME, GATEWAY_PROVIDER, PLUGIN_CONFIGMAP_NAME};
use crate::velero::LocationStore;

/// Read-only view of the current storage configuration
pub struct StorageConfigResolver {
    client: Arc<dyn ClusterClient>,
    store: Arc<dyn LocationStore>,
    velero_namespace: String,
}

impl StorageConfigResolver {
    /// Create a resolver reading locations from `velero_namespace`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn LocationStore>,
        velero_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            velero_namespace: velero_namespace.into(),
        }
    }

    /// The configured mount, or `None` when nothing is configured yet
    ///
    /// With the plugin enabled the registered location decides the backend:
    /// a plugin location yields its own mount, a gateway location yields the
    /// gateway descriptor. Without a recognized location the plugin
    /// descriptor is tried, then the gateway descriptor. With the plugin
    /// disabled only the gateway descriptor is consulted.
    pub async fn get_current(
        &self,
        namespace: &str,
        plugin_disabled: bool,
    ) -> Result<Option<FileSystemConfig>> {
        Ok(self
            .resolve(namespace, plugin_disabled)
            .await?
            .map(|(config, _)| config))
    }

    /// The backend serving the configured mount, if any
    pub async fn current_backend(
        &self,
        namespace: &str,
        plugin_disabled: bool,
    ) -> Result<Option<Backend>> {
        Ok(self
            .resolve(namespace, plugin_disabled)
            .await?
            .map(|(_, backend)| backend))
    }

    async fn resolve(
        &self,
        namespace: &str,
        plugin_disabled: bool,
    ) -> Result<Option<(FileSystemConfig, Backend)>> {
        if !plugin_disabled {
            if let Some(location) = self.store.find_location(&self.velero_namespace).await? {
                if let Some(config) = FileSystemConfig::from_location(&location.spec) {
                    debug!(provider = %location.spec.provider, "mount taken from storage location");
                    return Ok(Some((config, Backend::Plugin)));
                }
                if location.spec.provider == GATEWAY_PROVIDER {
                    debug!("storage location points at the gateway");
                    return self.gateway_descriptor(namespace).await;
                }
            }
            if let Some(config) = self.descriptor(namespace, PLUGIN_CONFIGMAP_NAME).await? {
                return Ok(Some((config, Backend::Plugin)));
            }
        }
        self.gateway_descriptor(namespace).await
    }

    async fn gateway_descriptor(
        &self,
        namespace: &str,
    ) -> Result<Option<(FileSystemConfig, Backend)>> {
        Ok(self
            .descriptor(namespace, GATEWAY_NAME)
            .await?
            .map(|config| (config, Backend::Gateway)))
    }

    async fn descriptor(&self, namespace: &str, name: &str) -> Result<Option<FileSystemConfig>> {
        let Some(config_map) = self.client.get_config_map(namespace, name).await? else {
            return Ok(None);
        };
        let data = config_map.data.unwrap_or_default();
        FileSystemConfig::from_config_map_data(&data)
    }
}
