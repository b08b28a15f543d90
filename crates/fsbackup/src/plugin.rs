//! Local-volume plugin configuration
//!
//! The plugin backend needs two objects: the mount descriptor next to the
//! application, and the plugin's discovery ConfigMap in the Velero namespace
//! telling it which UID/GID to run its fileserver as.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use tracing::{debug, info, instrument};

use fsbackup_common::{EngineConfig, Error};

use crate::cluster::{ensure_config_map, managed_labels, ClusterClient};
use crate::config::DeployOptions;
use crate::naming::{
    HOSTPATH_PROVIDER, NFS_PROVIDER, OBJECT_STORE_LABEL_VALUE, PLUGIN_BUCKET,
    PLUGIN_CONFIGMAP_NAME, PLUGIN_DISCOVERY_CONFIGMAP_NAME, VELERO_PLUGIN_CONFIG_LABEL,
};

const KEY_RUN_AS_USER: &str = "securityContextRunAsUser";
const KEY_FS_GROUP: &str = "securityContextFsGroup";
const KEY_PRESERVE_VOLUMES: &str = "preserveVolumes";
const KEY_FILESERVER_IMAGE: &str = "fileserverImage";

/// Mount descriptor ConfigMap for the plugin backend
pub fn build_descriptor(opts: &DeployOptions) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(PLUGIN_CONFIGMAP_NAME.to_string()),
            namespace: Some(opts.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        data: Some(opts.file_system_config.to_config_map_data()),
        ..Default::default()
    }
}

fn discovery_data(config: &EngineConfig, image: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (KEY_RUN_AS_USER.to_string(), config.run_as_user.to_string()),
        (KEY_FS_GROUP.to_string(), config.fs_group.to_string()),
        (KEY_PRESERVE_VOLUMES.to_string(), PLUGIN_BUCKET.to_string()),
        (KEY_FILESERVER_IMAGE.to_string(), image.to_string()),
    ])
}

fn other_provider(provider: &str) -> &'static str {
    if provider == HOSTPATH_PROVIDER {
        NFS_PROVIDER
    } else {
        HOSTPATH_PROVIDER
    }
}

/// Reconciles plugin configuration for a mount
pub struct PluginConfigReconciler {
    client: Arc<dyn ClusterClient>,
    config: EngineConfig,
}

impl PluginConfigReconciler {
    /// Create a reconciler
    pub fn new(client: Arc<dyn ClusterClient>, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Upsert the mount descriptor and, where applicable, the plugin
    /// discovery ConfigMap
    ///
    /// The discovery ConfigMap is skipped on OpenShift (the platform assigns
    /// UIDs) and when the Velero namespace is unknown.
    #[instrument(skip_all, fields(namespace = %opts.namespace))]
    pub async fn ensure(
        &self,
        opts: &DeployOptions,
        velero_namespace: Option<&str>,
        image: &str,
    ) -> Result<(), Error> {
        opts.file_system_config.validate()?;
        let client = self.client.as_ref();
        ensure_config_map(client, &opts.namespace, &build_descriptor(opts)).await?;

        if opts.is_openshift {
            debug!("openshift assigns plugin UIDs; skipping discovery configmap");
            return Ok(());
        }
        let Some(velero_namespace) = velero_namespace else {
            debug!("velero namespace unknown; skipping discovery configmap");
            return Ok(());
        };

        let provider = opts.file_system_config.plugin_provider();
        let labeled = client
            .list_config_maps(velero_namespace, VELERO_PLUGIN_CONFIG_LABEL)
            .await?
            .into_iter()
            .find(|cm| {
                cm.metadata.labels.as_ref().is_some_and(|labels| {
                    labels.contains_key(HOSTPATH_PROVIDER) || labels.contains_key(NFS_PROVIDER)
                })
            });
        // an unlabeled ConfigMap may already hold the well-known name
        let existing = match labeled {
            Some(cm) => Some(cm),
            None => {
                client
                    .get_config_map(velero_namespace, PLUGIN_DISCOVERY_CONFIGMAP_NAME)
                    .await?
            }
        };

        let data = discovery_data(&self.config, image);
        match existing {
            None => {
                let mut labels = managed_labels();
                labels.insert(VELERO_PLUGIN_CONFIG_LABEL.to_string(), String::new());
                labels.insert(provider.to_string(), OBJECT_STORE_LABEL_VALUE.to_string());
                let desired = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(PLUGIN_DISCOVERY_CONFIGMAP_NAME.to_string()),
                        namespace: Some(velero_namespace.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                client.create_config_map(velero_namespace, &desired).await?;
                info!(
                    configmap = PLUGIN_DISCOVERY_CONFIGMAP_NAME,
                    %velero_namespace,
                    "created plugin discovery configmap"
                );
            }
            Some(existing) => {
                let mut updated = existing.clone();
                let labels = updated.metadata.labels.get_or_insert_with(Default::default);
                labels.remove(other_provider(provider));
                labels.insert(VELERO_PLUGIN_CONFIG_LABEL.to_string(), String::new());
                labels.insert(provider.to_string(), OBJECT_STORE_LABEL_VALUE.to_string());
                updated
                    .data
                    .get_or_insert_with(Default::default)
                    .extend(data);

                if updated == existing {
                    debug!("plugin discovery configmap unchanged");
                    return Ok(());
                }
                client.replace_config_map(velero_namespace, &updated).await?;
                info!(
                    configmap = updated.metadata.name.as_deref().unwrap_or_default(),
                    %velero_namespace,
                    "updated plugin discovery configmap"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileSystemConfig;
    use crate::testing::FakeCluster;

    const APP_NS: &str = "app";
    const VELERO_NS: &str = "velero";
    const IMAGE: &str = "replicated/local-volume-fileserver:v0.6.0";

    fn reconciler(cluster: Arc<FakeCluster>) -> PluginConfigReconciler {
        PluginConfigReconciler::new(cluster, EngineConfig::default())
    }

    #[tokio::test]
    async fn creates_descriptor_and_discovery_configmap() {
        let cluster = Arc::new(FakeCluster::new());
        let opts = DeployOptions::new(APP_NS, FileSystemConfig::host_path("/data/snapshots"));

        reconciler(cluster.clone())
            .ensure(&opts, Some(VELERO_NS), IMAGE)
            .await
            .unwrap();

        let descriptor = cluster.config_map(APP_NS, PLUGIN_CONFIGMAP_NAME).unwrap();
        assert_eq!(descriptor.data.unwrap()["HOSTPATH"], "/data/snapshots");

        let discovery = cluster
            .config_map(VELERO_NS, PLUGIN_DISCOVERY_CONFIGMAP_NAME)
            .unwrap();
        let labels = discovery.metadata.labels.unwrap();
        assert_eq!(labels[VELERO_PLUGIN_CONFIG_LABEL], "");
        assert_eq!(labels[HOSTPATH_PROVIDER], OBJECT_STORE_LABEL_VALUE);
        let data = discovery.data.unwrap();
        assert_eq!(data[KEY_RUN_AS_USER], "1001");
        assert_eq!(data[KEY_FS_GROUP], "1001");
        assert_eq!(data[KEY_PRESERVE_VOLUMES], PLUGIN_BUCKET);
        assert_eq!(data[KEY_FILESERVER_IMAGE], IMAGE);
    }

    #[tokio::test]
    async fn openshift_and_unknown_velero_namespace_only_write_descriptor() {
        for (openshift, velero) in [(true, Some(VELERO_NS)), (false, None)] {
            let cluster = Arc::new(FakeCluster::new());
            let opts = DeployOptions::new(APP_NS, FileSystemConfig::host_path("/data"))
                .with_openshift(openshift);
            reconciler(cluster.clone())
                .ensure(&opts, velero, IMAGE)
                .await
                .unwrap();
            assert_eq!(
                cluster.writes(),
                vec![format!("create ConfigMap {}/{}", APP_NS, PLUGIN_CONFIGMAP_NAME)]
            );
        }
    }

    #[tokio::test]
    async fn switching_provider_relabels_existing_configmap_in_place() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_config_map(
            VELERO_NS,
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some("custom-lvp-config".to_string()),
                    labels: Some(BTreeMap::from([
                        (VELERO_PLUGIN_CONFIG_LABEL.to_string(), String::new()),
                        (HOSTPATH_PROVIDER.to_string(), OBJECT_STORE_LABEL_VALUE.to_string()),
                    ])),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([("extra".to_string(), "kept".to_string())])),
                ..Default::default()
            },
        );
        let opts = DeployOptions::new(APP_NS, FileSystemConfig::nfs("/exports", "nfs.local"));

        reconciler(cluster.clone())
            .ensure(&opts, Some(VELERO_NS), IMAGE)
            .await
            .unwrap();

        assert!(cluster
            .config_map(VELERO_NS, PLUGIN_DISCOVERY_CONFIGMAP_NAME)
            .is_none());
        let updated = cluster.config_map(VELERO_NS, "custom-lvp-config").unwrap();
        let labels = updated.metadata.labels.unwrap();
        assert!(!labels.contains_key(HOSTPATH_PROVIDER));
        assert_eq!(labels[NFS_PROVIDER], OBJECT_STORE_LABEL_VALUE);
        let data = updated.data.unwrap();
        assert_eq!(data["extra"], "kept");
        assert_eq!(data[KEY_FILESERVER_IMAGE], IMAGE);
    }

    #[tokio::test]
    async fn unlabeled_configmap_with_discovery_name_is_adopted() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_config_map(
            VELERO_NS,
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(PLUGIN_DISCOVERY_CONFIGMAP_NAME.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([("extra".to_string(), "kept".to_string())])),
                ..Default::default()
            },
        );
        let opts = DeployOptions::new(APP_NS, FileSystemConfig::host_path("/data"));

        reconciler(cluster.clone())
            .ensure(&opts, Some(VELERO_NS), IMAGE)
            .await
            .unwrap();

        assert!(cluster.writes().contains(&format!(
            "replace ConfigMap {}/{}",
            VELERO_NS, PLUGIN_DISCOVERY_CONFIGMAP_NAME
        )));
        let adopted = cluster
            .config_map(VELERO_NS, PLUGIN_DISCOVERY_CONFIGMAP_NAME)
            .unwrap();
        let labels = adopted.metadata.labels.unwrap();
        assert_eq!(labels[VELERO_PLUGIN_CONFIG_LABEL], "");
        assert_eq!(labels[HOSTPATH_PROVIDER], OBJECT_STORE_LABEL_VALUE);
        let data = adopted.data.unwrap();
        assert_eq!(data["extra"], "kept");
        assert_eq!(data[KEY_RUN_AS_USER], "1001");
    }

    #[tokio::test]
    async fn repeated_ensure_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new());
        let opts = DeployOptions::new(APP_NS, FileSystemConfig::nfs("/exports", "nfs.local"));
        let plugin = reconciler(cluster.clone());

        plugin.ensure(&opts, Some(VELERO_NS), IMAGE).await.unwrap();
        let writes = cluster.write_count();
        plugin.ensure(&opts, Some(VELERO_NS), IMAGE).await.unwrap();
        assert_eq!(cluster.write_count(), writes);
    }

    #[tokio::test]
    async fn unrelated_plugin_configs_are_ignored() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed_config_map(
            VELERO_NS,
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some("restic-config".to_string()),
                    labels: Some(BTreeMap::from([
                        (VELERO_PLUGIN_CONFIG_LABEL.to_string(), String::new()),
                        ("velero.io/restic".to_string(), "RestoreItemAction".to_string()),
                    ])),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let opts = DeployOptions::new(APP_NS, FileSystemConfig::host_path("/data"));

        reconciler(cluster.clone())
            .ensure(&opts, Some(VELERO_NS), IMAGE)
            .await
            .unwrap();

        assert!(cluster
            .config_map(VELERO_NS, PLUGIN_DISCOVERY_CONFIGMAP_NAME)
            .is_some());
        assert!(cluster
            .config_map(VELERO_NS, "restic-config")
            .unwrap()
            .data
            .is_none());
    }
}
