//! Fixed object names, labels, data keys and ports

/// Prefix shared by every object this engine creates
pub const PREFIX: &str = "fsbackup";

/// Plugin mount descriptor ConfigMap
pub const PLUGIN_CONFIGMAP_NAME: &str = "fsbackup-fs-lvp";
/// Gateway mount descriptor ConfigMap; also the Deployment and Service name
pub const GATEWAY_NAME: &str = "fsbackup-fs-minio";
/// Gateway credentials Secret
pub const GATEWAY_SECRET_NAME: &str = "fsbackup-fs-minio-creds";
/// Private registry pull secret
pub const REGISTRY_SECRET_NAME: &str = "fsbackup-private-registry";
/// Plugin discovery ConfigMap in the Velero namespace
pub const PLUGIN_DISCOVERY_CONFIGMAP_NAME: &str = "local-volume-provider-config";

/// Mount descriptor keys
pub const KEY_HOSTPATH: &str = "HOSTPATH";
/// NFS export path key
pub const KEY_NFS_PATH: &str = "NFS_PATH";
/// NFS server key
pub const KEY_NFS_SERVER: &str = "NFS_SERVER";

/// Gateway credential keys
pub const KEY_ACCESS_KEY: &str = "MINIO_ACCESS_KEY";
/// Gateway secret key
pub const KEY_SECRET_KEY: &str = "MINIO_SECRET_KEY";

/// Port served by the gateway
pub const GATEWAY_PORT: i32 = 9000;
/// Container name inside the gateway Deployment
pub const GATEWAY_CONTAINER_NAME: &str = "minio";
/// Bucket Velero writes to on the gateway
pub const GATEWAY_BUCKET: &str = "velero";

/// Pod volume name for the mount
pub const DATA_VOLUME_NAME: &str = "data";
/// Where the mount appears inside gateway and probe containers
pub const DATA_MOUNT_PATH: &str = "/data";

/// Pod template annotation tracking the credentials content
pub const SECRET_CHECKSUM_ANNOTATION: &str = "fsbackup.io/secret-checksum";
/// Label carried by probe pods, valued with the probe kind
pub const PROBE_LABEL: &str = "fsbackup.io/probe";
/// Pod selector label for the gateway
pub const APP_LABEL: &str = "app";

/// Velero plugin config label (value is empty)
pub const VELERO_PLUGIN_CONFIG_LABEL: &str = "velero.io/plugin-config";
/// Value of the provider label marking an object store plugin config
pub const OBJECT_STORE_LABEL_VALUE: &str = "ObjectStore";

/// Velero provider for the plugin writing to a host path
pub const HOSTPATH_PROVIDER: &str = "fsbackup.io/hostpath";
/// Velero provider for the plugin writing to an NFS share
pub const NFS_PROVIDER: &str = "fsbackup.io/nfs";
/// Velero provider used when the gateway serves S3
pub const GATEWAY_PROVIDER: &str = "aws";
/// Bucket name the plugin uses; also its preserve-volumes hint
pub const PLUGIN_BUCKET: &str = "fsbackup-snapshots";
