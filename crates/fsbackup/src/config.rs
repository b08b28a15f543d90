//! Mount descriptors and deploy options

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{HostPathVolumeSource, NFSVolumeSource, Volume};
use serde::{Deserialize, Serialize};

use fsbackup_common::{Error, Result};

use crate::naming::{
    DATA_VOLUME_NAME, HOSTPATH_PROVIDER, KEY_HOSTPATH, KEY_NFS_PATH, KEY_NFS_SERVER, NFS_PROVIDER,
};

/// A raw filesystem mount backing snapshot storage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FileSystemConfig {
    /// Directory on every node's filesystem
    HostPath {
        /// Absolute host path
        path: String,
    },
    /// NFS export
    Nfs {
        /// Absolute export path
        path: String,
        /// NFS server host or IP
        server: String,
    },
}

impl FileSystemConfig {
    /// Host path config
    pub fn host_path(path: impl Into<String>) -> Self {
        Self::HostPath { path: path.into() }
    }

    /// NFS config
    pub fn nfs(path: impl Into<String>, server: impl Into<String>) -> Self {
        Self::Nfs {
            path: path.into(),
            server: server.into(),
        }
    }

    /// Directory on the mount, used in operator-facing messages
    pub fn path(&self) -> &str {
        match self {
            Self::HostPath { path } | Self::Nfs { path, .. } => path,
        }
    }

    /// Velero provider id when the plugin serves this mount
    pub fn plugin_provider(&self) -> &'static str {
        match self {
            Self::HostPath { .. } => HOSTPATH_PROVIDER,
            Self::Nfs { .. } => NFS_PROVIDER,
        }
    }

    /// Reject empty or relative paths and empty servers
    pub fn validate(&self) -> Result<()> {
        let path = self.path();
        if path.is_empty() {
            return Err(Error::validation_for_field("path", "must not be empty"));
        }
        if !path.starts_with('/') {
            return Err(Error::validation_for_field(
                "path",
                format!("{} must be an absolute path", path),
            ));
        }
        if let Self::Nfs { server, .. } = self {
            if server.trim().is_empty() {
                return Err(Error::validation_for_field("server", "must not be empty"));
            }
        }
        Ok(())
    }

    /// ConfigMap data describing this mount
    pub fn to_config_map_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        match self {
            Self::HostPath { path } => {
                data.insert(KEY_HOSTPATH.to_string(), path.clone());
            }
            Self::Nfs { path, server } => {
                data.insert(KEY_NFS_PATH.to_string(), path.clone());
                data.insert(KEY_NFS_SERVER.to_string(), server.clone());
            }
        }
        data
    }

    /// Inverse of [`to_config_map_data`](Self::to_config_map_data)
    ///
    /// Empty data means nothing was ever configured. An NFS path without a
    /// server (or the reverse) is a malformed descriptor.
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> Result<Option<Self>> {
        if let Some(path) = data.get(KEY_HOSTPATH).filter(|p| !p.is_empty()) {
            return Ok(Some(Self::host_path(path.clone())));
        }
        let nfs_path = data.get(KEY_NFS_PATH).filter(|p| !p.is_empty());
        let nfs_server = data.get(KEY_NFS_SERVER).filter(|s| !s.is_empty());
        match (nfs_path, nfs_server) {
            (Some(path), Some(server)) => Ok(Some(Self::nfs(path.clone(), server.clone()))),
            (None, None) => Ok(None),
            _ => Err(Error::validation(format!(
                "mount descriptor must set both {} and {}",
                KEY_NFS_PATH, KEY_NFS_SERVER
            ))),
        }
    }

    /// Pod volume for this mount, named [`DATA_VOLUME_NAME`]
    pub fn volume(&self) -> Volume {
        match self {
            Self::HostPath { path } => Volume {
                name: DATA_VOLUME_NAME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: path.clone(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            },
            Self::Nfs { path, server } => Volume {
                name: DATA_VOLUME_NAME.to_string(),
                nfs: Some(NFSVolumeSource {
                    path: path.clone(),
                    server: server.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for FileSystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostPath { path } => write!(f, "host path {}", path),
            Self::Nfs { path, server } => write!(f, "NFS {}:{}", server, path),
        }
    }
}

/// Which strategy serves snapshot storage for a mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
    /// S3 gateway Deployment in front of the mount
    Gateway,
    /// Local-volume plugin writing to the mount directly
    Plugin,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway => f.write_str("gateway"),
            Self::Plugin => f.write_str("plugin"),
        }
    }
}

/// Inputs to a deploy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOptions {
    /// Namespace the gateway or plugin descriptor lives in
    pub namespace: String,
    /// Platform-assigned UIDs; no pod security context is set
    pub is_openshift: bool,
    /// The only switch that authorizes a destructive reset
    pub force_reset: bool,
    /// Mount to provision
    pub file_system_config: FileSystemConfig,
}

impl DeployOptions {
    /// Options with no reset authorization on a non-OpenShift cluster
    pub fn new(namespace: impl Into<String>, file_system_config: FileSystemConfig) -> Self {
        Self {
            namespace: namespace.into(),
            is_openshift: false,
            force_reset: false,
            file_system_config,
        }
    }

    /// Same options with `force_reset` set
    pub fn with_force_reset(mut self, force_reset: bool) -> Self {
        self.force_reset = force_reset;
        self
    }

    /// Same options with `is_openshift` set
    pub fn with_openshift(mut self, is_openshift: bool) -> Self {
        self.is_openshift = is_openshift;
        self
    }
}
