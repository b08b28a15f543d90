//! Filesystem-backed snapshot storage for Velero
//!
//! Turns a host path or NFS export into a backup target, either behind an S3
//! gateway Deployment or through the local-volume plugin:
//!
//! - **gateway**: Reconciles the gateway ConfigMap, Secret, Deployment and
//!   Service, gated by the mount's ownership
//! - **plugin**: Reconciles the plugin mount descriptor and discovery ConfigMap
//! - **probe** / **integrity**: Short-lived pods that check, reset and mark a mount
//! - **migration**: Decides whether a mount is fresh, ours, or owned elsewhere
//! - **resolver**: Reports the configured mount and backend
//! - **velero**: BackupStorageLocation types and location sync
//! - **cluster**: The Kubernetes seam and create-or-patch upserts

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod gateway;
pub mod integrity;
pub mod migration;
pub mod naming;
pub mod plugin;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod secret;
pub mod velero;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use config::{Backend, DeployOptions, FileSystemConfig};
pub use gateway::GatewayReconciler;
pub use integrity::{MountProbes, PodMountProbes};
pub use migration::{MigrationReason, MountState};
pub use plugin::PluginConfigReconciler;
pub use probe::ProbeWorkloadRunner;
pub use registry::{ImageResolver, RegistryConfig, RegistryRewriter};
pub use resolver::StorageConfigResolver;
pub use velero::{BackupLocationSync, LocationStore, VeleroLocationStore};

pub use fsbackup_common::{EngineConfig, Error, Result};
