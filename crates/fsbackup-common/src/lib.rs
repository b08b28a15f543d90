//! Common types for fsbackup: errors, Kubernetes helpers, logging and configuration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key identifying objects managed by fsbackup
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for fsbackup-managed objects
pub const LABEL_MANAGED_BY_FSBACKUP: &str = "fsbackup";
