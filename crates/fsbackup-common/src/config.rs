//! Engine configuration
//!
//! Loaded from YAML with every field defaulted, then overridden from
//! `FSBACKUP_*` environment variables:
//!
//! ```yaml
//! gatewayImage: minio/minio:RELEASE.2024-08-03T04-33-23Z
//! probeTimeoutSecs: 180
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding [`EngineConfig::gateway_image`]
pub const ENV_GATEWAY_IMAGE: &str = "FSBACKUP_GATEWAY_IMAGE";
/// Environment variable overriding [`EngineConfig::probe_image`]
pub const ENV_PROBE_IMAGE: &str = "FSBACKUP_PROBE_IMAGE";
/// Environment variable overriding [`EngineConfig::probe_timeout_secs`]
pub const ENV_PROBE_TIMEOUT_SECS: &str = "FSBACKUP_PROBE_TIMEOUT_SECS";

/// Tunables for the storage engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// S3 gateway image (before registry rewriting)
    pub gateway_image: String,
    /// Image carrying the probe entrypoint scripts
    pub probe_image: String,
    /// Fileserver image handed to the local-volume plugin
    pub plugin_fileserver_image: String,
    /// Upper bound on a single probe pod run
    pub probe_timeout_secs: u64,
    /// Interval between cluster API polls
    pub poll_interval_secs: u64,
    /// UID for the gateway, probes and plugin fileserver
    pub run_as_user: i64,
    /// fsGroup for the gateway, probes and plugin fileserver
    pub fs_group: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway_image: "minio/minio:RELEASE.2024-08-03T04-33-23Z".to_string(),
            probe_image: "fsbackup/fs-probe:0.1.0".to_string(),
            plugin_fileserver_image: "replicated/local-volume-fileserver:v0.6.0".to_string(),
            probe_timeout_secs: 120,
            poll_interval_secs: 1,
            run_as_user: 1001,
            fs_group: 1001,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("EngineConfig", e.to_string()))
    }

    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|e| {
                    Error::validation(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&data)?
            }
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `FSBACKUP_*` overrides using `lookup` to read variables
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup(ENV_GATEWAY_IMAGE) {
            self.gateway_image = image;
        }
        if let Some(image) = lookup(ENV_PROBE_IMAGE) {
            self.probe_image = image;
        }
        if let Some(secs) = lookup(ENV_PROBE_TIMEOUT_SECS) {
            self.probe_timeout_secs = secs.parse().map_err(|_| {
                Error::validation_for_field(
                    ENV_PROBE_TIMEOUT_SECS,
                    format!("expected whole seconds, got {:?}", secs),
                )
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.gateway_image.is_empty() {
            return Err(Error::validation_for_field("gatewayImage", "must not be empty"));
        }
        if self.probe_image.is_empty() {
            return Err(Error::validation_for_field("probeImage", "must not be empty"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "probeTimeoutSecs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Probe timeout as a `Duration`
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
