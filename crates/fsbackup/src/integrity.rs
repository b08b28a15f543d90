//! Check, reset and mark probes over a mount
//!
//! *check* reports what is on the mount without changing it. *reset* wipes
//! gateway state so a new owner can initialize it. *mark* records the
//! fingerprint of the credentials now owning it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use fsbackup_common::{EngineConfig, Error};

use crate::config::DeployOptions;
use crate::probe::{parse_first_json_line, ProbeKind, ProbeSpec, ProbeWorkloadRunner};
use crate::registry::{ImageResolver, RegistryConfig};
use crate::secret::MountFingerprint;

/// Result of the *check* probe
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CheckOutput {
    /// Gateway state directory exists on the mount
    #[serde(rename = "hasMinioConfig")]
    pub has_gateway_config: bool,
    /// Fingerprint recorded by the last *mark*; empty when never marked
    #[serde(rename = "minioKeysSHA", default)]
    pub keys_fingerprint: String,
    /// The probe could create files on the mount
    #[serde(default)]
    pub writable: bool,
}

/// Result of the *reset* and *mark* probes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct StatusOutput {
    /// The probe did what it was asked
    pub success: bool,
}

/// The probe protocol
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MountProbes: Send + Sync {
    /// Inspect the mount without mutating it
    async fn check(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> Result<CheckOutput, Error>;

    /// Delete gateway state on the mount
    async fn reset(&self, opts: &DeployOptions, registry: &RegistryConfig) -> Result<(), Error>;

    /// Persist `fingerprint` on the mount
    async fn mark(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
        fingerprint: &MountFingerprint,
    ) -> Result<(), Error>;
}

/// [`MountProbes`] backed by probe pods
pub struct PodMountProbes {
    runner: ProbeWorkloadRunner,
    images: Arc<dyn ImageResolver>,
    probe_image: String,
}

impl PodMountProbes {
    /// Probes running `config.probe_image` through `runner`
    pub fn new(
        runner: ProbeWorkloadRunner,
        images: Arc<dyn ImageResolver>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            runner,
            images,
            probe_image: config.probe_image.clone(),
        }
    }

    fn spec(
        &self,
        kind: ProbeKind,
        args: Vec<String>,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> ProbeSpec {
        ProbeSpec {
            kind,
            args,
            namespace: opts.namespace.clone(),
            file_system_config: opts.file_system_config.clone(),
            is_openshift: opts.is_openshift,
            image: self.images.resolve(&self.probe_image, registry),
            image_pull_secret: registry.pull_secret_name().map(str::to_string),
        }
    }

    async fn run_status(&self, spec: ProbeSpec) -> Result<(), Error> {
        let kind = spec.kind;
        let run = self.runner.run(&spec).await?;
        let status: StatusOutput = parse_first_json_line(&run.logs)?;
        if !status.success {
            return Err(Error::actionable(format!(
                "{} of {} did not succeed: {}",
                kind.as_str(),
                spec.file_system_config,
                run.logs.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MountProbes for PodMountProbes {
    #[instrument(skip_all, fields(namespace = %opts.namespace))]
    async fn check(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> Result<CheckOutput, Error> {
        let spec = self.spec(ProbeKind::Check, vec![], opts, registry);
        let run = self.runner.run(&spec).await?;
        parse_first_json_line(&run.logs)
    }

    #[instrument(skip_all, fields(namespace = %opts.namespace))]
    async fn reset(&self, opts: &DeployOptions, registry: &RegistryConfig) -> Result<(), Error> {
        info!(mount = %opts.file_system_config, "resetting gateway state on mount");
        self.run_status(self.spec(ProbeKind::Reset, vec![], opts, registry))
            .await
    }

    #[instrument(skip_all, fields(namespace = %opts.namespace))]
    async fn mark(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
        fingerprint: &MountFingerprint,
    ) -> Result<(), Error> {
        let args = vec![fingerprint.as_str().to_string()];
        self.run_status(self.spec(ProbeKind::Mark, args, opts, registry))
            .await
    }
}
