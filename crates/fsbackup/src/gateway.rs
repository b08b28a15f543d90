//! S3 gateway in front of a filesystem mount
//!
//! A deploy inspects the mount, refuses (or with authorization performs) a
//! reset when another gateway instance owns it, then upserts the mount
//! descriptor ConfigMap, credentials Secret, gateway Deployment and Service.
//! Repeated deploys against an unchanged cluster write nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, PodSecurityContext, PodSpec, PodTemplateSpec, Probe, SecretKeySelector,
    Service, ServicePort, ServiceSpec, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use tracing::{debug, info, instrument};

use fsbackup_common::kube_utils::poll_until;
use fsbackup_common::{EngineConfig, Error};

use crate::cluster::{
    ensure_config_map, ensure_deployment, ensure_secret, ensure_service, managed_labels,
    ClusterClient,
};
use crate::config::DeployOptions;
use crate::integrity::MountProbes;
use crate::migration::{authorize, decide, ensure_writable, MountState};
use crate::naming::{
    APP_LABEL, DATA_MOUNT_PATH, DATA_VOLUME_NAME, GATEWAY_CONTAINER_NAME, GATEWAY_NAME,
    GATEWAY_PORT, GATEWAY_SECRET_NAME, KEY_ACCESS_KEY, KEY_SECRET_KEY, SECRET_CHECKSUM_ANNOTATION,
};
use crate::registry::{ensure_pull_secret, ImageResolver, RegistryConfig};
use crate::secret::{secret_data_checksum, GatewaySecret};

const READY_PATH: &str = "/minio/health/ready";
const LIVE_PATH: &str = "/minio/health/live";

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), GATEWAY_NAME.to_string())])
}

fn gateway_labels() -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.extend(selector_labels());
    labels
}

fn owned_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Mount descriptor ConfigMap
pub fn build_config_map(opts: &DeployOptions) -> ConfigMap {
    ConfigMap {
        metadata: owned_meta(GATEWAY_NAME, &opts.namespace, managed_labels()),
        data: Some(opts.file_system_config.to_config_map_data()),
        ..Default::default()
    }
}

fn secret_env(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: GATEWAY_SECRET_NAME.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(GATEWAY_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        ..Default::default()
    }
}

/// Inputs to [`build_deployment`] that come from the cluster
#[derive(Clone, Debug)]
pub struct DeploymentInputs<'a> {
    /// Final gateway image reference
    pub image: &'a str,
    /// Checksum of the credentials Secret data
    pub secret_checksum: &'a str,
    /// Registry pull secret to reference
    pub pull_secret: Option<&'a str>,
}

/// Gateway Deployment serving the mount on [`GATEWAY_PORT`]
pub fn build_deployment(
    opts: &DeployOptions,
    inputs: &DeploymentInputs<'_>,
    config: &EngineConfig,
) -> Deployment {
    let security_context = (!opts.is_openshift).then(|| PodSecurityContext {
        run_as_user: Some(config.run_as_user),
        fs_group: Some(config.fs_group),
        ..Default::default()
    });

    let container = Container {
        name: GATEWAY_CONTAINER_NAME.to_string(),
        image: Some(inputs.image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["minio".to_string()]),
        args: Some(vec![
            "--quiet".to_string(),
            "server".to_string(),
            DATA_MOUNT_PATH.to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: GATEWAY_PORT,
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env(KEY_ACCESS_KEY, KEY_ACCESS_KEY),
            secret_env(KEY_SECRET_KEY, KEY_SECRET_KEY),
            EnvVar {
                name: "MINIO_BROWSER".to_string(),
                value: Some("off".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME_NAME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        readiness_probe: Some(http_probe(READY_PATH, 5)),
        liveness_probe: Some(http_probe(LIVE_PATH, 30)),
        ..Default::default()
    };

    Deployment {
        metadata: owned_meta(GATEWAY_NAME, &opts.namespace, gateway_labels()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            // Two gateways must never serve the same mount
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(gateway_labels()),
                    annotations: Some(BTreeMap::from([(
                        SECRET_CHECKSUM_ANNOTATION.to_string(),
                        inputs.secret_checksum.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context,
                    image_pull_secrets: inputs.pull_secret.map(|name| {
                        vec![LocalObjectReference {
                            name: name.to_string(),
                        }]
                    }),
                    volumes: Some(vec![opts.file_system_config.volume()]),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service in front of the gateway
pub fn build_service(namespace: &str) -> Service {
    Service {
        metadata: owned_meta(GATEWAY_NAME, namespace, gateway_labels()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: GATEWAY_PORT,
                target_port: Some(IntOrString::Int(GATEWAY_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reconciles the gateway objects for a mount
pub struct GatewayReconciler {
    client: Arc<dyn ClusterClient>,
    probes: Arc<dyn MountProbes>,
    images: Arc<dyn ImageResolver>,
    config: EngineConfig,
}

impl GatewayReconciler {
    /// Create a reconciler
    pub fn new(
        client: Arc<dyn ClusterClient>,
        probes: Arc<dyn MountProbes>,
        images: Arc<dyn ImageResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            probes,
            images,
            config,
        }
    }

    /// Provision or update the gateway for `opts.file_system_config`
    ///
    /// Returns [`Error::ResetRequired`] without touching the mount or any
    /// gateway object when the mount is owned elsewhere and
    /// `opts.force_reset` is not set.
    #[instrument(skip_all, fields(namespace = %opts.namespace, mount = %opts.file_system_config))]
    pub async fn deploy(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> Result<(), Error> {
        opts.file_system_config.validate()?;
        let namespace = opts.namespace.as_str();
        let client = self.client.as_ref();

        let pull_secret = ensure_pull_secret(client, namespace, registry).await?;

        let state = self.inspect(opts, registry).await?;
        let plan = authorize(&state, opts.force_reset, &opts.file_system_config)?;
        debug!(?state, ?plan, "mount inspected");

        if plan.requires_reset() {
            self.probes.reset(opts, registry).await?;
            // The running gateway caches on-disk state; stop it so the next
            // rollout starts against the wiped mount.
            if client.get_deployment(namespace, GATEWAY_NAME).await?.is_some() {
                client.scale_deployment(namespace, GATEWAY_NAME, 0).await?;
                info!(deployment = GATEWAY_NAME, "scaled gateway to zero after reset");
            }
        }

        ensure_config_map(client, namespace, &build_config_map(opts)).await?;

        let (secret, _) = ensure_secret(client, namespace, GATEWAY_SECRET_NAME, || {
            Ok(GatewaySecret::generate()?.to_secret(namespace))
        })
        .await?;
        let credentials = GatewaySecret::from_secret(&secret)?;

        if plan.requires_mark() {
            self.probes
                .mark(opts, registry, &credentials.fingerprint())
                .await?;
            info!("marked mount with gateway fingerprint");
        }

        let checksum = secret_data_checksum(&secret)?;
        let image = self.images.resolve(&self.config.gateway_image, registry);
        let deployment = build_deployment(
            opts,
            &DeploymentInputs {
                image: &image,
                secret_checksum: &checksum,
                pull_secret,
            },
            &self.config,
        );
        ensure_deployment(client, namespace, &deployment, GATEWAY_CONTAINER_NAME).await?;
        ensure_service(client, namespace, &build_service(namespace)).await?;

        info!("gateway reconciled");
        Ok(())
    }

    /// Inspect the mount without changing anything
    ///
    /// Lets callers ask the operator before re-running [`deploy`](Self::deploy)
    /// with `force_reset`.
    #[instrument(skip_all, fields(namespace = %opts.namespace))]
    pub async fn validate(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> Result<MountState, Error> {
        opts.file_system_config.validate()?;
        self.inspect(opts, registry).await
    }

    async fn inspect(
        &self,
        opts: &DeployOptions,
        registry: &RegistryConfig,
    ) -> Result<MountState, Error> {
        let check = self.probes.check(opts, registry).await?;
        let uid = (!opts.is_openshift).then_some(self.config.run_as_user);
        ensure_writable(&check, &opts.file_system_config, uid)?;

        let credentials = match self
            .client
            .get_secret(&opts.namespace, GATEWAY_SECRET_NAME)
            .await?
        {
            Some(secret) => Some(GatewaySecret::from_secret(&secret)?),
            None => None,
        };
        Ok(decide(&check, credentials.as_ref()))
    }

    /// Wait until every desired gateway replica is available
    pub async fn wait_for_ready(&self, namespace: &str, timeout: Duration) -> Result<(), Error> {
        let client = self.client.clone();
        let ns = namespace.to_string();
        poll_until(
            timeout,
            self.config.poll_interval(),
            format!("gateway {}/{} to become available", namespace, GATEWAY_NAME),
            || {
                let client = client.clone();
                let ns = ns.clone();
                async move {
                    let Some(deployment) = client.get_deployment(&ns, GATEWAY_NAME).await? else {
                        return Ok(false);
                    };
                    let desired = deployment
                        .spec
                        .as_ref()
                        .and_then(|s| s.replicas)
                        .unwrap_or(1)
                        .max(1);
                    let available = deployment
                        .status
                        .as_ref()
                        .and_then(|s| s.available_replicas)
                        .unwrap_or(0);
                    Ok(available >= desired)
                }
            },
        )
        .await
    }
}
