//! Short-lived probe pods that inspect or mutate a mount
//!
//! A probe is a request/response call carried over the cluster API: create a
//! single-container pod running a literal command against the mount, wait for
//! it to finish, read its stdout. The first well-formed JSON line of the logs
//! is the response. When a probe fails the most specific diagnostic available
//! (pod logs, then pod events) is surfaced instead of a bare timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, Pod, PodSecurityContext, PodSpec, VolumeMount,
};
use kube::core::ObjectMeta;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use fsbackup_common::kube_utils::poll_until;
use fsbackup_common::{EngineConfig, Error};

use crate::cluster::{managed_labels, ClusterClient};
use crate::config::FileSystemConfig;
use crate::naming::{DATA_MOUNT_PATH, DATA_VOLUME_NAME, PREFIX, PROBE_LABEL};

/// Event text kubelet emits when a `type: Directory` host path is missing
const HOST_PATH_MISSING_MARKER: &str = "hostPath type check failed";
/// Event text preceding a failed mount helper's output
const OUTPUT_MARKER: &str = "Output:";

const PROBE_CONTAINER_NAME: &str = "probe";

/// Which probe entrypoint to run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Read-only reconnaissance of the mount
    Check,
    /// Destructive re-initialization for a new owner
    Reset,
    /// Persist the current credential fingerprint
    Mark,
}

impl ProbeKind {
    /// Short name used in pod names and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Check => "check",
            ProbeKind::Reset => "reset",
            ProbeKind::Mark => "mark",
        }
    }

    /// Entrypoint script inside the probe image
    pub fn entrypoint(&self) -> &'static str {
        match self {
            ProbeKind::Check => "/fs-minio-check.sh",
            ProbeKind::Reset => "/fs-minio-reset.sh",
            ProbeKind::Mark => "/fs-minio-keys-sha.sh",
        }
    }

    /// Label selector matching every pod of this kind
    pub fn selector(&self) -> String {
        format!("{}={}", PROBE_LABEL, self.as_str())
    }
}

/// A single probe invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Entrypoint to run
    pub kind: ProbeKind,
    /// Arguments appended to the entrypoint, passed without a shell
    pub args: Vec<String>,
    /// Namespace the pod runs in
    pub namespace: String,
    /// Mount under inspection
    pub file_system_config: FileSystemConfig,
    /// Omit the pod security context
    pub is_openshift: bool,
    /// Final image reference (already rewritten for private registries)
    pub image: String,
    /// Pull secret for private registries
    pub image_pull_secret: Option<String>,
}

impl ProbeSpec {
    /// Literal command array for the container
    pub fn command(&self) -> Vec<String> {
        std::iter::once(self.kind.entrypoint().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TerminalPhase {
    Succeeded,
    Failed,
}

/// Result of a successful probe pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeRun {
    /// Name of the pod that ran
    pub pod_name: String,
    /// Full pod logs
    pub logs: String,
}

/// Build the pod for a probe invocation
pub fn build_probe_pod(spec: &ProbeSpec, name: &str, config: &EngineConfig) -> Pod {
    let security_context = (!spec.is_openshift).then(|| PodSecurityContext {
        run_as_user: Some(config.run_as_user),
        fs_group: Some(config.fs_group),
        ..Default::default()
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(probe_labels(spec.kind)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            security_context,
            image_pull_secrets: spec.image_pull_secret.as_ref().map(|secret| {
                vec![LocalObjectReference {
                    name: secret.clone(),
                }]
            }),
            volumes: Some(vec![spec.file_system_config.volume()]),
            containers: vec![Container {
                name: PROBE_CONTAINER_NAME.to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(spec.command()),
                volume_mounts: Some(vec![VolumeMount {
                    name: DATA_VOLUME_NAME.to_string(),
                    mount_path: DATA_MOUNT_PATH.to_string(),
                    read_only: Some(false),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod name with a timestamp suffix so retried runs do not collide
pub fn probe_pod_name(kind: ProbeKind, unix_seconds: i64) -> String {
    format!("{}-fs-{}-{}", PREFIX, kind.as_str(), unix_seconds)
}

/// Parse the first log line that deserializes into `T`
///
/// Probes may print diagnostics before their structured result; anything
/// after the first match is ignored.
pub fn parse_first_json_line<T: DeserializeOwned>(logs: &str) -> Result<T, Error> {
    logs.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| {
            Error::serialization_for_kind(
                "ProbeOutput",
                format!("no JSON result in probe output: {}", logs.trim()),
            )
        })
}

fn pod_disappeared(name: &str) -> Error {
    Error::internal_with_context("probe", format!("pod {} disappeared", name))
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Runs probe pods and turns their outcome into typed results
pub struct ProbeWorkloadRunner {
    client: Arc<dyn ClusterClient>,
    config: EngineConfig,
}

impl ProbeWorkloadRunner {
    /// Create a runner with the timeouts and UIDs from `config`
    pub fn new(client: Arc<dyn ClusterClient>, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Run a probe to completion
    ///
    /// On success the pod (and any leftovers of the same kind) is deleted.
    /// On failure the pod is left in place for inspection and the most
    /// specific diagnostic found is returned.
    pub async fn run(&self, spec: &ProbeSpec) -> Result<ProbeRun, Error> {
        let name = probe_pod_name(spec.kind, chrono::Utc::now().timestamp());
        let namespace = spec.namespace.as_str();
        let pod = build_probe_pod(spec, &name, &self.config);

        self.client.create_pod(namespace, &pod).await?;
        info!(pod = %name, %namespace, probe = spec.kind.as_str(), "started probe pod");

        let timeout = self.config.probe_timeout();
        let phase = match self.wait_for_terminal_phase(namespace, &name, timeout).await {
            Ok(phase) => phase,
            Err(e @ Error::Timeout { .. }) => {
                warn!(pod = %name, "probe pod did not finish in time");
                return Err(self.diagnose(spec, &name, e).await);
            }
            Err(e) => return Err(e),
        };

        if phase == TerminalPhase::Failed {
            warn!(pod = %name, "probe pod failed; leaving it for inspection");
            let fallback = Error::actionable(format!(
                "probe pod {}/{} failed; inspect it with `kubectl -n {} describe pod {}`",
                namespace, name, namespace, name
            ));
            return Err(self.diagnose(spec, &name, fallback).await);
        }

        let logs = self.client.pod_logs(namespace, &name).await?;
        debug!(pod = %name, "probe pod succeeded");
        self.client
            .delete_pods(namespace, &spec.kind.selector())
            .await?;

        Ok(ProbeRun {
            pod_name: name,
            logs,
        })
    }

    async fn wait_for_terminal_phase(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<TerminalPhase, Error> {
        let client = self.client.clone();
        let ns = namespace.to_string();
        let pod_name = name.to_string();

        poll_until(
            timeout,
            self.config.poll_interval(),
            format!("probe pod {}/{} to complete", namespace, name),
            || {
                let client = client.clone();
                let ns = ns.clone();
                let pod_name = pod_name.clone();
                async move {
                    // a vanished pod stops the wait; the re-read below reports it
                    let Some(pod) = client.get_pod(&ns, &pod_name).await? else {
                        return Ok(true);
                    };
                    Ok(matches!(pod_phase(&pod), Some("Succeeded") | Some("Failed")))
                }
            },
        )
        .await?;

        let pod = self
            .client
            .get_pod(namespace, name)
            .await?
            .ok_or_else(|| pod_disappeared(name))?;
        Ok(match pod_phase(&pod) {
            Some("Succeeded") => TerminalPhase::Succeeded,
            _ => TerminalPhase::Failed,
        })
    }

    /// Find the most specific explanation for a failed probe pod
    ///
    /// Order: any pod log text, then pod events (missing host path, then
    /// mount helper `Output:`), then `fallback`.
    async fn diagnose(&self, spec: &ProbeSpec, name: &str, fallback: Error) -> Error {
        let namespace = spec.namespace.as_str();

        match self.client.pod_logs(namespace, name).await {
            Ok(logs) if !logs.trim().is_empty() => {
                return Error::actionable(logs.trim().to_string());
            }
            Ok(_) => {}
            Err(e) => debug!(pod = %name, error = %e, "no logs for probe pod"),
        }

        let messages = match self.client.pod_event_messages(namespace, name).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(pod = %name, error = %e, "failed to list events for probe pod");
                return fallback;
            }
        };

        if messages.iter().any(|m| m.contains(HOST_PATH_MISSING_MARKER)) {
            if let FileSystemConfig::HostPath { path } = &spec.file_system_config {
                return Error::host_path_not_found(path.clone());
            }
        }

        messages
            .iter()
            .find_map(|m| {
                m.split_once(OUTPUT_MARKER)
                    .map(|(_, output)| output.trim().to_string())
                    .filter(|output| !output.is_empty())
            })
            .map(Error::actionable)
            .unwrap_or(fallback)
    }
}

/// Labels applied to probe pods of `kind`
pub fn probe_labels(kind: ProbeKind) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert(PROBE_LABEL.to_string(), kind.as_str().to_string());
    labels
}
