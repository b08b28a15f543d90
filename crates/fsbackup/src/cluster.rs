//! Cluster object access and create-if-absent / patch-in-place upserts
//!
//! [`ClusterClient`] is the only seam between the engine and the API server,
//! so reconcilers can be exercised against mocks or an in-memory fake. The
//! `ensure_*` functions build on it and report what they did.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fsbackup_common::kube_utils::is_not_found;
use fsbackup_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_FSBACKUP};

/// Labels every fsbackup-created object carries
pub fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_FSBACKUP.to_string(),
    );
    labels
}

/// Trait abstracting the Kubernetes operations the engine performs
///
/// Getters return `Ok(None)` for missing objects; deletes succeed when the
/// object is already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// List ConfigMaps matching a label selector
    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a ConfigMap (resourceVersion from the fetched object is honored)
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error>;

    /// Delete a ConfigMap
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace a Secret
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Replace a Deployment
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error>;

    /// Set a Deployment's replica count
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32)
        -> Result<(), Error>;

    /// Delete a Deployment
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Replace a Service
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Delete a Service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a Pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Full (untailed) logs of a Pod's only container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error>;

    /// Messages of Events whose involved object is the named Pod
    async fn pod_event_messages(&self, namespace: &str, pod_name: &str)
        -> Result<Vec<String>, Error>;

    /// Delete every Pod matching a label selector
    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<&str, Error> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("object has no metadata.name"))
}

async fn replace_object<K>(api: &Api<K>, obj: &K) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(object_name(obj)?, &PostParams::default(), obj).await?;
    Ok(())
}

async fn delete_object<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.api::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let list = self
            .api::<ConfigMap>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        self.api::<ConfigMap>(namespace)
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        replace_object(&self.api::<ConfigMap>(namespace), config_map).await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_object(&self.api::<ConfigMap>(namespace), name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.api::<Secret>(namespace)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        replace_object(&self.api::<Secret>(namespace), secret).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.api::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        self.api::<Deployment>(namespace)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        replace_object(&self.api::<Deployment>(namespace), deployment).await
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api::<Deployment>(namespace)
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_object(&self.api::<Deployment>(namespace), name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.api::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        replace_object(&self.api::<Service>(namespace), service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_object(&self.api::<Service>(namespace), name).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        self.api::<Pod>(namespace)
            .create(&PostParams::default(), pod)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.api::<Pod>(namespace).get_opt(name).await?)
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        Ok(self
            .api::<Pod>(namespace)
            .logs(name, &LogParams::default())
            .await?)
    }

    async fn pod_event_messages(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Vec<String>, Error> {
        let selector = format!("involvedObject.kind=Pod,involvedObject.name={}", pod_name);
        let events = self
            .api::<Event>(namespace)
            .list(&ListParams::default().fields(&selector))
            .await?;
        Ok(events
            .items
            .into_iter()
            .filter_map(|event| event.message)
            .collect())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), Error> {
        self.api::<Pod>(namespace)
            .delete_collection(
                &DeleteParams::background(),
                &ListParams::default().labels(label_selector),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Upserts
// =============================================================================

/// What an upsert did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Object did not exist and was created
    Created,
    /// Object existed and owned fields were rewritten
    Updated,
    /// Object already matched
    Unchanged,
}

fn merge_labels(
    existing: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = existing.cloned().unwrap_or_default();
    if let Some(desired) = desired {
        merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    (!merged.is_empty()).then_some(merged)
}

/// Create `desired` or overwrite the data of the existing ConfigMap
///
/// Labels are merged so labels added by others survive.
pub async fn ensure_config_map(
    client: &dyn ClusterClient,
    namespace: &str,
    desired: &ConfigMap,
) -> Result<Applied, Error> {
    let name = object_name(desired)?;
    let Some(existing) = client.get_config_map(namespace, name).await? else {
        client.create_config_map(namespace, desired).await?;
        info!(configmap = %name, %namespace, "created configmap");
        return Ok(Applied::Created);
    };

    let mut updated = existing.clone();
    updated.data = desired.data.clone();
    updated.metadata.labels = merge_labels(
        existing.metadata.labels.as_ref(),
        desired.metadata.labels.as_ref(),
    );

    if updated == existing {
        debug!(configmap = %name, "configmap unchanged");
        return Ok(Applied::Unchanged);
    }
    client.replace_config_map(namespace, &updated).await?;
    info!(configmap = %name, %namespace, "updated configmap");
    Ok(Applied::Updated)
}

/// Return the existing Secret, or create the one produced by `generate`
///
/// Existing content is never touched; regenerating credentials is the
/// caller's decision.
pub async fn ensure_secret<F>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    generate: F,
) -> Result<(Secret, Applied), Error>
where
    F: FnOnce() -> Result<Secret, Error>,
{
    if let Some(existing) = client.get_secret(namespace, name).await? {
        debug!(secret = %name, "secret already exists");
        return Ok((existing, Applied::Unchanged));
    }
    let secret = generate()?;
    client.create_secret(namespace, &secret).await?;
    info!(secret = %name, %namespace, "created secret");
    Ok((secret, Applied::Created))
}

/// Copy the fields this engine owns from `desired` onto `existing`
///
/// Owned: replica count, pod template annotations present in `desired`,
/// volumes, the image pull secrets `desired` names, and the image/probes/env
/// of `container`. Everything else on the existing object (strategy,
/// resources, extra containers, tolerations) is kept.
pub fn merge_deployment(
    existing: &Deployment,
    desired: &Deployment,
    container: &str,
) -> Deployment {
    let mut merged = existing.clone();
    let Some(desired_spec) = desired.spec.as_ref() else {
        return merged;
    };
    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.replicas = desired_spec.replicas;

    if let Some(annotations) = desired_spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
    {
        let target = spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default);
        target.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let Some(desired_pod) = desired_spec.template.spec.as_ref() else {
        return merged;
    };
    let pod = spec.template.spec.get_or_insert_with(Default::default);
    pod.volumes = desired_pod.volumes.clone();

    // pull secrets travel with the image; ones added by others stay
    for wanted in desired_pod.image_pull_secrets.iter().flatten() {
        let secrets = pod.image_pull_secrets.get_or_insert_with(Vec::new);
        if !secrets.iter().any(|s| s.name == wanted.name) {
            secrets.push(wanted.clone());
        }
    }

    if let Some(want) = desired_pod.containers.iter().find(|c| c.name == container) {
        match pod.containers.iter_mut().find(|c| c.name == container) {
            Some(have) => {
                have.image = want.image.clone();
                have.liveness_probe = want.liveness_probe.clone();
                have.readiness_probe = want.readiness_probe.clone();
                have.env = want.env.clone();
            }
            None => pod.containers.push(want.clone()),
        }
    }
    merged
}

/// Create `desired` or patch the owned fields of the existing Deployment
pub async fn ensure_deployment(
    client: &dyn ClusterClient,
    namespace: &str,
    desired: &Deployment,
    container: &str,
) -> Result<Applied, Error> {
    let name = object_name(desired)?;
    let Some(existing) = client.get_deployment(namespace, name).await? else {
        client.create_deployment(namespace, desired).await?;
        info!(deployment = %name, %namespace, "created deployment");
        return Ok(Applied::Created);
    };

    let merged = merge_deployment(&existing, desired, container);
    if merged == existing {
        debug!(deployment = %name, "deployment unchanged");
        return Ok(Applied::Unchanged);
    }
    client.replace_deployment(namespace, &merged).await?;
    info!(deployment = %name, %namespace, "updated deployment");
    Ok(Applied::Updated)
}

/// Create `desired` or rewrite ports and selector of the existing Service
///
/// The cluster IP and other server-assigned fields are kept.
pub async fn ensure_service(
    client: &dyn ClusterClient,
    namespace: &str,
    desired: &Service,
) -> Result<Applied, Error> {
    let name = object_name(desired)?;
    let Some(existing) = client.get_service(namespace, name).await? else {
        client.create_service(namespace, desired).await?;
        info!(service = %name, %namespace, "created service");
        return Ok(Applied::Created);
    };

    let mut updated = existing.clone();
    if let Some(desired_spec) = desired.spec.as_ref() {
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.ports = desired_spec.ports.clone();
        spec.selector = desired_spec.selector.clone();
    }
    updated.metadata.labels = merge_labels(
        existing.metadata.labels.as_ref(),
        desired.metadata.labels.as_ref(),
    );

    if updated == existing {
        debug!(service = %name, "service unchanged");
        return Ok(Applied::Unchanged);
    }
    client.replace_service(namespace, &updated).await?;
    info!(service = %name, %namespace, "updated service");
    Ok(Applied::Updated)
}
