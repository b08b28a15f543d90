//! In-memory [`ClusterClient`] for scenario tests
//!
//! Objects are stored per `(namespace, name)`. Every create/replace/delete is
//! recorded so tests can assert on exact cluster diffs. Created pods take the
//! phase and logs scripted with [`FakeCluster::script_pods`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus, Secret, Service};
use kube::Resource;

use fsbackup_common::Error;

use crate::cluster::ClusterClient;

type Key = (String, String);

#[derive(Default)]
struct State {
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    pods: BTreeMap<Key, Pod>,
    pod_phase: Option<String>,
    pod_logs: String,
    events: Vec<String>,
    writes: Vec<String>,
    next_version: u64,
}

impl State {
    fn stamp<K: Resource>(&mut self, obj: &mut K) {
        self.next_version += 1;
        obj.meta_mut().resource_version = Some(self.next_version.to_string());
    }
}

/// Fake API server keeping objects in memory
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn name_of<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

/// Label selector matching for `k=v` and bare-key existence terms
pub fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn conflict(kind: &str, name: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} {} already exists", kind, name),
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

fn missing(kind: &str, name: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} {} not found", kind, name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

macro_rules! create_in {
    ($self:ident, $map:ident, $kind:literal, $ns:ident, $obj:ident) => {{
        let mut state = $self.state.lock().unwrap();
        let name = name_of($obj);
        let k = key($ns, &name);
        if state.$map.contains_key(&k) {
            return Err(conflict($kind, &name));
        }
        let mut obj = $obj.clone();
        obj.metadata.namespace = Some($ns.to_string());
        state.stamp(&mut obj);
        state.$map.insert(k, obj);
        state.writes.push(format!("create {} {}/{}", $kind, $ns, name));
        Ok(())
    }};
}

macro_rules! replace_in {
    ($self:ident, $map:ident, $kind:literal, $ns:ident, $obj:ident) => {{
        let mut state = $self.state.lock().unwrap();
        let name = name_of($obj);
        let k = key($ns, &name);
        let Some(current) = state.$map.get(&k) else {
            return Err(missing($kind, &name));
        };
        if current.metadata.resource_version != $obj.metadata.resource_version {
            return Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })));
        }
        let mut obj = $obj.clone();
        state.stamp(&mut obj);
        state.$map.insert(k, obj);
        state.writes.push(format!("replace {} {}/{}", $kind, $ns, name));
        Ok(())
    }};
}

macro_rules! delete_in {
    ($self:ident, $map:ident, $kind:literal, $ns:ident, $name:ident) => {{
        let mut state = $self.state.lock().unwrap();
        if state.$map.remove(&key($ns, $name)).is_some() {
            state.writes.push(format!("delete {} {}/{}", $kind, $ns, $name));
        }
        Ok(())
    }};
}

impl FakeCluster {
    /// Empty cluster; created pods succeed with empty logs
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.script_pods(Some("Succeeded"), "");
        cluster
    }

    /// Phase (None = never leaves Pending) and logs for pods created from now on
    pub fn script_pods(&self, phase: Option<&str>, logs: &str) {
        let mut state = self.state.lock().unwrap();
        state.pod_phase = phase.map(str::to_string);
        state.pod_logs = logs.to_string();
    }

    /// Event message reported for every pod
    pub fn add_event(&self, message: &str) {
        self.state.lock().unwrap().events.push(message.to_string());
    }

    /// Insert a ConfigMap without recording a write
    pub fn seed_config_map(&self, namespace: &str, mut config_map: ConfigMap) {
        let mut state = self.state.lock().unwrap();
        config_map.metadata.namespace = Some(namespace.to_string());
        state.stamp(&mut config_map);
        state
            .config_maps
            .insert(key(namespace, &name_of(&config_map)), config_map);
    }

    /// Insert a Secret without recording a write
    pub fn seed_secret(&self, namespace: &str, mut secret: Secret) {
        let mut state = self.state.lock().unwrap();
        secret.metadata.namespace = Some(namespace.to_string());
        state.stamp(&mut secret);
        state.secrets.insert(key(namespace, &name_of(&secret)), secret);
    }

    /// Insert a Deployment without recording a write
    pub fn seed_deployment(&self, namespace: &str, mut deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        deployment.metadata.namespace = Some(namespace.to_string());
        state.stamp(&mut deployment);
        state
            .deployments
            .insert(key(namespace, &name_of(&deployment)), deployment);
    }

    /// Stored ConfigMap
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    /// Stored Secret
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned()
    }

    /// Stored Deployment
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    /// Stored Service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    /// Names of stored pods in a namespace
    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// The single stored pod; panics unless exactly one exists
    pub fn only_pod(&self) -> Pod {
        let state = self.state.lock().unwrap();
        assert_eq!(state.pods.len(), 1, "expected exactly one pod");
        state.pods.values().next().cloned().unwrap()
    }

    /// Count of (config maps, secrets, deployments, services) in a namespace
    pub fn object_counts(&self, namespace: &str) -> (usize, usize, usize, usize) {
        let state = self.state.lock().unwrap();
        let in_ns = |k: &Key| k.0 == namespace;
        (
            state.config_maps.keys().filter(|k| in_ns(k)).count(),
            state.secrets.keys().filter(|k| in_ns(k)).count(),
            state.deployments.keys().filter(|k| in_ns(k)).count(),
            state.services.keys().filter(|k| in_ns(k)).count(),
        )
    }

    /// Every recorded write, oldest first
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Number of recorded writes
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_map(namespace, name))
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .config_maps
            .iter()
            .filter(|((ns, _), cm)| {
                ns == namespace && selector_matches(label_selector, cm.metadata.labels.as_ref())
            })
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        create_in!(self, config_maps, "ConfigMap", namespace, config_map)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        replace_in!(self, config_maps, "ConfigMap", namespace, config_map)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_in!(self, config_maps, "ConfigMap", namespace, name)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        create_in!(self, secrets, "Secret", namespace, secret)
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        replace_in!(self, secrets, "Secret", namespace, secret)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        create_in!(self, deployments, "Deployment", namespace, deployment)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        replace_in!(self, deployments, "Deployment", namespace, deployment)
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let Some(deployment) = state.deployments.get_mut(&key(namespace, name)) else {
            return Err(missing("Deployment", name));
        };
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        let mut scaled = deployment.clone();
        state.stamp(&mut scaled);
        state.deployments.insert(key(namespace, name), scaled);
        state
            .writes
            .push(format!("scale Deployment {}/{} {}", namespace, name, replicas));
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_in!(self, deployments, "Deployment", namespace, name)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        create_in!(self, services, "Service", namespace, service)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        replace_in!(self, services, "Service", namespace, service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_in!(self, services, "Service", namespace, name)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = name_of(pod);
        let mut pod = pod.clone();
        pod.metadata.namespace = Some(namespace.to_string());
        pod.status = Some(PodStatus {
            phase: Some(
                state
                    .pod_phase
                    .clone()
                    .unwrap_or_else(|| "Pending".to_string()),
            ),
            ..Default::default()
        });
        state.pods.insert(key(namespace, &name), pod);
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(&key(namespace, name))
            .cloned())
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        let state = self.state.lock().unwrap();
        if !state.pods.contains_key(&key(namespace, name)) {
            return Err(missing("Pod", name));
        }
        Ok(state.pod_logs.clone())
    }

    async fn pod_event_messages(
        &self,
        _namespace: &str,
        _pod_name: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self.state.lock().unwrap().events.clone())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.pods.retain(|(ns, _), pod| {
            ns != namespace || !selector_matches(label_selector, pod.metadata.labels.as_ref())
        });
        Ok(())
    }
}

#[test]
fn selector_matching_supports_equality_and_existence() {
    let labels = BTreeMap::from([
        ("velero.io/plugin-config".to_string(), String::new()),
        ("fsbackup.io/hostpath".to_string(), "ObjectStore".to_string()),
    ]);
    assert!(selector_matches("velero.io/plugin-config", Some(&labels)));
    assert!(selector_matches(
        "velero.io/plugin-config,fsbackup.io/hostpath=ObjectStore",
        Some(&labels)
    ));
    assert!(!selector_matches("fsbackup.io/nfs=ObjectStore", Some(&labels)));
    assert!(!selector_matches("app", None));
}
