//! In-memory resource client for multi-step convergence tests
//!
//! Objects live in a map keyed by kind, namespace and name. Scripted steps
//! are queued per kind and run one per `get` of that kind, which lets a test
//! walk a cluster through its readiness states while the code under test
//! polls.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject};
use serde_json::{json, Value};

use crate::client::ResourceClient;
use capstan_common::kube_utils::{build_api_resource, type_of};
use capstan_common::Error;

type Key = (String, String, String);
type Step = Box<dyn FnOnce(&mut State) + Send>;

fn key(kind: &str, namespace: &str, name: &str) -> Key {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

/// Mutable state behind a [`FakeClient`]
#[derive(Default)]
pub(crate) struct State {
    pub objects: BTreeMap<Key, DynamicObject>,
    pub served: BTreeMap<(String, String), ApiResource>,
    pub namespaces: BTreeSet<String>,
    pub deployments: BTreeMap<(String, String), Deployment>,
    pub secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    pub nodes: Vec<Node>,
    pub workload: Option<Arc<FakeClient>>,
    pub writes: Vec<String>,
    delete_lag: usize,
    deleting: BTreeMap<Key, usize>,
    scripts: BTreeMap<String, VecDeque<Step>>,
}

impl State {
    /// Object of `kind` at `namespace/name`, for in-place edits
    pub fn object_mut(&mut self, kind: &str, namespace: &str, name: &str) -> Option<&mut DynamicObject> {
        self.objects.get_mut(&key(kind, namespace, name))
    }

    /// Replace the status of an object, if it exists
    pub fn set_status(&mut self, kind: &str, namespace: &str, name: &str, status: Value) {
        if let Some(obj) = self.object_mut(kind, namespace, name) {
            obj.data["status"] = status;
        }
    }
}

/// Scripted in-memory [`ResourceClient`]
#[derive(Default)]
pub(crate) struct FakeClient {
    state: Mutex<State>,
}

impl FakeClient {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Run `f` against the state directly
    pub fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut *self.lock())
    }

    /// Queue a step to run before the next unscripted `get` of `kind`
    pub fn script(&self, kind: &str, step: impl FnOnce(&mut State) + Send + 'static) {
        self.lock()
            .scripts
            .entry(kind.to_string())
            .or_default()
            .push_back(Box::new(step));
    }

    /// Number of scripted steps not yet run
    pub fn remaining_steps(&self) -> usize {
        self.lock().scripts.values().map(VecDeque::len).sum()
    }

    /// Serve `kind` of `group` at `version` through discovery
    pub fn serve(&self, group: &str, kind: &str, version: &str) {
        let resource = build_api_resource(&format!("{}/{}", group, version), kind);
        self.lock()
            .served
            .insert((group.to_string(), kind.to_string()), resource);
    }

    /// Store an object as is
    pub fn insert(&self, obj: DynamicObject) {
        let (_, kind) = type_of(&obj).unwrap();
        let k = key(
            kind,
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            obj.metadata.name.as_deref().unwrap_or_default(),
        );
        self.lock().objects.insert(k, obj);
    }

    /// Fetch a stored object
    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.get(&key(kind, namespace, name)).cloned()
    }

    /// Create a namespace
    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    /// Create a deployment (and its namespace) with the given replica status
    pub fn add_deployment(&self, namespace: &str, name: &str, replicas: i32, ready: i32) {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut state = self.lock();
        state.namespaces.insert(namespace.to_string());
        state
            .deployments
            .insert((namespace.to_string(), name.to_string()), deployment);
    }

    /// Store a secret holding a single key
    pub fn put_secret(&self, namespace: &str, name: &str, data_key: &str, value: &[u8]) {
        let data = BTreeMap::from([(data_key.to_string(), value.to_vec())]);
        self.lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Nodes reported by this cluster
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.lock().nodes = nodes;
    }

    /// Client handed out by `connect`
    pub fn set_workload(&self, workload: Arc<FakeClient>) {
        self.lock().workload = Some(workload);
    }

    /// Deleted objects stay readable for `reads` more reads
    pub fn set_delete_lag(&self, reads: usize) {
        self.lock().delete_lag = reads;
    }

    /// Mutating calls in order, e.g. `apply Cluster default/demo`
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
        None => labels.contains_key(term.trim()),
    })
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.lock().namespaces.contains(name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, Error> {
        Ok(self
            .lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error> {
        Ok(self
            .lock()
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn preferred_resource(&self, group: &str, kind: &str) -> Result<Option<ApiResource>, Error> {
        Ok(self
            .lock()
            .served
            .get(&(group.to_string(), kind.to_string()))
            .cloned())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let mut state = self.lock();
        let step = state
            .scripts
            .get_mut(&resource.kind)
            .and_then(VecDeque::pop_front);
        if let Some(step) = step {
            step(&mut *state);
        }

        let k = key(&resource.kind, namespace, name);
        if let Some(left) = state.deleting.get_mut(&k) {
            if *left == 0 {
                state.deleting.remove(&k);
                state.objects.remove(&k);
                return Ok(None);
            }
            *left -= 1;
        }
        Ok(state.objects.get(&k).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| {
                *kind == resource.kind && namespace.as_ref().map_or(true, |want| want == ns)
            })
            .filter(|(_, obj)| matches_selector(obj, label_selector.as_deref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn apply(&self, object: &DynamicObject) -> Result<(), Error> {
        let (_, kind) = type_of(object)?;
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();

        let mut state = self.lock();
        state
            .writes
            .push(format!("apply {} {}/{}", kind, namespace, name));
        if kind == "Namespace" {
            state.namespaces.insert(name.clone());
        }
        state
            .objects
            .insert(key(kind, &namespace, &name), object.clone());
        Ok(())
    }

    async fn patch_merge(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        state
            .writes
            .push(format!("patch {} {}/{}", resource.kind, namespace, name));
        let obj = state
            .objects
            .get_mut(&key(&resource.kind, namespace, name))
            .ok_or_else(|| Error::validation(format!("{} {}/{} not found", resource.kind, namespace, name)))?;
        merge(&mut obj.data, patch);
        Ok(())
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool, Error> {
        let mut state = self.lock();
        state
            .writes
            .push(format!("delete {} {}/{}", resource.kind, namespace, name));
        let k = key(&resource.kind, namespace, name);
        if !state.objects.contains_key(&k) {
            return Ok(false);
        }
        if state.delete_lag == 0 {
            state.objects.remove(&k);
        } else {
            let lag = state.delete_lag;
            state.deleting.entry(k).or_insert(lag);
        }
        Ok(true)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        Ok(self
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.lock().nodes.clone())
    }

    async fn connect(&self, _kubeconfig: &[u8]) -> Result<Arc<dyn ResourceClient>, Error> {
        let workload = self.lock().workload.clone();
        match workload {
            Some(client) => Ok(client),
            None => Err(Error::internal_with_context("connect", "no workload cluster")),
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn object(body: Value) -> DynamicObject {
    serde_json::from_value(body).unwrap()
}

/// A workload node
pub(crate) fn node(
    name: &str,
    control_plane: bool,
    internal: &str,
    external: Option<&str>,
    ready: bool,
) -> Node {
    let mut labels = BTreeMap::new();
    if control_plane {
        labels.insert(
            "node-role.kubernetes.io/control-plane".to_string(),
            String::new(),
        );
    }
    let mut addresses = vec![NodeAddress {
        type_: "InternalIP".to_string(),
        address: internal.to_string(),
    }];
    if let Some(external) = external {
        addresses.push(NodeAddress {
            type_: "ExternalIP".to_string(),
            address: external.to_string(),
        });
    }

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(addresses),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Status of a `Cluster` with the given `Ready` condition
pub(crate) fn cluster_status(ready: bool) -> Value {
    json!({
        "conditions": [
            {"type": "Ready", "status": if ready { "True" } else { "False" }}
        ]
    })
}

/// A `Cluster` whose control plane is `<name>-controlplane`
pub(crate) fn cluster_object(name: &str, namespace: &str, ready: bool) -> DynamicObject {
    object(json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "Cluster",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {
            "controlPlaneRef": {
                "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
                "kind": "TalosControlPlane",
                "name": format!("{}-controlplane", name)
            }
        },
        "status": cluster_status(ready)
    }))
}

/// Status of a ready and initialized control plane
pub(crate) fn control_plane_status(replicas: i64, ready: i64) -> Value {
    json!({
        "ready": true,
        "initialized": true,
        "replicas": replicas,
        "readyReplicas": ready
    })
}

/// A `TalosControlPlane` with `spec.replicas` and a matching ready status
pub(crate) fn control_plane_object(name: &str, namespace: &str, replicas: i64) -> DynamicObject {
    object(json!({
        "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
        "kind": "TalosControlPlane",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {"replicas": replicas},
        "status": control_plane_status(replicas, replicas)
    }))
}

/// Status of a running worker group
pub(crate) fn machine_deployment_status(replicas: i64, ready: i64) -> Value {
    json!({"phase": "Running", "replicas": replicas, "readyReplicas": ready})
}

/// A running `MachineDeployment` of `cluster`
pub(crate) fn machine_deployment(
    name: &str,
    namespace: &str,
    cluster: &str,
    replicas: i64,
) -> DynamicObject {
    object(json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "MachineDeployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {"cluster.x-k8s.io/cluster-name": cluster}
        },
        "spec": {"clusterName": cluster, "replicas": replicas},
        "status": machine_deployment_status(replicas, replicas)
    }))
}

/// A clusterctl `Provider` inventory record
pub(crate) fn provider_record(
    namespace: &str,
    provider_type: &str,
    provider_name: &str,
    version: &str,
) -> DynamicObject {
    object(json!({
        "apiVersion": "clusterctl.cluster.x-k8s.io/v1alpha3",
        "kind": "Provider",
        "metadata": {
            "name": format!("{}-{}", provider_type.to_lowercase(), provider_name),
            "namespace": namespace
        },
        "type": provider_type,
        "providerName": provider_name,
        "version": version
    }))
}

/// A cluster with one ready control plane and one worker group of `workers`
pub(crate) fn ready_cluster(client: &FakeClient, name: &str, namespace: &str, workers: i64) {
    client.insert(cluster_object(name, namespace, true));
    client.insert(control_plane_object(
        &format!("{}-controlplane", name),
        namespace,
        1,
    ));
    client.insert(machine_deployment(
        &format!("{}-workers", name),
        namespace,
        name,
        workers,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::replace(json!({"a": 1}), json!({"a": 2}), json!({"a": 2}))]
    #[case::nested(json!({"spec": {"replicas": 1, "x": true}}), json!({"spec": {"replicas": 3}}), json!({"spec": {"replicas": 3, "x": true}}))]
    #[case::remove(json!({"a": 1, "b": 2}), json!({"b": null}), json!({"a": 1}))]
    fn merge_patch(#[case] mut target: Value, #[case] patch: Value, #[case] want: Value) {
        merge(&mut target, &patch);
        assert_eq!(target, want);
    }

    #[tokio::test]
    async fn script_steps_run_on_reads_of_their_kind() {
        let client = FakeClient::default();
        client.script("Cluster", |state| {
            state.objects.insert(
                key("Cluster", "default", "demo"),
                cluster_object("demo", "default", false),
            );
        });
        let api = crate::client::LifecycleApi::default();
        assert!(client
            .list(&api.cluster(), None, None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(client.remaining_steps(), 1);
        assert!(client.get(&api.cluster(), "default", "demo").await.unwrap().is_some());
        assert_eq!(client.remaining_steps(), 0);
    }
}
