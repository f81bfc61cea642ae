//! Resource client for the management and workload clusters
//!
//! Provides a trait-based abstraction over the Kubernetes API, allowing tests
//! to mock interactions while production code uses real API calls. Lifecycle
//! CRDs are accessed as `DynamicObject`s; core objects (namespaces,
//! deployments, secrets, nodes) are typed.
//!
//! "Not found" is never an error here: getters return `Ok(None)` and deletes
//! return `Ok(false)`. Every other API failure is propagated.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::{pinned_kind, ApiResource, Discovery, Scope};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::constants::{
    CLUSTER_API_GROUP, CLUSTER_KIND, DEFAULT_LIFECYCLE_VERSION, MACHINE_DEPLOYMENT_KIND,
};
use capstan_common::dynamic::ObjectRef;
use capstan_common::error::is_not_found;
use capstan_common::kube_utils::{
    build_api_resource, create_client_from_kubeconfig_bytes, gvk, type_of,
};
use capstan_common::{Error, PollOutcome};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "capstan";

/// Trait abstracting access to a cluster's API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Get a deployment, `None` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// List all deployments in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error>;

    /// Find the server's preferred version of `kind` in `group`
    ///
    /// Returns `None` when the group or kind is not served.
    async fn preferred_resource(
        &self,
        group: &str,
        kind: &str,
    ) -> Result<Option<ApiResource>, Error>;

    /// Get a namespaced dynamic object
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List dynamic objects in one namespace or across all of them
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create or update an object with server-side apply
    async fn apply(&self, object: &DynamicObject) -> Result<(), Error>;

    /// JSON merge patch a namespaced dynamic object
    async fn patch_merge(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Delete a namespaced dynamic object, `false` if it was already gone
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error>;

    /// Get the decoded data of a secret, `None` if it does not exist
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Build a client for another cluster from its kubeconfig
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ResourceClient>, Error>;
}

/// Readiness of a deployment: every desired replica ready, and at least one
pub fn deployment_readiness(deployment: &Deployment) -> PollOutcome<()> {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let status = deployment.status.as_ref();
    let replicas = status.and_then(|s| s.replicas).unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    if ready > 0 && ready == replicas {
        PollOutcome::Converged(())
    } else {
        PollOutcome::pending(format!(
            "deployment {} has {}/{} replicas ready",
            name, ready, replicas
        ))
    }
}

/// Served version of the core lifecycle kinds
///
/// Discovered at runtime; the version changes with control plane upgrades.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleApi {
    version: String,
}

impl Default for LifecycleApi {
    fn default() -> Self {
        Self::new(DEFAULT_LIFECYCLE_VERSION)
    }
}

impl LifecycleApi {
    /// Lifecycle kinds served at `version`
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    /// The served version, e.g. `v1beta1`
    pub fn version(&self) -> &str {
        &self.version
    }

    fn resource(&self, kind: &str) -> ApiResource {
        build_api_resource(&format!("{}/{}", CLUSTER_API_GROUP, self.version), kind)
    }

    /// `Cluster` resource
    pub fn cluster(&self) -> ApiResource {
        self.resource(CLUSTER_KIND)
    }

    /// `MachineDeployment` resource
    pub fn machine_deployment(&self) -> ApiResource {
        self.resource(MACHINE_DEPLOYMENT_KIND)
    }
}

/// Resource of the object a reference points at
pub fn referenced_resource(reference: &ObjectRef) -> ApiResource {
    build_api_resource(&reference.api_version, &reference.kind)
}

/// Real resource client backed by kube-rs
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Create a new client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn preferred_resource(
        &self,
        group: &str,
        kind: &str,
    ) -> Result<Option<ApiResource>, Error> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await?;

        let found = discovery
            .get(group)
            .and_then(|g| {
                g.recommended_resources()
                    .into_iter()
                    .find(|(ar, _)| ar.kind == kind)
            })
            .map(|(ar, _)| ar);

        debug!(
            group = %group,
            kind = %kind,
            api_version = ?found.as_ref().map(|ar| ar.api_version.as_str()),
            "resource discovery"
        );
        Ok(found)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic_api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => self.dynamic_api(resource, ns),
            None => Api::all_with(self.client.clone(), resource),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn apply(&self, object: &DynamicObject) -> Result<(), Error> {
        let (api_version, kind) = type_of(object)?;
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation(format!("{} object has no name", kind)))?;

        let (resource, caps) = pinned_kind(&self.client, &gvk(api_version, kind)).await?;
        let api: Api<DynamicObject> = match (&caps.scope, object.metadata.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => self.dynamic_api(&resource, ns),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await?;

        info!(
            kind = %kind,
            name = %name,
            namespace = ?object.metadata.namespace,
            "applied object"
        );
        Ok(())
    }

    async fn patch_merge(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        self.dynamic_api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        match self
            .dynamic_api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(kind = %resource.kind, name = %name, "already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn ResourceClient>, Error> {
        let client = create_client_from_kubeconfig_bytes(kubeconfig).await?;
        Ok(Arc::new(KubeResourceClient::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use rstest::rstest;

    #[test]
    fn lifecycle_resources_follow_discovered_version() {
        let api = LifecycleApi::new("v1beta2");
        let cluster = api.cluster();
        assert_eq!(cluster.api_version, "cluster.x-k8s.io/v1beta2");
        assert_eq!(cluster.plural, "clusters");
        assert_eq!(api.machine_deployment().plural, "machinedeployments");
        assert_eq!(LifecycleApi::default().version(), "v1beta1");
    }

    #[rstest]
    #[case::all_ready(Some(2), Some(2), true)]
    #[case::partially_ready(Some(3), Some(2), false)]
    #[case::scaled_to_zero(Some(0), Some(0), false)]
    #[case::no_status(None, None, false)]
    fn deployment_readiness_is_strict(
        #[case] replicas: Option<i32>,
        #[case] ready: Option<i32>,
        #[case] converged: bool,
    ) {
        let deployment = Deployment {
            status: Some(DeploymentStatus {
                replicas,
                ready_replicas: ready,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            matches!(deployment_readiness(&deployment), PollOutcome::Converged(())),
            converged
        );
    }
}
