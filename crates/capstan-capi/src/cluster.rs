//! Workload cluster handle
//!
//! A [`Cluster`] names a `Cluster` object in the management cluster and keeps
//! a snapshot of it. Remote state changes under us, so every operation that
//! reads cluster fields re-syncs first. The workload cluster's own API client
//! is derived lazily from the `<name>-kubeconfig` secret.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::api::{ApiResource, DynamicObject};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{referenced_resource, LifecycleApi, ResourceClient};
use crate::readiness::{check_cluster_ready, cluster_selector, Readiness};
use capstan_common::dynamic::ObjectRef;
use capstan_common::kube_utils::{CONDITION_READY, STATUS_TRUE};
use capstan_common::{poll_until_converged, Error, PollOutcome, PollSettings, Result};

/// Label marking control plane nodes
const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Secret key holding the kubeconfig in `<name>-kubeconfig`
const KUBECONFIG_SECRET_KEY: &str = "value";

/// Node addresses of a workload cluster, one entry per node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    /// Internal addresses of control plane nodes
    pub control_plane: Vec<String>,
    /// Internal addresses of worker nodes
    pub workers: Vec<String>,
    /// External control plane addresses, falling back to internal ones
    pub endpoints: Vec<String>,
}

impl NodeAddresses {
    /// Classify nodes by role
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let mut out = Self::default();
        let mut external = Vec::new();

        for node in nodes {
            let control_plane = node
                .metadata
                .labels
                .as_ref()
                .is_some_and(|l| l.contains_key(CONTROL_PLANE_ROLE_LABEL));
            let addresses = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_deref())
                .unwrap_or_default();

            if let Some(internal) = addresses.iter().find(|a| a.type_ == "InternalIP") {
                if control_plane {
                    out.control_plane.push(internal.address.clone());
                } else {
                    out.workers.push(internal.address.clone());
                }
            }
            if control_plane {
                external.extend(
                    addresses
                        .iter()
                        .filter(|a| a.type_ == "ExternalIP")
                        .map(|a| a.address.clone()),
                );
            }
        }

        out.endpoints = if external.is_empty() {
            out.control_plane.clone()
        } else {
            external
        };
        out
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
}

/// Handle on a workload cluster managed through the lifecycle control plane
pub struct Cluster {
    client: Arc<dyn ResourceClient>,
    api: LifecycleApi,
    name: String,
    namespace: String,
    snapshot: Option<DynamicObject>,
    workload: Option<Arc<dyn ResourceClient>>,
    nodes: NodeAddresses,
    pub(crate) convergence: PollSettings,
    pub(crate) health: PollSettings,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("api", &self.api)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl Cluster {
    pub(crate) fn new(
        client: Arc<dyn ResourceClient>,
        api: LifecycleApi,
        name: impl Into<String>,
        namespace: impl Into<String>,
        convergence: PollSettings,
        health: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            api,
            name: name.into(),
            namespace: namespace.into(),
            snapshot: None,
            workload: None,
            nodes: NodeAddresses::default(),
            convergence,
            health,
            cancel,
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Last synced `Cluster` object
    pub fn snapshot(&self) -> Option<&DynamicObject> {
        self.snapshot.as_ref()
    }

    /// Node addresses cached by the last [`Cluster::sync_nodes`]
    pub fn nodes(&self) -> &NodeAddresses {
        &self.nodes
    }

    pub(crate) fn client(&self) -> &dyn ResourceClient {
        self.client.as_ref()
    }

    pub(crate) fn api(&self) -> &LifecycleApi {
        &self.api
    }

    /// Refresh the snapshot; `false` when the object does not exist
    pub async fn sync(&mut self) -> Result<bool> {
        self.snapshot = self
            .client
            .get(&self.api.cluster(), &self.namespace, &self.name)
            .await?;
        Ok(self.snapshot.is_some())
    }

    /// Refresh the snapshot, failing when the cluster is gone
    pub(crate) async fn synced(&mut self) -> Result<&DynamicObject> {
        self.sync().await?;
        self.snapshot.as_ref().ok_or_else(|| Error::ClusterNotFound {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        })
    }

    /// The control plane object behind `spec.controlPlaneRef`
    pub async fn control_planes(&mut self) -> Result<(ApiResource, DynamicObject)> {
        let namespace = self.namespace.clone();
        let reference =
            ObjectRef::from_field(&self.synced().await?.data, &["spec", "controlPlaneRef"], &namespace)?;
        let resource = referenced_resource(&reference);

        let control_plane = self
            .client
            .get(&resource, &reference.namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!(
                    "control plane {} {}/{} of cluster {} not found",
                    reference.kind, reference.namespace, reference.name, self.name
                ))
            })?;
        Ok((resource, control_plane))
    }

    /// Worker MachineDeployments of the cluster
    pub async fn workers(&self) -> Result<Vec<DynamicObject>> {
        self.client
            .list(
                &self.api.machine_deployment(),
                Some(self.namespace.clone()),
                Some(cluster_selector(&self.name)),
            )
            .await
    }

    /// Evaluate readiness once against fresh remote state
    pub async fn check_ready(&self) -> Result<Readiness> {
        check_cluster_ready(self.client.as_ref(), &self.api, &self.name, &self.namespace).await
    }

    /// Poll until the cluster is ready, then refresh the snapshot
    pub async fn wait_ready(&mut self, settings: PollSettings) -> Result<()> {
        let this = &*self;
        poll_until_converged(
            &format!("cluster {}/{} readiness", this.namespace, this.name),
            settings,
            &this.cancel,
            || async move { Ok::<_, Error>(this.check_ready().await?.into_poll()) },
        )
        .await?;

        info!(cluster = %self.name, namespace = %self.namespace, "cluster ready");
        self.sync().await?;
        Ok(())
    }

    /// Client for the workload cluster's own API server
    pub async fn workload_client(&mut self) -> Result<Arc<dyn ResourceClient>> {
        if let Some(client) = &self.workload {
            return Ok(client.clone());
        }

        let secret = format!("{}-kubeconfig", self.name);
        let data = self
            .client
            .get_secret_data(&self.namespace, &secret)
            .await?
            .ok_or_else(|| {
                Error::validation(format!(
                    "kubeconfig secret {}/{} not found",
                    self.namespace, secret
                ))
            })?;
        let kubeconfig = data.get(KUBECONFIG_SECRET_KEY).ok_or_else(|| {
            Error::field_not_found(&["data", KUBECONFIG_SECRET_KEY])
        })?;

        let client = self.client.connect(kubeconfig).await?;
        self.workload = Some(client.clone());
        Ok(client)
    }

    /// Refresh the cached node addresses from the workload cluster
    pub async fn sync_nodes(&mut self) -> Result<&NodeAddresses> {
        let nodes = self.workload_client().await?.list_nodes().await?;
        let addresses = NodeAddresses::from_nodes(&nodes);
        if addresses.control_plane.is_empty() {
            return Err(Error::validation(format!(
                "failed to find control plane nodes of cluster {}",
                self.name
            )));
        }

        debug!(
            cluster = %self.name,
            control_planes = addresses.control_plane.len(),
            workers = addresses.workers.len(),
            "synced node addresses"
        );
        self.nodes = addresses;
        Ok(&self.nodes)
    }

    /// Wait until every workload node is ready and node counts match the cache
    ///
    /// Failures during the wait, API errors included, are retried until the
    /// health budget runs out.
    pub async fn health(&mut self) -> Result<()> {
        if self.workload.is_none() || self.nodes.control_plane.is_empty() {
            self.sync_nodes().await?;
        }
        let workload = self.workload_client().await?;
        let expected = (self.nodes.control_plane.len(), self.nodes.workers.len());
        let workload = &workload;

        poll_until_converged(
            &format!("cluster {} health", self.name),
            self.health,
            &self.cancel,
            || async move {
                let nodes = match workload.list_nodes().await {
                    Ok(nodes) => nodes,
                    Err(e) => return Ok(PollOutcome::pending(e.to_string())),
                };
                if let Some(node) = nodes.iter().find(|n| !node_is_ready(n)) {
                    return Ok(PollOutcome::pending(format!(
                        "node {} is not ready",
                        node.metadata.name.as_deref().unwrap_or_default()
                    )));
                }
                let found = NodeAddresses::from_nodes(&nodes);
                let counts = (found.control_plane.len(), found.workers.len());
                if counts != expected {
                    return Ok(PollOutcome::pending(format!(
                        "expected {} control plane and {} worker nodes, found {} and {}",
                        expected.0, expected.1, counts.0, counts.1
                    )));
                }
                Ok(PollOutcome::Converged(()))
            },
        )
        .await?;

        info!(cluster = %self.name, "cluster healthy");
        Ok(())
    }

    /// Delete the `Cluster` object and wait until it is gone
    pub async fn delete(&mut self) -> Result<()> {
        let resource = self.api.cluster();
        if !self
            .client
            .delete(&resource, &self.namespace, &self.name)
            .await?
        {
            debug!(cluster = %self.name, "cluster already deleted");
        }

        let (client, namespace, name) = (self.client.as_ref(), &self.namespace, &self.name);
        let resource = &resource;
        poll_until_converged(
            &format!("cluster {}/{} deletion", namespace, name),
            self.convergence,
            &self.cancel,
            || async move {
                Ok::<_, Error>(match client.get(resource, namespace, name).await? {
                    Some(_) => PollOutcome::pending("cluster still exists"),
                    None => PollOutcome::Converged(()),
                })
            },
        )
        .await?;

        info!(cluster = %self.name, namespace = %self.namespace, "cluster deleted");
        self.snapshot = None;
        self.workload = None;
        self.nodes = NodeAddresses::default();
        Ok(())
    }
}
