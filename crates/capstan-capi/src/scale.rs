//! Replica scaling of a cluster's control plane or worker groups
//!
//! Scaling writes `spec.replicas` once, then waits for the lifecycle
//! controllers to report the new count and for the whole cluster to be ready
//! again. A request for the current count writes nothing.

use std::fmt;
use std::str::FromStr;

use kube::api::DynamicObject;
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::constants::SCALE_GRACE_PERIOD;
use capstan_common::dynamic::nested_i64;
use capstan_common::{poll_until_converged, Error, PollOutcome, Result};

/// Which machines of a cluster to scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeGroup {
    /// The control plane object behind `spec.controlPlaneRef`
    ControlPlanes,
    /// A worker `MachineDeployment`
    Workers,
}

impl fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeGroup::ControlPlanes => f.write_str("control-planes"),
            NodeGroup::Workers => f.write_str("workers"),
        }
    }
}

impl FromStr for NodeGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control-planes" | "controlplanes" | "control-plane" => Ok(NodeGroup::ControlPlanes),
            "workers" | "worker" => Ok(NodeGroup::Workers),
            other => Err(Error::validation(format!(
                "unknown node group {:?}, expected control-planes or workers",
                other
            ))),
        }
    }
}

/// Options of a scale request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaleOptions {
    /// Worker group to scale when the cluster has more than one
    pub machine_deployment: Option<String>,
}

impl Cluster {
    /// Scale `group` to `replicas` and wait for the cluster to converge
    ///
    /// Negative counts are rejected before anything is read. Scaling workers
    /// of a cluster with several `MachineDeployment`s requires
    /// [`ScaleOptions::machine_deployment`].
    pub async fn scale(
        &mut self,
        replicas: i64,
        group: NodeGroup,
        options: &ScaleOptions,
    ) -> Result<()> {
        if replicas < 0 {
            return Err(Error::InvalidReplicas {
                target: group.to_string(),
                replicas,
            });
        }

        let (resource, target) = match group {
            NodeGroup::ControlPlanes => self.control_planes().await?,
            NodeGroup::Workers => {
                let target = self.worker_group(options).await?;
                (self.api().machine_deployment(), target)
            }
        };
        let name = target.metadata.name.clone().unwrap_or_default();
        let namespace = target
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace().to_string());

        let current = nested_i64(&target.data, &["spec", "replicas"])?;
        if current == Some(replicas) {
            info!(cluster = %self.name(), target = %name, replicas, "already at requested replicas");
            return Ok(());
        }

        let operation = format!("scale of {} {}/{}", resource.kind, namespace, name);
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled { operation });
        }

        self.client()
            .patch_merge(
                &resource,
                &namespace,
                &name,
                &json!({ "spec": { "replicas": replicas } }),
            )
            .await?;
        info!(
            cluster = %self.name(),
            kind = %resource.kind,
            target = %name,
            from = ?current,
            to = replicas,
            "scaling"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled { operation }),
            _ = tokio::time::sleep(SCALE_GRACE_PERIOD) => {}
        }

        let this = &*self;
        let (resource, namespace, name) = (&resource, namespace.as_str(), name.as_str());
        poll_until_converged(&operation, this.convergence, &this.cancel, || async move {
            let Some(obj) = this.client().get(resource, namespace, name).await? else {
                return Ok(PollOutcome::pending(format!("{} {} not found", resource.kind, name)));
            };
            let observed = nested_i64(&obj.data, &["status", "replicas"])?;
            if observed != Some(replicas) {
                return Ok(PollOutcome::pending(format!(
                    "{} {} reports {} replicas, want {}",
                    resource.kind,
                    name,
                    observed.map_or_else(|| "no".to_string(), |r| r.to_string()),
                    replicas
                )));
            }
            Ok::<_, Error>(this.check_ready().await?.into_poll())
        })
        .await?;

        self.sync().await?;
        self.sync_nodes().await?;
        info!(cluster = %self.name(), target = %name, replicas, "scaled");
        Ok(())
    }

    /// The worker group a scale request targets
    async fn worker_group(&mut self, options: &ScaleOptions) -> Result<DynamicObject> {
        self.synced().await?;
        let mut workers = self.workers().await?;
        debug!(cluster = %self.name(), count = workers.len(), "worker groups");

        if let Some(wanted) = &options.machine_deployment {
            return workers
                .into_iter()
                .find(|md| md.metadata.name.as_deref() == Some(wanted.as_str()))
                .ok_or_else(|| {
                    Error::validation(format!(
                        "machine deployment {} not found in cluster {}",
                        wanted,
                        self.name()
                    ))
                });
        }

        match workers.len() {
            0 => Err(Error::validation(format!(
                "cluster {} has no machine deployments",
                self.name()
            ))),
            1 => Ok(workers.remove(0)),
            count => Err(Error::AmbiguousMachineGroup {
                cluster: self.name().to_string(),
                count,
            }),
        }
    }
}
