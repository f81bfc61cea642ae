//! Cluster readiness state machine
//!
//! A cluster is ready when all of the following hold, checked in order:
//! 1. the `Cluster` object exists and its `Ready` condition is `True`
//! 2. the control plane behind `spec.controlPlaneRef` is `ready` and
//!    `initialized`
//! 3. the control plane has exactly as many ready replicas as replicas
//! 4. every worker `MachineDeployment` of the cluster is `Running` with all
//!    replicas ready
//!
//! The first unmet condition is reported as a [`NotReadyReason`]. Those are
//! expected while a cluster converges; only malformed objects and API
//! failures are errors.

use std::fmt;

use kube::api::DynamicObject;

use crate::client::{referenced_resource, LifecycleApi, ResourceClient};
use crate::constants::{CLUSTER_NAME_LABEL, PHASE_RUNNING};
use capstan_common::dynamic::{condition_status, nested_bool, nested_i64, nested_slice, nested_str, ObjectRef};
use capstan_common::kube_utils::{CONDITION_READY, STATUS_TRUE};
use capstan_common::{PollOutcome, Result};

/// Why a cluster is not ready yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotReadyReason {
    /// The `Cluster` object does not exist (yet)
    ClusterNotFound,
    /// The cluster has no status conditions
    ClusterStatusUnknown,
    /// The `Ready` condition is absent or not `True`
    ClusterNotReady,
    /// The referenced control plane object does not exist (yet)
    ControlPlaneNotFound {
        /// Control plane kind
        kind: String,
        /// Control plane name
        name: String,
    },
    /// `status.ready` of the control plane is absent or false
    ControlPlaneNotReady,
    /// `status.initialized` of the control plane is absent or false
    ControlPlaneNotInitialized,
    /// `status.replicas` or `status.readyReplicas` is absent
    ReplicasUnknown {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },
    /// Ready replicas differ from replicas
    ReplicasMismatch {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
        /// `status.replicas`
        replicas: i64,
        /// `status.readyReplicas`
        ready: i64,
    },
    /// A worker group is not in the `Running` phase
    MachineDeploymentNotRunning {
        /// MachineDeployment name
        name: String,
        /// Reported phase, if any
        phase: Option<String>,
    },
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::ClusterNotFound => write!(f, "cluster not found"),
            NotReadyReason::ClusterStatusUnknown => write!(f, "cluster status is unknown"),
            NotReadyReason::ClusterNotReady => write!(f, "cluster is not ready"),
            NotReadyReason::ControlPlaneNotFound { kind, name } => {
                write!(f, "control plane {} {} not found", kind, name)
            }
            NotReadyReason::ControlPlaneNotReady => write!(f, "control plane is not ready"),
            NotReadyReason::ControlPlaneNotInitialized => {
                write!(f, "control plane is not initialized")
            }
            NotReadyReason::ReplicasUnknown { kind, name } => {
                write!(f, "{} {} does not report replicas yet", kind, name)
            }
            NotReadyReason::ReplicasMismatch {
                kind,
                name,
                replicas,
                ready,
            } => write!(
                f,
                "{} {} replicas {} != ready replicas {} ({} missing)",
                kind,
                name,
                replicas,
                ready,
                replicas - ready
            ),
            NotReadyReason::MachineDeploymentNotRunning { name, phase } => write!(
                f,
                "machine deployment {} phase is {}",
                name,
                phase.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// Outcome of one readiness evaluation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every readiness condition holds
    Ready,
    /// The first condition that does not hold
    NotReady(NotReadyReason),
}

impl Readiness {
    /// Whether the cluster is ready
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// As a poll outcome for [`poll_until_converged`](capstan_common::poll_until_converged)
    pub fn into_poll(self) -> PollOutcome<()> {
        match self {
            Readiness::Ready => PollOutcome::Converged(()),
            Readiness::NotReady(reason) => PollOutcome::Pending(reason.to_string()),
        }
    }
}

impl From<NotReadyReason> for Readiness {
    fn from(reason: NotReadyReason) -> Self {
        Readiness::NotReady(reason)
    }
}

fn kind_and_name(obj: &DynamicObject) -> (String, String) {
    (
        obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

/// Strict replica check on `status.replicas` / `status.readyReplicas`
pub fn replicas_ready(obj: &DynamicObject) -> Result<Option<NotReadyReason>> {
    let ready = nested_i64(&obj.data, &["status", "readyReplicas"])?;
    let replicas = nested_i64(&obj.data, &["status", "replicas"])?;
    let (kind, name) = kind_and_name(obj);

    Ok(match (replicas, ready) {
        (Some(replicas), Some(ready)) if replicas == ready => None,
        (Some(replicas), Some(ready)) => Some(NotReadyReason::ReplicasMismatch {
            kind,
            name,
            replicas,
            ready,
        }),
        _ => Some(NotReadyReason::ReplicasUnknown { kind, name }),
    })
}

/// Conditions of the `Cluster` object itself
pub fn cluster_conditions(cluster: &DynamicObject) -> Result<Option<NotReadyReason>> {
    if nested_slice(&cluster.data, &["status", "conditions"])?.is_none() {
        return Ok(Some(NotReadyReason::ClusterStatusUnknown));
    }
    Ok(match condition_status(&cluster.data, CONDITION_READY)? {
        Some(STATUS_TRUE) => None,
        _ => Some(NotReadyReason::ClusterNotReady),
    })
}

/// Readiness of a control plane object
pub fn control_plane_ready(control_plane: &DynamicObject) -> Result<Option<NotReadyReason>> {
    if nested_bool(&control_plane.data, &["status", "ready"])? != Some(true) {
        return Ok(Some(NotReadyReason::ControlPlaneNotReady));
    }
    if nested_bool(&control_plane.data, &["status", "initialized"])? != Some(true) {
        return Ok(Some(NotReadyReason::ControlPlaneNotInitialized));
    }
    replicas_ready(control_plane)
}

/// Readiness of a worker MachineDeployment
///
/// A missing phase counts as not running.
pub fn machine_deployment_ready(md: &DynamicObject) -> Result<Option<NotReadyReason>> {
    let phase = nested_str(&md.data, &["status", "phase"])?;
    if phase != Some(PHASE_RUNNING) {
        return Ok(Some(NotReadyReason::MachineDeploymentNotRunning {
            name: md.metadata.name.clone().unwrap_or_default(),
            phase: phase.map(str::to_string),
        }));
    }
    replicas_ready(md)
}

/// Label selector matching the worker groups of cluster `name`
pub fn cluster_selector(name: &str) -> String {
    format!("{}={}", CLUSTER_NAME_LABEL, name)
}

/// Evaluate readiness of cluster `namespace/name` against fresh remote state
///
/// Every call re-reads the cluster, its control plane and its worker groups.
/// A cluster without `spec.controlPlaneRef` is an error, not a pending state.
pub async fn check_cluster_ready(
    client: &dyn ResourceClient,
    api: &LifecycleApi,
    name: &str,
    namespace: &str,
) -> Result<Readiness> {
    let Some(cluster) = client.get(&api.cluster(), namespace, name).await? else {
        return Ok(NotReadyReason::ClusterNotFound.into());
    };
    if let Some(reason) = cluster_conditions(&cluster)? {
        return Ok(reason.into());
    }

    let reference = ObjectRef::from_field(&cluster.data, &["spec", "controlPlaneRef"], namespace)?;
    let Some(control_plane) = client
        .get(&referenced_resource(&reference), &reference.namespace, &reference.name)
        .await?
    else {
        return Ok(NotReadyReason::ControlPlaneNotFound {
            kind: reference.kind,
            name: reference.name,
        }
        .into());
    };
    if let Some(reason) = control_plane_ready(&control_plane)? {
        return Ok(reason.into());
    }

    let workers = client
        .list(
            &api.machine_deployment(),
            Some(namespace.to_string()),
            Some(cluster_selector(name)),
        )
        .await?;
    for md in &workers {
        if let Some(reason) = machine_deployment_ready(md)? {
            return Ok(reason.into());
        }
    }

    Ok(Readiness::Ready)
}
