//! Centralized constants for the capstan-capi crate

use std::time::Duration;

use capstan_common::PollSettings;

// =============================================================================
// Cluster API groups, kinds and labels
// =============================================================================

/// Core Cluster API group (Cluster, Machine, MachineDeployment)
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

/// clusterctl group holding the `Provider` inventory records
pub const CLUSTERCTL_API_GROUP: &str = "clusterctl.cluster.x-k8s.io";

/// Version used for lifecycle kinds before discovery has run
pub const DEFAULT_LIFECYCLE_VERSION: &str = "v1beta1";

/// Version used for clusterctl `Provider` records before discovery has run
pub const DEFAULT_CLUSTERCTL_VERSION: &str = "v1alpha3";

/// Kind of the clusterctl inventory record
pub const PROVIDER_KIND: &str = "Provider";

/// Kind of the CAPI cluster object
pub const CLUSTER_KIND: &str = "Cluster";

/// Kind of the CAPI worker group object
pub const MACHINE_DEPLOYMENT_KIND: &str = "MachineDeployment";

/// Label carrying the owning cluster name on CAPI objects
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Provider record `type` of infrastructure providers
pub const INFRASTRUCTURE_PROVIDER_TYPE: &str = "InfrastructureProvider";

/// Phase reported by a MachineDeployment whose machines are all up
pub const PHASE_RUNNING: &str = "Running";

// =============================================================================
// Core providers
// =============================================================================

/// Name of the core Cluster API provider
pub const CORE_PROVIDER_NAME: &str = "cluster-api";

/// Namespace the core Cluster API controllers are installed into
pub const CAPI_NAMESPACE: &str = "capi-system";

/// Core Cluster API controller deployment
pub const CAPI_CONTROLLER: &str = "capi-controller-manager";

/// Default bootstrap provider
pub const DEFAULT_BOOTSTRAP_PROVIDER: &str = "talos";

/// Default control plane provider
pub const DEFAULT_CONTROL_PLANE_PROVIDER: &str = "talos";

/// Namespace cert-manager is installed into
pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";

// =============================================================================
// Deploy defaults
// =============================================================================

/// Default namespace for cluster objects
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default Kubernetes version of new clusters
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.30.0";

/// Default control plane machine count of new clusters
pub const DEFAULT_CONTROL_PLANE_MACHINE_COUNT: i64 = 1;

/// Default worker machine count of new clusters
pub const DEFAULT_WORKER_MACHINE_COUNT: i64 = 1;

/// Default Talos version of new clusters
pub const DEFAULT_TALOS_VERSION: &str = "v1.7.0";

// =============================================================================
// Waits
// =============================================================================

/// Budget for provider controllers to become ready after install
pub const PROVIDER_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Budget for each installer wait on cert-manager and component deployments
pub const INSTALL_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval between provider controller readiness checks
pub const PROVIDER_READY_INTERVAL: Duration = Duration::from_secs(5);

/// Cluster convergence after deploy or scale
pub const CONVERGENCE: PollSettings =
    PollSettings::new(Duration::from_secs(10), Duration::from_secs(30 * 60));

/// Workload cluster node health
pub const HEALTH: PollSettings =
    PollSettings::new(Duration::from_secs(10), Duration::from_secs(5 * 60));

/// Pause after a replica write before the first convergence check
pub const SCALE_GRACE_PERIOD: Duration = Duration::from_secs(2);
