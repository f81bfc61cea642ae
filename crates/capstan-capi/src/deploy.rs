//! Cluster deployment pipeline
//!
//! `deploy_cluster` picks an installed provider, computes template variables,
//! materializes the provider's cluster template, applies every object and
//! waits for the new cluster to converge. Objects already applied stay in
//! place when a later step fails; deploying again applies them idempotently.

use tracing::info;

use crate::cluster::Cluster;
use crate::constants::{
    DEFAULT_CONTROL_PLANE_MACHINE_COUNT, DEFAULT_KUBERNETES_VERSION, DEFAULT_NAMESPACE,
    DEFAULT_TALOS_VERSION, DEFAULT_WORKER_MACHINE_COUNT,
};
use crate::manager::Manager;
use crate::provider::{Provider, ProviderDeployOptions};
use crate::template::{TemplateOptions, TemplateSource};
use capstan_common::{Error, Result, Variables};

/// Desired shape of a new cluster
///
/// Built from [`DeployOptions::default`] with the `with_*` setters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOptions {
    /// Control plane machine count
    pub control_plane_machine_count: i64,
    /// Worker machine count
    pub worker_machine_count: i64,
    /// Talos version of the nodes
    pub talos_version: String,
    /// Kubernetes version of the cluster
    pub kubernetes_version: String,
    /// Namespace of the cluster objects
    pub namespace: String,
    /// Provider to deploy with; the first installed one when unset
    pub provider: Option<String>,
    /// Provider version to match, any when unset
    pub provider_version: Option<String>,
    /// Where the cluster template comes from
    pub template: TemplateSource,
    /// Provider specific machine and network parameters
    pub provider_options: Option<ProviderDeployOptions>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            control_plane_machine_count: DEFAULT_CONTROL_PLANE_MACHINE_COUNT,
            worker_machine_count: DEFAULT_WORKER_MACHINE_COUNT,
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            provider: None,
            provider_version: None,
            template: TemplateSource::ProviderDefault,
            provider_options: None,
        }
    }
}

impl DeployOptions {
    /// Set the control plane machine count
    pub fn with_control_planes(mut self, count: i64) -> Self {
        self.control_plane_machine_count = count;
        self
    }

    /// Set the worker machine count
    pub fn with_workers(mut self, count: i64) -> Self {
        self.worker_machine_count = count;
        self
    }

    /// Set the Talos version of the machines
    pub fn with_talos_version(mut self, version: impl Into<String>) -> Self {
        self.talos_version = version.into();
        self
    }

    /// Set the Kubernetes version of the cluster
    pub fn with_kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = version.into();
        self
    }

    /// Set the namespace the cluster objects are created in
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Pick the infrastructure provider by name, optionally pinned to a version
    ///
    /// Unset, the single installed provider is used.
    pub fn with_provider(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.provider = Some(name.into());
        self.provider_version = version;
        self
    }

    /// Set where the cluster template comes from
    pub fn with_template(mut self, template: TemplateSource) -> Self {
        self.template = template;
        self
    }

    /// Set provider-specific deploy options
    pub fn with_provider_options(mut self, options: ProviderDeployOptions) -> Self {
        self.provider_options = Some(options);
        self
    }

    /// Reject counts below zero and empty names
    pub fn validate(&self) -> Result<()> {
        for (target, count) in [
            ("control plane machines", self.control_plane_machine_count),
            ("worker machines", self.worker_machine_count),
        ] {
            if count < 0 {
                return Err(Error::InvalidReplicas {
                    target: target.to_string(),
                    replicas: count,
                });
            }
        }
        if self.namespace.is_empty() {
            return Err(Error::validation("cluster namespace must not be empty"));
        }
        if self.provider.as_deref() == Some("") {
            return Err(Error::validation("provider name must not be empty"));
        }
        Ok(())
    }

    /// Variables every template receives
    fn common_vars(&self, cluster_name: &str) -> Variables {
        Variables::from([
            ("TALOS_VERSION".to_string(), self.talos_version.clone()),
            ("KUBERNETES_VERSION".to_string(), self.kubernetes_version.clone()),
            ("CLUSTER_NAME".to_string(), cluster_name.to_string()),
            (
                "CONTROL_PLANE_MACHINE_COUNT".to_string(),
                self.control_plane_machine_count.to_string(),
            ),
            (
                "WORKER_MACHINE_COUNT".to_string(),
                self.worker_machine_count.to_string(),
            ),
            ("NAMESPACE".to_string(), self.namespace.clone()),
        ])
    }
}

/// The provider a deployment uses
fn select_provider<'a>(
    providers: &'a [Box<dyn Provider>],
    options: &DeployOptions,
) -> Result<&'a dyn Provider> {
    let first = providers.first().ok_or(Error::NoProviderInstalled)?;
    let Some(wanted) = options.provider.as_deref() else {
        return Ok(first.as_ref());
    };

    providers
        .iter()
        .find(|p| {
            p.name() == wanted
                && options
                    .provider_version
                    .as_deref()
                    .map_or(true, |v| p.version() == Some(v))
        })
        .map(|p| p.as_ref())
        .ok_or_else(|| Error::ProviderNotFound {
            name: wanted.to_string(),
            version: options.provider_version.clone(),
        })
}

impl Manager {
    /// Create cluster `name` and wait until it is ready
    pub async fn deploy_cluster(&mut self, name: &str, options: DeployOptions) -> Result<Cluster> {
        if name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        options.validate()?;

        let provider = select_provider(&self.providers, &options)?;
        let mut vars = options.common_vars(name);
        vars.extend(provider.cluster_vars(options.provider_options.as_ref())?);
        self.config.inject(&vars);

        let template_options = TemplateOptions {
            cluster_name: name.to_string(),
            namespace: options.namespace.clone(),
            kubernetes_version: options.kubernetes_version.clone(),
            control_plane_machine_count: options.control_plane_machine_count,
            worker_machine_count: options.worker_machine_count,
            source: options.template.clone(),
        };
        let template = provider
            .get_cluster_template(self.renderer.as_ref(), &self.config, &template_options)
            .await?;
        info!(
            cluster = %name,
            provider = %provider.token(),
            objects = template.len(),
            "applying cluster template"
        );

        for object in &template.objects {
            self.client.apply(object).await?;
        }

        let mut cluster = self.cluster_handle(name, &options.namespace);
        cluster.wait_ready(self.options().convergence).await?;
        self.fetch_state().await?;

        info!(cluster = %name, namespace = %options.namespace, "cluster deployed");
        Ok(cluster)
    }
}
