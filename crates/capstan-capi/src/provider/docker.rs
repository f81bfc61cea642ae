//! Docker infrastructure provider (CAPD)
//!
//! For local development clusters. No credentials; the template takes the
//! pod/service CIDRs and the node image.

use super::{
    insert_non_empty, Provider, ProviderDeployOptions, ProviderIdentity, ProviderKind,
    ProviderOptions, SetupOptions,
};
use capstan_common::{Error, Result, Variables};

/// Namespace CAPD is installed into by default
pub const CAPD_NAMESPACE: &str = "capd-system";

/// CAPD controller deployment
const CAPD_CONTROLLER: &str = "capd-controller-manager";

const DOCKER_TEMPLATE: &str = include_str!("../../templates/docker.yaml");

/// Network and image parameters of a Docker cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DockerDeployOptions {
    /// Pod network CIDR
    pub pod_cidr: String,
    /// Service network CIDR
    pub service_cidr: String,
    /// Node container image; empty for the template default
    pub node_image: String,
}

impl Default for DockerDeployOptions {
    fn default() -> Self {
        Self {
            pod_cidr: "192.168.0.0/16".to_string(),
            service_cidr: "10.128.0.0/12".to_string(),
            node_image: String::new(),
        }
    }
}

/// Docker infrastructure provider
#[derive(Clone, Debug)]
pub struct DockerProvider {
    identity: ProviderIdentity,
}

impl DockerProvider {
    /// Create a Docker provider
    pub fn new(version: Option<String>, options: ProviderOptions) -> Self {
        Self {
            identity: ProviderIdentity::new(
                ProviderKind::Docker,
                version,
                CAPD_NAMESPACE,
                options,
            ),
        }
    }
}

impl Provider for DockerProvider {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    fn controller_name(&self) -> &'static str {
        CAPD_CONTROLLER
    }

    fn configure(&mut self, options: SetupOptions) -> Result<()> {
        match options {
            SetupOptions::Docker => Ok(()),
            _ => Err(Error::invalid_configuration(
                self.name(),
                "docker takes no setup options",
            )),
        }
    }

    fn provider_vars(&self) -> Variables {
        Variables::new()
    }

    fn cluster_vars(&self, options: Option<&ProviderDeployOptions>) -> Result<Variables> {
        let defaults = DockerDeployOptions::default();
        let opts = match options {
            None => &defaults,
            Some(ProviderDeployOptions::Docker(opts)) => opts,
            Some(_) => {
                return Err(Error::invalid_provider_options(
                    self.name(),
                    "expected Docker deploy options",
                ))
            }
        };

        let mut vars = Variables::new();
        insert_non_empty(&mut vars, "DOCKER_POD_CIDRS", &*opts.pod_cidr);
        insert_non_empty(&mut vars, "DOCKER_SERVICE_CIDRS", &*opts.service_cidr);
        insert_non_empty(&mut vars, "DOCKER_NODE_IMAGE", &*opts.node_image);
        Ok(vars)
    }

    fn default_template(&self) -> &'static str {
        DOCKER_TEMPLATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AwsDeployOptions, AwsSetupOptions};

    #[test]
    fn configure_accepts_only_docker_options() {
        let mut p = DockerProvider::new(None, ProviderOptions::default());
        p.configure(SetupOptions::Docker).unwrap();
        let err = p
            .configure(SetupOptions::Aws(AwsSetupOptions::default()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }

    #[test]
    fn cluster_vars_carry_network_settings() {
        let p = DockerProvider::new(None, ProviderOptions::default());
        let vars = p
            .cluster_vars(Some(&ProviderDeployOptions::Docker(DockerDeployOptions {
                pod_cidr: "10.244.0.0/16".to_string(),
                ..Default::default()
            })))
            .unwrap();
        assert_eq!(vars["DOCKER_POD_CIDRS"], "10.244.0.0/16");
        assert_eq!(vars["DOCKER_SERVICE_CIDRS"], "10.128.0.0/12");
        assert!(!vars.contains_key("DOCKER_NODE_IMAGE"));
    }

    #[test]
    fn cluster_vars_reject_aws_options() {
        let p = DockerProvider::new(None, ProviderOptions::default());
        let err = p
            .cluster_vars(Some(&ProviderDeployOptions::Aws(AwsDeployOptions::default())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProviderOptions { ref provider, .. } if provider == "docker"));
    }

    #[test]
    fn needs_no_install_variables() {
        assert!(DockerProvider::new(None, ProviderOptions::default())
            .provider_vars()
            .is_empty());
    }
}
