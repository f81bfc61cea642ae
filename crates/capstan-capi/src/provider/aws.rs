//! AWS infrastructure provider (CAPA)
//!
//! Installs with base64-encoded credentials and renders Talos clusters on
//! EC2. Machine, network and security group parameters are passed to the
//! template as `AWS_*` variables.

use super::{
    insert_non_empty, Provider, ProviderDeployOptions, ProviderIdentity, ProviderKind,
    ProviderOptions, SetupOptions,
};
use capstan_common::credentials::{AwsCredentials, AWS_B64ENCODED_CREDENTIALS};
use capstan_common::{Error, Result, Variables};

/// Namespace CAPA is installed into by default
pub const CAPA_NAMESPACE: &str = "capa-system";

/// CAPA controller deployment
const CAPA_CONTROLLER: &str = "capa-controller-manager";

const AWS_TALOS_TEMPLATE: &str = include_str!("../../templates/aws-talos.yaml");

/// Credentials for installing CAPA
///
/// Pre-encoded credentials win over a key pair.
#[derive(Clone, Debug, Default)]
pub struct AwsSetupOptions {
    /// Value for `AWS_B64ENCODED_CREDENTIALS` as produced by clusterawsadm
    pub b64_encoded_credentials: Option<String>,
    /// Access key pair to encode
    pub credentials: Option<AwsCredentials>,
}

/// Machine and network parameters of an AWS cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsDeployOptions {
    /// AWS cloud controller manager version
    pub cloud_provider_version: String,
    /// Region to deploy into
    pub region: String,
    /// EC2 key pair name
    pub ssh_key_name: String,
    /// Existing VPC
    pub vpc_id: String,
    /// Existing subnet
    pub subnet: String,
    /// Control plane AMI
    pub control_plane_ami_id: String,
    /// Control plane instance type
    pub control_plane_machine_type: String,
    /// Control plane IAM instance profile
    pub control_plane_iam_profile: String,
    /// Extra security groups for control plane nodes
    pub control_plane_addl_sec_groups: Vec<String>,
    /// Control plane root volume size in GiB
    pub control_plane_vol_size: i64,
    /// Worker AMI
    pub worker_ami_id: String,
    /// Worker instance type
    pub worker_machine_type: String,
    /// Worker IAM instance profile
    pub worker_iam_profile: String,
    /// Extra security groups for worker nodes
    pub worker_addl_sec_groups: Vec<String>,
    /// Worker root volume size in GiB
    pub worker_vol_size: i64,
}

impl Default for AwsDeployOptions {
    fn default() -> Self {
        Self {
            cloud_provider_version: "v1.30.0".to_string(),
            region: String::new(),
            ssh_key_name: String::new(),
            vpc_id: String::new(),
            subnet: String::new(),
            control_plane_ami_id: String::new(),
            control_plane_machine_type: "t3.large".to_string(),
            control_plane_iam_profile: "control-plane.cluster-api-provider-aws.sigs.k8s.io"
                .to_string(),
            control_plane_addl_sec_groups: Vec::new(),
            control_plane_vol_size: 50,
            worker_ami_id: String::new(),
            worker_machine_type: "t3.large".to_string(),
            worker_iam_profile: "nodes.cluster-api-provider-aws.sigs.k8s.io".to_string(),
            worker_addl_sec_groups: Vec::new(),
            worker_vol_size: 50,
        }
    }
}

/// Render security group IDs as the YAML flow list the template expects
fn security_groups(ids: &[String]) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let items: Vec<String> = ids.iter().map(|id| format!("{{id: {}}}", id)).collect();
    format!("[{}]", items.join(", "))
}

/// Volume sizes of zero or less mean "use the template default"
fn volume_size(size: i64) -> String {
    if size > 0 {
        size.to_string()
    } else {
        String::new()
    }
}

/// AWS infrastructure provider
#[derive(Clone, Debug)]
pub struct AwsProvider {
    identity: ProviderIdentity,
    b64_encoded_credentials: String,
}

impl AwsProvider {
    /// Create an unconfigured AWS provider
    pub fn new(version: Option<String>, options: ProviderOptions) -> Self {
        Self {
            identity: ProviderIdentity::new(ProviderKind::Aws, version, CAPA_NAMESPACE, options),
            b64_encoded_credentials: String::new(),
        }
    }
}

impl Provider for AwsProvider {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    fn controller_name(&self) -> &'static str {
        CAPA_CONTROLLER
    }

    fn configure(&mut self, options: SetupOptions) -> Result<()> {
        let SetupOptions::Aws(options) = options else {
            return Err(Error::invalid_configuration(
                self.name(),
                "expected AWS setup options",
            ));
        };

        self.b64_encoded_credentials = match (options.b64_encoded_credentials, options.credentials)
        {
            (Some(encoded), _) if !encoded.is_empty() => encoded,
            (_, Some(credentials)) => credentials.to_b64_encoded(),
            _ => {
                return Err(Error::invalid_configuration(
                    self.name(),
                    "either encoded credentials or an access key pair is required",
                ))
            }
        };
        Ok(())
    }

    fn provider_vars(&self) -> Variables {
        let mut vars = Variables::new();
        insert_non_empty(&mut vars, AWS_B64ENCODED_CREDENTIALS, &*self.b64_encoded_credentials);
        vars
    }

    fn cluster_vars(&self, options: Option<&ProviderDeployOptions>) -> Result<Variables> {
        let defaults = AwsDeployOptions::default();
        let opts = match options {
            None => &defaults,
            Some(ProviderDeployOptions::Aws(opts)) => opts,
            Some(_) => {
                return Err(Error::invalid_provider_options(
                    self.name(),
                    "expected AWS deploy options",
                ))
            }
        };

        let mut vars = Variables::new();
        for (key, value) in [
            ("AWS_CLOUD_PROVIDER_VERSION", opts.cloud_provider_version.clone()),
            ("AWS_REGION", opts.region.clone()),
            ("AWS_SSH_KEY_NAME", opts.ssh_key_name.clone()),
            ("AWS_VPC_ID", opts.vpc_id.clone()),
            ("AWS_SUBNET", opts.subnet.clone()),
            ("AWS_CONTROL_PLANE_AMI_ID", opts.control_plane_ami_id.clone()),
            ("AWS_CONTROL_PLANE_MACHINE_TYPE", opts.control_plane_machine_type.clone()),
            ("AWS_CONTROL_PLANE_IAM_PROFILE", opts.control_plane_iam_profile.clone()),
            (
                "AWS_CONTROL_PLANE_ADDL_SEC_GROUPS",
                security_groups(&opts.control_plane_addl_sec_groups),
            ),
            ("AWS_CONTROL_PLANE_VOL_SIZE", volume_size(opts.control_plane_vol_size)),
            ("AWS_NODE_AMI_ID", opts.worker_ami_id.clone()),
            ("AWS_NODE_MACHINE_TYPE", opts.worker_machine_type.clone()),
            ("AWS_NODE_IAM_PROFILE", opts.worker_iam_profile.clone()),
            ("AWS_NODE_ADDL_SEC_GROUPS", security_groups(&opts.worker_addl_sec_groups)),
            ("AWS_NODE_VOL_SIZE", volume_size(opts.worker_vol_size)),
        ] {
            insert_non_empty(&mut vars, key, value);
        }
        Ok(vars)
    }

    fn default_template(&self) -> &'static str {
        AWS_TALOS_TEMPLATE
    }
}
