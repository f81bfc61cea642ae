//! Cluster command - create and operate workload clusters
//!
//! Usage:
//!   capstan cluster -n demo create --provider docker --workers 2
//!   capstan cluster -n demo scale --nodes workers --replicas 3
//!   capstan cluster -n demo health
//!   capstan cluster -n demo delete

use std::path::PathBuf;

use clap::{Args, Subcommand};

use capstan_capi::constants::{
    DEFAULT_CONTROL_PLANE_MACHINE_COUNT, DEFAULT_KUBERNETES_VERSION, DEFAULT_NAMESPACE,
    DEFAULT_TALOS_VERSION, DEFAULT_WORKER_MACHINE_COUNT,
};
use capstan_capi::{
    AwsDeployOptions, Cluster, DeployOptions, DockerDeployOptions, ManagerOptions, NodeGroup,
    ProviderDeployOptions, ProviderKind, ScaleOptions, TemplateSource,
};

use super::Session;
use crate::Result;

/// Operate a workload cluster
#[derive(Args, Debug)]
pub struct ClusterArgs {
    /// Cluster name
    #[arg(short = 'n', long)]
    pub name: String,

    /// Namespace of the cluster objects
    #[arg(short = 'N', long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    #[command(subcommand)]
    pub command: ClusterCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// Render the cluster template, apply it and wait for readiness
    Create(CreateArgs),
    /// Change the control plane or worker replica count
    Scale(ScaleArgs),
    /// Wait until every node of the cluster is ready
    Health,
    /// Delete the cluster and wait until it is gone
    Delete,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Infrastructure provider, the only installed one when unset
    #[arg(long)]
    pub provider: Option<String>,

    /// Installed provider version to use
    #[arg(long, requires = "provider")]
    pub provider_version: Option<String>,

    /// Control plane machine count
    #[arg(long, default_value_t = DEFAULT_CONTROL_PLANE_MACHINE_COUNT)]
    pub control_planes: i64,

    /// Worker machine count
    #[arg(long, default_value_t = DEFAULT_WORKER_MACHINE_COUNT)]
    pub workers: i64,

    /// Kubernetes version
    #[arg(long, default_value = DEFAULT_KUBERNETES_VERSION)]
    pub kubernetes_version: String,

    /// Talos version
    #[arg(long, default_value = DEFAULT_TALOS_VERSION)]
    pub talos_version: String,

    /// Cluster template instead of the provider's
    #[arg(long)]
    pub template_file: Option<PathBuf>,

    #[command(flatten)]
    pub aws: AwsFlags,

    #[command(flatten)]
    pub docker: DockerFlags,
}

/// AWS machine and network flags
#[derive(Args, Debug, Default)]
pub struct AwsFlags {
    /// AWS region
    #[arg(long)]
    pub aws_region: Option<String>,

    /// EC2 key pair
    #[arg(long)]
    pub aws_ssh_key_name: Option<String>,

    /// Existing VPC
    #[arg(long)]
    pub aws_vpc_id: Option<String>,

    /// Existing subnet
    #[arg(long)]
    pub aws_subnet: Option<String>,

    /// Control plane AMI
    #[arg(long)]
    pub aws_control_plane_ami: Option<String>,

    /// Control plane instance type
    #[arg(long)]
    pub aws_control_plane_machine_type: Option<String>,

    /// Extra control plane security groups
    #[arg(long, value_delimiter = ',')]
    pub aws_control_plane_security_groups: Vec<String>,

    /// Worker AMI
    #[arg(long)]
    pub aws_worker_ami: Option<String>,

    /// Worker instance type
    #[arg(long)]
    pub aws_worker_machine_type: Option<String>,

    /// Extra worker security groups
    #[arg(long, value_delimiter = ',')]
    pub aws_worker_security_groups: Vec<String>,
}

impl AwsFlags {
    fn deploy_options(&self) -> AwsDeployOptions {
        let mut out = AwsDeployOptions::default();
        let set = |field: &mut String, value: &Option<String>| {
            if let Some(v) = value {
                *field = v.clone();
            }
        };
        set(&mut out.region, &self.aws_region);
        set(&mut out.ssh_key_name, &self.aws_ssh_key_name);
        set(&mut out.vpc_id, &self.aws_vpc_id);
        set(&mut out.subnet, &self.aws_subnet);
        set(&mut out.control_plane_ami_id, &self.aws_control_plane_ami);
        set(
            &mut out.control_plane_machine_type,
            &self.aws_control_plane_machine_type,
        );
        set(&mut out.worker_ami_id, &self.aws_worker_ami);
        set(&mut out.worker_machine_type, &self.aws_worker_machine_type);
        out.control_plane_addl_sec_groups = self.aws_control_plane_security_groups.clone();
        out.worker_addl_sec_groups = self.aws_worker_security_groups.clone();
        out
    }
}

/// Docker network and image flags
#[derive(Args, Debug, Default)]
pub struct DockerFlags {
    /// Pod network CIDR
    #[arg(long)]
    pub docker_pod_cidr: Option<String>,

    /// Service network CIDR
    #[arg(long)]
    pub docker_service_cidr: Option<String>,

    /// Node image
    #[arg(long)]
    pub docker_node_image: Option<String>,
}

impl DockerFlags {
    fn deploy_options(&self) -> DockerDeployOptions {
        let defaults = DockerDeployOptions::default();
        DockerDeployOptions {
            pod_cidr: self.docker_pod_cidr.clone().unwrap_or(defaults.pod_cidr),
            service_cidr: self
                .docker_service_cidr
                .clone()
                .unwrap_or(defaults.service_cidr),
            node_image: self
                .docker_node_image
                .clone()
                .unwrap_or(defaults.node_image),
        }
    }
}

impl CreateArgs {
    fn deploy_options(&self, namespace: &str) -> DeployOptions {
        let mut options = DeployOptions::default()
            .with_control_planes(self.control_planes)
            .with_workers(self.workers)
            .with_kubernetes_version(&self.kubernetes_version)
            .with_talos_version(&self.talos_version)
            .with_namespace(namespace);

        if let Some(path) = &self.template_file {
            options = options.with_template(TemplateSource::File(path.clone()));
        }

        if let Some(provider) = &self.provider {
            options = options.with_provider(provider, self.provider_version.clone());
            let provider_options = match provider.parse::<ProviderKind>() {
                Ok(ProviderKind::Aws) => Some(ProviderDeployOptions::Aws(self.aws.deploy_options())),
                Ok(ProviderKind::Docker) => {
                    Some(ProviderDeployOptions::Docker(self.docker.deploy_options()))
                }
                // unknown names fail provider selection in the manager
                Err(_) => None,
            };
            if let Some(provider_options) = provider_options {
                options = options.with_provider_options(provider_options);
            }
        }
        options
    }
}

#[derive(Args, Debug)]
pub struct ScaleArgs {
    /// Node group: control-planes or workers
    #[arg(long)]
    pub nodes: NodeGroup,

    /// Desired replica count
    #[arg(long, allow_negative_numbers = true)]
    pub replicas: i64,

    /// Worker MachineDeployment, required when the cluster has several
    #[arg(long)]
    pub machine_deployment: Option<String>,
}

pub async fn run(args: ClusterArgs, session: Session) -> Result<()> {
    let name = args.name;
    let namespace = args.namespace;
    let mut manager = session.manager(ManagerOptions::default()).await?;

    match args.command {
        ClusterCommand::Create(create) => {
            let cluster = manager
                .deploy_cluster(&name, create.deploy_options(&namespace))
                .await?;
            println!("Cluster {}/{} is ready", cluster.namespace(), cluster.name());
        }
        ClusterCommand::Scale(scale) => {
            let mut cluster = manager.attach_cluster(&name, &namespace).await?;
            let options = ScaleOptions {
                machine_deployment: scale.machine_deployment,
            };
            cluster.scale(scale.replicas, scale.nodes, &options).await?;
            println!(
                "Scaled {} of {}/{} to {}",
                scale.nodes, namespace, name, scale.replicas
            );
            print_nodes(&cluster);
        }
        ClusterCommand::Health => {
            let mut cluster = manager.attach_cluster(&name, &namespace).await?;
            cluster.health().await?;
            println!("Cluster {}/{} is healthy", namespace, name);
            print_nodes(&cluster);
        }
        ClusterCommand::Delete => {
            let mut cluster = manager.attach_cluster(&name, &namespace).await?;
            cluster.delete().await?;
            println!("Deleted cluster {}/{}", namespace, name);
        }
    }
    Ok(())
}

fn print_nodes(cluster: &Cluster) {
    let nodes = cluster.nodes();
    println!("Control plane: {}", nodes.control_plane.join(", "));
    println!("Workers:       {}", nodes.workers.join(", "));
    println!("Endpoints:     {}", nodes.endpoints.join(", "));
}
