//! Bootstrap command - install lifecycle components into the management cluster
//!
//! Usage:
//!   capstan bootstrap core [--core cluster-api] [--bootstrap talos] [--control-plane talos]
//!   capstan bootstrap infra --providers aws,docker

use std::time::Duration;

use clap::{Args, Subcommand};
use tracing::info;

use capstan_capi::constants::{
    CORE_PROVIDER_NAME, DEFAULT_BOOTSTRAP_PROVIDER, DEFAULT_CONTROL_PLANE_PROVIDER,
};
use capstan_capi::{
    create_provider, AwsSetupOptions, ManagerOptions, Provider, ProviderKind, ProviderOptions,
    SetupOptions,
};
use capstan_common::credentials::AwsCredentials;
use capstan_common::ConfigReader;

use super::Session;
use crate::Result;

/// Install lifecycle components
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Seconds to wait for every installed controller, no waiting when unset
    #[arg(long, global = true)]
    pub wait_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: BootstrapCommand,
}

#[derive(Subcommand, Debug)]
pub enum BootstrapCommand {
    /// Install the core, bootstrap and control plane providers
    Core(CoreArgs),
    /// Install infrastructure providers
    Infra(InfraArgs),
}

#[derive(Args, Debug)]
pub struct CoreArgs {
    /// Core provider token
    #[arg(long, default_value = CORE_PROVIDER_NAME)]
    pub core: String,

    /// Bootstrap provider tokens
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_BOOTSTRAP_PROVIDER)]
    pub bootstrap: Vec<String>,

    /// Control plane provider tokens
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_CONTROL_PLANE_PROVIDER)]
    pub control_plane: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InfraArgs {
    /// Infrastructure provider tokens, `name[:version]`
    #[arg(long, value_delimiter = ',', required = true)]
    pub providers: Vec<String>,

    /// Namespace to install providers into instead of their default
    #[arg(long)]
    pub target_ns: Option<String>,

    /// Namespace providers reconcile, all namespaces when unset
    #[arg(long)]
    pub watching_ns: Option<String>,

    /// Pre-encoded AWS credentials; falls back to AWS_ACCESS_KEY_ID and friends
    #[arg(long, env = "AWS_B64ENCODED_CREDENTIALS", hide_env_values = true)]
    pub aws_b64_credentials: Option<String>,
}

pub async fn run(args: BootstrapArgs, session: Session) -> Result<()> {
    let wait_provider_timeout = args.wait_timeout.map(Duration::from_secs);

    let options = match args.command {
        BootstrapCommand::Core(core) => ManagerOptions {
            core_provider: Some(core.core),
            bootstrap_providers: core.bootstrap,
            control_plane_providers: core.control_plane,
            wait_provider_timeout,
            ..Default::default()
        },
        BootstrapCommand::Infra(infra) => ManagerOptions {
            core_provider: None,
            bootstrap_providers: Vec::new(),
            control_plane_providers: Vec::new(),
            infrastructure_providers: infra_providers(&infra, &session.config)?,
            wait_provider_timeout,
            ..Default::default()
        },
    };

    let mut manager = session.manager(options).await?;
    manager.install().await?;

    info!(version = ?manager.version(), "bootstrap complete");
    println!(
        "Installed providers: {}",
        manager
            .providers()
            .iter()
            .map(|p| p.token())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

/// Build and configure the requested infrastructure providers
fn infra_providers(args: &InfraArgs, config: &ConfigReader) -> Result<Vec<Box<dyn Provider>>> {
    let options = ProviderOptions {
        provider_namespace: args.target_ns.clone(),
        watching_namespace: args.watching_ns.clone(),
    };

    args.providers
        .iter()
        .map(|token| {
            let mut provider = create_provider(token, options.clone())?;
            let setup = match provider.kind() {
                ProviderKind::Aws => SetupOptions::Aws(AwsSetupOptions {
                    b64_encoded_credentials: args.aws_b64_credentials.clone(),
                    credentials: AwsCredentials::from_config(config),
                }),
                ProviderKind::Docker => SetupOptions::Docker,
            };
            provider.configure(setup)?;
            Ok(provider)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn bootstrap(argv: &[&str]) -> BootstrapArgs {
        let argv = ["capstan", "bootstrap"].iter().chain(argv);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Bootstrap(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn infra(argv: &[&str]) -> InfraArgs {
        match bootstrap(argv).command {
            BootstrapCommand::Infra(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn core_defaults_to_talos() {
        let args = bootstrap(&["core"]);
        assert_eq!(args.wait_timeout, None);
        let BootstrapCommand::Core(core) = args.command else {
            panic!("expected core");
        };
        assert_eq!(core.core, "cluster-api");
        assert_eq!(core.bootstrap, vec!["talos"]);
        assert_eq!(core.control_plane, vec!["talos"]);
    }

    #[test]
    fn infra_splits_provider_list() {
        let args = infra(&["infra", "--providers", "aws:v2.5.0,docker", "--target-ns", "infra"]);
        assert_eq!(args.providers, vec!["aws:v2.5.0", "docker"]);
        assert_eq!(args.target_ns.as_deref(), Some("infra"));
    }

    #[test]
    fn infra_requires_providers() {
        assert!(Cli::try_parse_from(["capstan", "bootstrap", "infra"]).is_err());
    }

    #[test]
    fn wait_timeout_is_accepted_after_subcommand() {
        let args = bootstrap(&["core", "--wait-timeout", "300"]);
        assert_eq!(args.wait_timeout, Some(300));
    }

    #[test]
    fn providers_are_configured_with_namespaces() {
        let mut args = infra(&["infra", "--providers", "docker", "--watching-ns", "tenants"]);
        args.target_ns = Some("capd".to_string());
        let providers = infra_providers(&args, &ConfigReader::with_env(|_| None)).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].namespace(), "capd");
        assert_eq!(providers[0].watching_namespace(), Some("tenants"));
    }

    #[test]
    fn aws_uses_encoded_credentials_flag() {
        let args = infra(&["infra", "--providers", "aws", "--aws-b64-credentials", "Y3JlZHM="]);
        let providers = infra_providers(&args, &ConfigReader::with_env(|_| None)).unwrap();
        assert_eq!(
            providers[0]
                .provider_vars()
                .get("AWS_B64ENCODED_CREDENTIALS")
                .map(String::as_str),
            Some("Y3JlZHM=")
        );
    }

    #[test]
    fn aws_falls_back_to_key_pair() {
        let mut args = infra(&["infra", "--providers", "aws"]);
        args.aws_b64_credentials = None;
        let config = ConfigReader::with_env(|key| match key {
            "AWS_ACCESS_KEY_ID" => Some("AKID".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("SECRET".to_string()),
            "AWS_REGION" => Some("eu-west-1".to_string()),
            _ => None,
        });
        let providers = infra_providers(&args, &config).unwrap();
        assert!(providers[0]
            .provider_vars()
            .contains_key("AWS_B64ENCODED_CREDENTIALS"));
    }

    #[test]
    fn aws_without_credentials_is_rejected() {
        let mut args = infra(&["infra", "--providers", "aws"]);
        args.aws_b64_credentials = None;
        assert!(infra_providers(&args, &ConfigReader::with_env(|_| None)).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let args = infra(&["infra", "--providers", "vsphere"]);
        assert!(infra_providers(&args, &ConfigReader::with_env(|_| None)).is_err());
    }
}
