//! Capstan CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Capstan - Cluster API lifecycle orchestration
#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Kubeconfig of the management cluster
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// clusterctl config file with provider variables
    #[arg(long, global = true, env = "CAPSTAN_CLUSTERCTL_CONFIG")]
    pub clusterctl_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install lifecycle components into the management cluster
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Create and operate workload clusters
    Cluster(commands::cluster::ClusterArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let session = commands::Session::connect(&self.global).await?;
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args, session).await,
            Commands::Cluster(args) => commands::cluster::run(args, session).await,
        }
    }
}
