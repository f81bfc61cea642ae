//! Capstan CLI
//!
//! Installs Cluster API providers and creates, scales, checks and deletes
//! workload clusters.

use clap::Parser;

use capstan_cli::{Cli, Result};
use capstan_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();
    cli.run().await
}
