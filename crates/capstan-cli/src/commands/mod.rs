//! CLI commands

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capstan_capi::{KubeResourceClient, Manager, ManagerOptions, ResourceClient};
use capstan_common::kube_utils::create_client;
use capstan_common::ConfigReader;

use crate::{GlobalArgs, Result};

pub mod bootstrap;
pub mod cluster;

/// Management cluster connection shared by all commands
pub struct Session {
    pub client: Arc<dyn ResourceClient>,
    pub config: ConfigReader,
    pub cancel: CancellationToken,
}

impl Session {
    /// Connect to the management cluster and load provider variables
    ///
    /// Ctrl-C cancels the session token, which aborts any wait in progress.
    pub async fn connect(args: &GlobalArgs) -> Result<Self> {
        let client = create_client(args.kubeconfig.as_deref()).await?;
        let config = ConfigReader::new().load(args.clusterctl_config.as_deref())?;

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupted, cancelling");
                    on_signal.cancel();
                }
                Err(e) => debug!(error = %e, "failed to listen for ctrl-c"),
            }
        });

        Ok(Self {
            client: Arc::new(KubeResourceClient::new(client)),
            config,
            cancel,
        })
    }

    /// Start an orchestration session with `options`
    pub async fn manager(self, options: ManagerOptions) -> Result<Manager> {
        let options = ManagerOptions {
            cancel: self.cancel,
            ..options
        };
        Ok(Manager::native(self.client, self.config, options).await?)
    }
}
