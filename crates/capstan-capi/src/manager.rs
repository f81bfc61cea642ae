//! Orchestration session over one management cluster
//!
//! The [`Manager`] owns the resource client, the configuration reader and
//! the view of what is installed. That view is never trusted for long: it is
//! re-derived from the clusterctl `Provider` inventory after every install
//! and deploy, since another actor may have changed it.
//!
//! Installation is idempotent. Each target (the core controllers, then each
//! infrastructure provider) is checked first and skipped when present, so
//! re-running an interrupted install is the recovery path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{LifecycleApi, ResourceClient};
use crate::cluster::Cluster;
use crate::constants::{
    CAPI_CONTROLLER, CAPI_NAMESPACE, CLUSTERCTL_API_GROUP, CLUSTER_API_GROUP, CLUSTER_KIND,
    CONVERGENCE, CORE_PROVIDER_NAME, DEFAULT_BOOTSTRAP_PROVIDER, DEFAULT_CONTROL_PLANE_PROVIDER,
    HEALTH, INFRASTRUCTURE_PROVIDER_TYPE, INSTALL_WAIT_TIMEOUT, PROVIDER_KIND,
    PROVIDER_READY_INTERVAL, PROVIDER_READY_TIMEOUT,
};
use crate::installer::{ComponentInstaller, InitOptions, NativeInstaller};
use crate::provider::{create_provider, Provider, ProviderOptions};
use crate::template::{NativeRenderer, TemplateRenderer};
use capstan_common::dynamic::{nested_str, required_str};
use capstan_common::{ConfigReader, Error, PollSettings, Result};

/// What a [`Manager`] installs and how long it waits
#[derive(Debug)]
pub struct ManagerOptions {
    /// Core provider token, `None` to leave the core alone
    pub core_provider: Option<String>,
    /// Bootstrap provider tokens installed with the core
    pub bootstrap_providers: Vec<String>,
    /// Control plane provider tokens installed with the core
    pub control_plane_providers: Vec<String>,
    /// Infrastructure providers to install
    pub infrastructure_providers: Vec<Box<dyn Provider>>,
    /// Have the installer wait this long for every component deployment
    pub wait_provider_timeout: Option<Duration>,
    /// Cluster convergence after deploy and scale
    pub convergence: PollSettings,
    /// Workload node health
    pub health: PollSettings,
    /// Cancels every wait of the session
    pub cancel: CancellationToken,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            core_provider: Some(CORE_PROVIDER_NAME.to_string()),
            bootstrap_providers: vec![DEFAULT_BOOTSTRAP_PROVIDER.to_string()],
            control_plane_providers: vec![DEFAULT_CONTROL_PLANE_PROVIDER.to_string()],
            infrastructure_providers: Vec::new(),
            wait_provider_timeout: None,
            convergence: CONVERGENCE,
            health: HEALTH,
            cancel: CancellationToken::new(),
        }
    }
}

/// Orchestration session: install, deploy and attach to clusters
pub struct Manager {
    pub(crate) client: Arc<dyn ResourceClient>,
    installer: Box<dyn ComponentInstaller>,
    pub(crate) renderer: Box<dyn TemplateRenderer>,
    pub(crate) config: ConfigReader,
    options: ManagerOptions,
    api: Option<LifecycleApi>,
    pub(crate) providers: Vec<Box<dyn Provider>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("api", &self.api)
            .field("providers", &self.providers)
            .field("options", &self.options)
            .finish()
    }
}

impl Manager {
    /// Create a session and fetch the installed state
    pub async fn new(
        client: Arc<dyn ResourceClient>,
        installer: Box<dyn ComponentInstaller>,
        renderer: Box<dyn TemplateRenderer>,
        config: ConfigReader,
        options: ManagerOptions,
    ) -> Result<Self> {
        let mut manager = Self {
            client,
            installer,
            renderer,
            config,
            options,
            api: None,
            providers: Vec::new(),
        };
        manager.fetch_state().await?;
        Ok(manager)
    }

    /// Create a session installing from the providers directory
    pub async fn native(
        client: Arc<dyn ResourceClient>,
        config: ConfigReader,
        options: ManagerOptions,
    ) -> Result<Self> {
        let installer = NativeInstaller::new(client.clone(), options.cancel.clone());
        Self::new(
            client,
            Box::new(installer),
            Box::new(NativeRenderer),
            config,
            options,
        )
        .await
    }

    /// Discovered version of the lifecycle kinds, `None` when not installed
    pub fn version(&self) -> Option<&str> {
        self.api.as_ref().map(LifecycleApi::version)
    }

    /// Installed infrastructure providers, as of the last state fetch
    pub fn providers(&self) -> &[Box<dyn Provider>] {
        &self.providers
    }

    /// Configuration reader handed to the installer and renderer
    pub fn config(&self) -> &ConfigReader {
        &self.config
    }

    /// Mutable configuration reader
    pub fn config_mut(&mut self) -> &mut ConfigReader {
        &mut self.config
    }

    /// Session options
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Lifecycle kinds at the discovered version, or the default one
    pub fn lifecycle_api(&self) -> LifecycleApi {
        self.api.clone().unwrap_or_default()
    }

    fn wait_settings(&self) -> PollSettings {
        PollSettings::new(
            PROVIDER_READY_INTERVAL,
            self.options
                .wait_provider_timeout
                .unwrap_or(PROVIDER_READY_TIMEOUT),
        )
    }

    fn init_options(&self) -> InitOptions {
        InitOptions {
            wait_providers: self.options.wait_provider_timeout.is_some(),
            wait_timeout: self
                .options
                .wait_provider_timeout
                .unwrap_or(INSTALL_WAIT_TIMEOUT),
            ..Default::default()
        }
    }

    /// Install the core (if requested), then every infrastructure provider
    pub async fn install(&mut self) -> Result<()> {
        if self.options.core_provider.is_some() {
            self.install_core().await?;
        }

        let providers = std::mem::take(&mut self.options.infrastructure_providers);
        let mut result = Ok(());
        for provider in &providers {
            result = self.install_provider(provider.as_ref()).await;
            if result.is_err() {
                break;
            }
        }
        self.options.infrastructure_providers = providers;
        result?;

        self.fetch_state().await
    }

    /// Whether the core controllers are present
    pub async fn core_installed(&self) -> Result<bool> {
        if !self.client.namespace_exists(CAPI_NAMESPACE).await? {
            return Ok(false);
        }
        Ok(self
            .client
            .get_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER)
            .await?
            .is_some())
    }

    /// Install the core, bootstrap and control plane providers
    pub async fn install_core(&mut self) -> Result<()> {
        let Some(core) = self.options.core_provider.clone() else {
            return Ok(());
        };
        if self.core_installed().await? {
            info!(provider = %core, "core provider already installed");
            return Ok(());
        }

        info!(
            provider = %core,
            bootstrap = ?self.options.bootstrap_providers,
            control_plane = ?self.options.control_plane_providers,
            "installing core provider"
        );
        let init = InitOptions {
            core_provider: Some(core),
            bootstrap_providers: self.options.bootstrap_providers.clone(),
            control_plane_providers: self.options.control_plane_providers.clone(),
            ..self.init_options()
        };
        self.installer.init(&init, &self.config).await
    }

    /// Install one infrastructure provider and wait for its controller
    pub async fn install_provider(&mut self, provider: &dyn Provider) -> Result<()> {
        if provider.is_installed(self.client.as_ref()).await? {
            info!(provider = %provider.name(), namespace = %provider.namespace(), "provider already installed");
            return Ok(());
        }

        info!(provider = %provider.token(), namespace = %provider.namespace(), "installing provider");
        self.config.inject(&provider.provider_vars());
        let init = InitOptions {
            infrastructure_providers: vec![provider.token()],
            target_namespace: Some(provider.namespace().to_string()),
            watching_namespace: provider.watching_namespace().map(str::to_string),
            ..self.init_options()
        };
        self.installer.init(&init, &self.config).await?;

        provider
            .wait_ready(
                self.client.as_ref(),
                self.wait_settings(),
                &self.options.cancel,
            )
            .await
    }

    /// Re-derive the lifecycle version and installed providers
    ///
    /// Without a served `Provider` kind the lifecycle control plane is not
    /// installed and the state is cleared.
    pub async fn fetch_state(&mut self) -> Result<()> {
        let Some(inventory) = self
            .client
            .preferred_resource(CLUSTERCTL_API_GROUP, PROVIDER_KIND)
            .await?
        else {
            debug!("lifecycle control plane not installed");
            self.api = None;
            self.providers.clear();
            return Ok(());
        };

        self.api = self
            .client
            .preferred_resource(CLUSTER_API_GROUP, CLUSTER_KIND)
            .await?
            .map(|resource| LifecycleApi::new(resource.version));

        let mut providers = Vec::new();
        for record in self.client.list(&inventory, None, None).await? {
            if required_str(&record.data, &["type"])? != INFRASTRUCTURE_PROVIDER_TYPE {
                continue;
            }
            let name = required_str(&record.data, &["providerName"])?;
            let version = required_str(&record.data, &["version"])?;
            let options = ProviderOptions {
                provider_namespace: record.metadata.namespace.clone(),
                watching_namespace: nested_str(&record.data, &["watchedNamespace"])?
                    .map(str::to_string),
            };

            match create_provider(&format!("{}:{}", name, version), options) {
                Ok(provider) => providers.push(provider),
                Err(Error::UnknownProviderType { name }) => {
                    debug!(provider = %name, "skipping unsupported provider");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            version = ?self.version(),
            providers = ?providers.iter().map(|p| p.token()).collect::<Vec<_>>(),
            "fetched lifecycle state"
        );
        self.providers = providers;
        Ok(())
    }

    /// Handle on cluster `namespace/name` without reading it
    pub(crate) fn cluster_handle(&self, name: &str, namespace: &str) -> Cluster {
        Cluster::new(
            self.client.clone(),
            self.lifecycle_api(),
            name,
            namespace,
            self.options.convergence,
            self.options.health,
            self.options.cancel.clone(),
        )
    }

    /// Attach to an existing cluster
    pub async fn attach_cluster(&self, name: &str, namespace: &str) -> Result<Cluster> {
        let mut cluster = self.cluster_handle(name, namespace);
        if !cluster.sync().await? {
            return Err(Error::ClusterNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::MockComponentInstaller;
    use crate::template::MockTemplateRenderer;
    use crate::testing::{cluster_object, provider_record, FakeClient};
    use mockall::Sequence;

    fn serve_inventory(client: &FakeClient) {
        client.serve(CLUSTERCTL_API_GROUP, PROVIDER_KIND, "v1alpha3");
        client.serve(CLUSTER_API_GROUP, CLUSTER_KIND, "v1beta1");
    }

    fn options(providers: &[&str]) -> ManagerOptions {
        ManagerOptions {
            infrastructure_providers: providers
                .iter()
                .map(|token| create_provider(token, ProviderOptions::default()).unwrap())
                .collect(),
            ..Default::default()
        }
    }

    async fn manager(
        client: Arc<FakeClient>,
        installer: MockComponentInstaller,
        options: ManagerOptions,
    ) -> Manager {
        Manager::new(
            client,
            Box::new(installer),
            Box::new(MockTemplateRenderer::new()),
            ConfigReader::with_env(|_| None),
            options,
        )
        .await
        .unwrap()
    }

    /// Installer that brings up the controllers it was asked for
    fn installing(client: &Arc<FakeClient>, times: usize) -> MockComponentInstaller {
        let mut installer = MockComponentInstaller::new();
        let fake = client.clone();
        installer.expect_init().times(times).returning(move |opts, _| {
            if opts.core_provider.is_some() {
                fake.add_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER, 1, 1);
            }
            if opts.infrastructure_providers.iter().any(|t| t.starts_with("docker")) {
                fake.add_deployment("capd-system", "capd-controller-manager", 1, 1);
            }
            Ok(())
        });
        installer
    }

    #[tokio::test]
    async fn fetch_state_without_inventory_clears_state() {
        let client = Arc::new(FakeClient::default());
        let m = manager(client, MockComponentInstaller::new(), ManagerOptions::default()).await;
        assert_eq!(m.version(), None);
        assert!(m.providers().is_empty());
        assert_eq!(m.lifecycle_api().version(), "v1beta1");
    }

    #[tokio::test]
    async fn fetch_state_keeps_supported_infrastructure_providers() {
        let client = Arc::new(FakeClient::default());
        client.serve(CLUSTERCTL_API_GROUP, PROVIDER_KIND, "v1alpha3");
        client.serve(CLUSTER_API_GROUP, CLUSTER_KIND, "v1beta2");
        client.insert(provider_record("capi-system", "CoreProvider", "cluster-api", "v1.7.0"));
        client.insert(provider_record("capa-system", "InfrastructureProvider", "aws", "v2.5.0"));
        client.insert(provider_record("capg-system", "InfrastructureProvider", "gcp", "v1.6.0"));

        let m = manager(client, MockComponentInstaller::new(), ManagerOptions::default()).await;

        assert_eq!(m.version(), Some("v1beta2"));
        assert_eq!(m.providers().len(), 1);
        let aws = &m.providers()[0];
        assert_eq!(aws.token(), "aws:v2.5.0");
        assert_eq!(aws.namespace(), "capa-system");
    }

    #[tokio::test]
    async fn fetch_state_requires_record_fields() {
        let client = Arc::new(FakeClient::default());
        serve_inventory(&client);
        let mut record = provider_record("capa-system", "InfrastructureProvider", "aws", "v2.5.0");
        record.data.as_object_mut().unwrap().remove("version");
        client.insert(record);

        let err = Manager::new(
            client,
            Box::new(MockComponentInstaller::new()),
            Box::new(MockTemplateRenderer::new()),
            ConfigReader::with_env(|_| None),
            ManagerOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FieldNotFound { ref path } if path == "version"));
    }

    #[tokio::test(start_paused = true)]
    async fn install_is_idempotent() {
        let client = Arc::new(FakeClient::default());
        let installer = installing(&client, 2);
        let mut m = manager(client.clone(), installer, options(&["docker"])).await;

        m.install().await.unwrap();
        m.install().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn core_is_installed_before_any_infrastructure_provider() {
        let client = Arc::new(FakeClient::default());
        let fake = client.clone();
        let mut installer = MockComponentInstaller::new();
        let mut seq = Sequence::new();
        installer
            .expect_init()
            .withf(|opts, _| {
                opts.core_provider.as_deref() == Some("cluster-api")
                    && opts.bootstrap_providers == ["talos"]
                    && opts.infrastructure_providers.is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        installer
            .expect_init()
            .withf(|opts, _| {
                opts.core_provider.is_none()
                    && opts.infrastructure_providers == ["docker"]
                    && opts.target_namespace.as_deref() == Some("capd-system")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| {
                fake.add_deployment("capd-system", "capd-controller-manager", 1, 1);
                Ok(())
            });

        let mut m = manager(client, installer, options(&["docker"])).await;
        m.install().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn install_injects_provider_variables() {
        let client = Arc::new(FakeClient::default());
        client.add_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER, 1, 1);
        let fake = client.clone();

        let mut installer = MockComponentInstaller::new();
        installer
            .expect_init()
            .withf(|_, config| {
                config.get_opt("AWS_B64ENCODED_CREDENTIALS").as_deref() == Some("ZW5jb2RlZA==")
            })
            .times(1)
            .returning(move |_, _| {
                fake.add_deployment("capa-system", "capa-controller-manager", 1, 1);
                Ok(())
            });

        let mut aws = create_provider("aws", ProviderOptions::default()).unwrap();
        aws.configure(crate::provider::SetupOptions::Aws(
            crate::provider::AwsSetupOptions {
                b64_encoded_credentials: Some("ZW5jb2RlZA==".to_string()),
                credentials: None,
            },
        ))
        .unwrap();
        let mut m = manager(
            client,
            installer,
            ManagerOptions {
                infrastructure_providers: vec![aws],
                ..Default::default()
            },
        )
        .await;
        m.install().await.unwrap();
    }

    #[tokio::test]
    async fn installer_waits_default_to_install_budget() {
        let client = Arc::new(FakeClient::default());
        let m = manager(client.clone(), MockComponentInstaller::new(), options(&[])).await;
        let init = m.init_options();
        assert!(!init.wait_providers);
        assert_eq!(init.wait_timeout, INSTALL_WAIT_TIMEOUT);

        let m = manager(
            client,
            MockComponentInstaller::new(),
            ManagerOptions {
                wait_provider_timeout: Some(Duration::from_secs(90)),
                ..Default::default()
            },
        )
        .await;
        let init = m.init_options();
        assert!(init.wait_providers);
        assert_eq!(init.wait_timeout, Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_aborts_and_keeps_the_provider_list() {
        let client = Arc::new(FakeClient::default());
        client.add_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER, 1, 1);
        let mut installer = MockComponentInstaller::new();
        installer
            .expect_init()
            .times(1)
            .returning(|_, _| Err(Error::capi_installation("manifest missing")));

        let mut m = manager(client, installer, options(&["docker", "aws"])).await;
        let err = m.install().await.unwrap_err();
        assert!(matches!(err, Error::CapiInstallation { .. }));
        assert_eq!(m.options().infrastructure_providers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_that_never_becomes_ready_times_out() {
        let client = Arc::new(FakeClient::default());
        client.add_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER, 1, 1);
        let fake = client.clone();
        let mut installer = MockComponentInstaller::new();
        installer.expect_init().times(1).returning(move |_, _| {
            fake.add_deployment("capd-system", "capd-controller-manager", 1, 0);
            Ok(())
        });

        let mut m = manager(client, installer, options(&["docker"])).await;
        let err = m.install().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn install_refreshes_state() {
        let client = Arc::new(FakeClient::default());
        let fake = client.clone();
        let installer = {
            let mut installer = MockComponentInstaller::new();
            installer.expect_init().returning(move |opts, _| {
                serve_inventory(&fake);
                if opts.core_provider.is_some() {
                    fake.add_deployment(CAPI_NAMESPACE, CAPI_CONTROLLER, 1, 1);
                } else {
                    fake.add_deployment("capd-system", "capd-controller-manager", 1, 1);
                    fake.insert(provider_record(
                        "capd-system",
                        "InfrastructureProvider",
                        "docker",
                        "v1.7.0",
                    ));
                }
                Ok(())
            });
            installer
        };

        let mut m = manager(client, installer, options(&["docker"])).await;
        assert!(m.providers().is_empty());
        m.install().await.unwrap();
        assert_eq!(m.version(), Some("v1beta1"));
        assert_eq!(m.providers()[0].token(), "docker:v1.7.0");
    }

    #[tokio::test]
    async fn attach_requires_an_existing_cluster() {
        let client = Arc::new(FakeClient::default());
        client.insert(cluster_object("demo", "default", true));
        let m = manager(client, MockComponentInstaller::new(), ManagerOptions::default()).await;

        let cluster = m.attach_cluster("demo", "default").await.unwrap();
        assert!(cluster.snapshot().is_some());

        let err = m.attach_cluster("other", "default").await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound { .. }));
    }
}
