//! Infrastructure provider abstraction
//!
//! A provider is a lifecycle plugin (CAPA, CAPD, ...) installed into the
//! management cluster. Each variant knows its namespace and controller, the
//! variables it needs at install time (credentials), the variables it
//! contributes to cluster templates, and where its default template lives.
//!
//! The registry is closed: [`ProviderKind`] is matched exhaustively, so adding
//! a provider is a compile-checked change in [`create_provider`].

mod aws;
mod docker;

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use aws::{AwsDeployOptions, AwsProvider, AwsSetupOptions};
pub use docker::{DockerDeployOptions, DockerProvider};

use crate::client::{deployment_readiness, ResourceClient};
use crate::installer::resolve_version;
use crate::template::{Template, TemplateOptions, TemplateRenderer, TemplateSource};
use capstan_common::{
    poll_until_converged, ConfigReader, Error, PollOutcome, PollSettings, Result, Variables,
};

/// Supported infrastructure providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Cluster API Provider AWS
    Aws,
    /// Cluster API Provider Docker
    Docker,
}

impl ProviderKind {
    /// Name used in provider tokens and clusterctl records
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Docker => "docker",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(ProviderKind::Aws),
            "docker" => Ok(ProviderKind::Docker),
            other => Err(Error::UnknownProviderType {
                name: other.to_string(),
            }),
        }
    }
}

/// A parsed `name[:version]` provider token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderToken {
    /// Provider name
    pub name: String,
    /// Pinned version, if any
    pub version: Option<String>,
}

impl FromStr for ProviderToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = match s.trim().split_once(':') {
            Some((name, version)) => (name, Some(version)),
            None => (s.trim(), None),
        };
        if name.is_empty() || version.is_some_and(str::is_empty) {
            return Err(Error::validation(format!("malformed provider token {:?}", s)));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for ProviderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Namespace overrides applied when constructing a provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Namespace to install the provider into instead of its default
    pub provider_namespace: Option<String>,
    /// Namespace the provider reconciles; all namespaces when unset
    pub watching_namespace: Option<String>,
}

/// Setup parameters handed to [`Provider::configure`]
#[derive(Clone, Debug)]
pub enum SetupOptions {
    /// AWS credentials
    Aws(AwsSetupOptions),
    /// Docker takes no setup
    Docker,
}

/// Per-deployment parameters handed to [`Provider::cluster_vars`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderDeployOptions {
    /// AWS machine and network parameters
    Aws(AwsDeployOptions),
    /// Docker network and image parameters
    Docker(DockerDeployOptions),
}

/// Identity shared by every provider variant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderIdentity {
    kind: ProviderKind,
    version: Option<String>,
    namespace: String,
    watching_namespace: Option<String>,
}

impl ProviderIdentity {
    fn new(
        kind: ProviderKind,
        version: Option<String>,
        default_namespace: &str,
        options: ProviderOptions,
    ) -> Self {
        Self {
            kind,
            version,
            namespace: options
                .provider_namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| default_namespace.to_string()),
            watching_namespace: options.watching_namespace.filter(|ns| !ns.is_empty()),
        }
    }
}

/// Lifecycle operations of an infrastructure provider
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Name, version and namespaces
    fn identity(&self) -> &ProviderIdentity;

    /// Name of the controller deployment in the provider namespace
    fn controller_name(&self) -> &'static str;

    /// Validate and store setup options
    fn configure(&mut self, options: SetupOptions) -> Result<()>;

    /// Variables the installer needs; empty values are never injected
    fn provider_vars(&self) -> Variables;

    /// Variables the cluster template needs
    ///
    /// `None` yields the provider's defaults; options for another provider
    /// are rejected with [`Error::InvalidProviderOptions`].
    fn cluster_vars(&self, options: Option<&ProviderDeployOptions>) -> Result<Variables>;

    /// Template bundled with the provider
    fn default_template(&self) -> &'static str;

    /// Which provider this is
    fn kind(&self) -> ProviderKind {
        self.identity().kind
    }

    /// Provider name
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Pinned version, `None` for "latest available"
    fn version(&self) -> Option<&str> {
        self.identity().version.as_deref()
    }

    /// Namespace the provider is installed into
    fn namespace(&self) -> &str {
        &self.identity().namespace
    }

    /// Namespace the provider reconciles, `None` for all
    fn watching_namespace(&self) -> Option<&str> {
        self.identity().watching_namespace.as_deref()
    }

    /// `name[:version]` token understood by the installer
    fn token(&self) -> String {
        ProviderToken {
            name: self.name().to_string(),
            version: self.version().map(str::to_string),
        }
        .to_string()
    }

    /// Whether the provider namespace and controller deployment exist
    async fn is_installed(&self, client: &dyn ResourceClient) -> Result<bool> {
        if !client.namespace_exists(self.namespace()).await? {
            return Ok(false);
        }
        Ok(client
            .get_deployment(self.namespace(), self.controller_name())
            .await?
            .is_some())
    }

    /// Wait until the controller deployment has all replicas ready
    async fn wait_ready(
        &self,
        client: &dyn ResourceClient,
        settings: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let operation = format!("provider {} readiness", self.name());
        let (namespace, controller) = (self.namespace(), self.controller_name());

        poll_until_converged(&operation, settings, cancel, || async move {
            Ok::<_, Error>(match client.get_deployment(namespace, controller).await? {
                None => PollOutcome::pending(format!(
                    "deployment {}/{} not found",
                    namespace, controller
                )),
                Some(deployment) => deployment_readiness(&deployment),
            })
        })
        .await?;

        info!(provider = %self.name(), namespace = %namespace, "provider ready");
        Ok(())
    }

    /// `cluster-template.yaml` installed for this provider, if present
    ///
    /// Looks under `<providers dir>/infrastructure-<name>/<version>`, using
    /// the pinned version or the highest one installed.
    fn installed_template(&self, config: &ConfigReader) -> Option<PathBuf> {
        let dir = config
            .providers_dir()
            .join(format!("infrastructure-{}", self.name()));
        let version = match self.version() {
            Some(v) => v.to_string(),
            None => resolve_version(&dir).ok()?,
        };
        let path = dir.join(version).join(INSTALLED_TEMPLATE_FILE);
        path.is_file().then_some(path)
    }

    /// Materialize a cluster template through `renderer`
    ///
    /// The provider default is the installed template when one exists and
    /// the bundled one otherwise. In-memory and bundled templates are
    /// written to a temporary file for the duration of the call.
    async fn get_cluster_template(
        &self,
        renderer: &dyn TemplateRenderer,
        config: &ConfigReader,
        options: &TemplateOptions,
    ) -> Result<Template> {
        let bytes = match &options.source {
            TemplateSource::File(path) => {
                return renderer.render(&format!("file://{}", path.display()), config, options)
            }
            TemplateSource::Inline(bytes) => bytes.as_slice(),
            TemplateSource::ProviderDefault => match self.installed_template(config) {
                Some(path) => {
                    debug!(
                        provider = %self.name(),
                        path = %path.display(),
                        "using installed cluster template"
                    );
                    return renderer.render(&format!("file://{}", path.display()), config, options);
                }
                None => self.default_template().as_bytes(),
            },
        };

        let mut file = tempfile::Builder::new()
            .prefix("cluster-template-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| Error::io("cluster template temp file", e))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| Error::io("cluster template temp file", e))?;
        renderer.render(&format!("file://{}", file.path().display()), config, options)
    }
}

/// File name of a provider's installed cluster template
const INSTALLED_TEMPLATE_FILE: &str = "cluster-template.yaml";

/// Create a provider from a `name[:version]` token
pub fn create_provider(token: &str, options: ProviderOptions) -> Result<Box<dyn Provider>> {
    let token: ProviderToken = token.parse()?;
    let kind: ProviderKind = token.name.parse()?;
    Ok(match kind {
        ProviderKind::Aws => Box::new(AwsProvider::new(token.version, options)),
        ProviderKind::Docker => Box::new(DockerProvider::new(token.version, options)),
    })
}

/// Insert `value` under `key` when it is non-empty
pub(crate) fn insert_non_empty(vars: &mut Variables, key: &str, value: impl Into<String>) {
    let value = value.into();
    if !value.is_empty() {
        vars.insert(key.to_string(), value);
    }
}
