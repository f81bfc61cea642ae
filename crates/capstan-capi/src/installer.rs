//! Provider component installation
//!
//! Reads pre-downloaded component manifests from the providers directory,
//! performs `${VAR}` substitution from the [`ConfigReader`], and applies them
//! natively through the [`ResourceClient`]. No external tools required.
//!
//! Directory layout: `<providers dir>/<component dir>/<version>/<file>.yaml`,
//! e.g. `infrastructure-aws/v2.5.0/infrastructure-components.yaml`. Tokens
//! without a version resolve to the highest version directory present.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::client::{deployment_readiness, ResourceClient};
use crate::constants::{CERT_MANAGER_NAMESPACE, INSTALL_WAIT_TIMEOUT, PROVIDER_READY_INTERVAL};
use crate::provider::ProviderToken;
use crate::substitute::substitute;
use capstan_common::kube_utils::{parse_manifests, sort_for_apply, type_of};
use capstan_common::{
    poll_until_converged, ConfigReader, Error, PollOutcome, PollSettings, Result,
};

/// Name of the manager container in provider controller deployments
const MANAGER_CONTAINER: &str = "manager";

/// Directory and manifest of cert-manager in the providers directory
const CERT_MANAGER_DIR: &str = "cert-manager";
const CERT_MANAGER_FILE: &str = "cert-manager.yaml";

// =============================================================================
// Component classes
// =============================================================================

/// Class of a lifecycle component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    /// Core Cluster API controllers
    Core,
    /// Bootstrap provider
    Bootstrap,
    /// Control plane provider
    ControlPlane,
    /// Infrastructure provider
    Infrastructure,
}

impl ComponentType {
    /// Directory holding the versions of component `name`
    pub fn dir_name(self, name: &str) -> String {
        match self {
            ComponentType::Core => name.to_string(),
            ComponentType::Bootstrap => format!("bootstrap-{}", name),
            ComponentType::ControlPlane => format!("control-plane-{}", name),
            ComponentType::Infrastructure => format!("infrastructure-{}", name),
        }
    }

    /// Manifest file inside a version directory
    pub fn components_file(self) -> &'static str {
        match self {
            ComponentType::Core => "core-components.yaml",
            ComponentType::Bootstrap => "bootstrap-components.yaml",
            ComponentType::ControlPlane => "control-plane-components.yaml",
            ComponentType::Infrastructure => "infrastructure-components.yaml",
        }
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentType::Core => write!(f, "CoreProvider"),
            ComponentType::Bootstrap => write!(f, "BootstrapProvider"),
            ComponentType::ControlPlane => write!(f, "ControlPlaneProvider"),
            ComponentType::Infrastructure => write!(f, "InfrastructureProvider"),
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Which components to install and how
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitOptions {
    /// Core provider token; also triggers the cert-manager check
    pub core_provider: Option<String>,
    /// Bootstrap provider tokens
    pub bootstrap_providers: Vec<String>,
    /// Control plane provider tokens
    pub control_plane_providers: Vec<String>,
    /// Infrastructure provider tokens
    pub infrastructure_providers: Vec<String>,
    /// Namespace to install into instead of the manifests' own
    pub target_namespace: Option<String>,
    /// Namespace the controllers reconcile; all when unset
    pub watching_namespace: Option<String>,
    /// Wait for every deployment of each installed component
    pub wait_providers: bool,
    /// Budget for each of those waits
    pub wait_timeout: Duration,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            core_provider: None,
            bootstrap_providers: Vec::new(),
            control_plane_providers: Vec::new(),
            infrastructure_providers: Vec::new(),
            target_namespace: None,
            watching_namespace: None,
            wait_providers: false,
            wait_timeout: INSTALL_WAIT_TIMEOUT,
        }
    }
}

impl InitOptions {
    /// Components in install order: core, bootstrap, control plane, infra
    pub fn components(&self) -> Result<Vec<(ComponentType, ProviderToken)>> {
        let mut out = Vec::new();
        if let Some(core) = &self.core_provider {
            out.push((ComponentType::Core, core.parse()?));
        }
        for (kind, tokens) in [
            (ComponentType::Bootstrap, &self.bootstrap_providers),
            (ComponentType::ControlPlane, &self.control_plane_providers),
            (ComponentType::Infrastructure, &self.infrastructure_providers),
        ] {
            for token in tokens {
                out.push((kind, token.parse()?));
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Version resolution
// =============================================================================

/// Numeric components of a `vX.Y.Z` directory name
fn version_key(name: &str) -> Option<Vec<u64>> {
    let core = name.strip_prefix('v')?.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Highest `vX.Y.Z` version directory under `dir`
pub fn resolve_version(dir: &Path) -> Result<String> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("provider directory {}", dir.display()), e))?;

    let mut best: Option<(Vec<u64>, String)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("provider directory {}", dir.display()), e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(key) = version_key(&name) else {
            continue;
        };
        if best.as_ref().map_or(true, |(b, _)| key > *b) {
            best = Some((key, name));
        }
    }

    best.map(|(_, name)| name).ok_or_else(|| {
        Error::capi_installation(format!("no versions available in {}", dir.display()))
    })
}

// =============================================================================
// Manifest transforms
// =============================================================================

/// Move every namespaced object (and the Namespace itself) into `target`
///
/// RBAC subjects and webhook service references follow the move so the
/// controller keeps working from its new home.
pub fn set_target_namespace(objects: &mut [DynamicObject], target: &str) {
    for obj in objects.iter_mut() {
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        match kind.as_str() {
            "Namespace" => obj.metadata.name = Some(target.to_string()),
            _ if obj.metadata.namespace.is_some() => {
                obj.metadata.namespace = Some(target.to_string())
            }
            _ => {}
        }

        if let Some(subjects) = obj.data.get_mut("subjects").and_then(Value::as_array_mut) {
            for subject in subjects {
                if subject.get("namespace").is_some() {
                    subject["namespace"] = Value::from(target);
                }
            }
        }

        if let Some(webhooks) = obj.data.get_mut("webhooks").and_then(Value::as_array_mut) {
            for hook in webhooks {
                if let Some(service) = hook.pointer_mut("/clientConfig/service") {
                    service["namespace"] = Value::from(target);
                }
            }
        }

        if let Some(service) = obj
            .data
            .pointer_mut("/spec/conversion/webhook/clientConfig/service")
        {
            service["namespace"] = Value::from(target);
        }
    }
}

/// Restrict manager containers to reconcile `namespace` only
pub fn set_watching_namespace(objects: &mut [DynamicObject], namespace: &str) {
    let flag = format!("--namespace={}", namespace);
    for obj in objects.iter_mut() {
        if obj.types.as_ref().map(|t| t.kind.as_str()) != Some("Deployment") {
            continue;
        }
        let Some(containers) = obj
            .data
            .pointer_mut("/spec/template/spec/containers")
            .and_then(Value::as_array_mut)
        else {
            continue;
        };

        for container in containers {
            if container.get("name").and_then(Value::as_str) != Some(MANAGER_CONTAINER) {
                continue;
            }
            let mut args: Vec<Value> = container
                .get("args")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            args.retain(|a| !a.as_str().is_some_and(|s| s.starts_with("--namespace=")));
            args.push(Value::from(flag.clone()));
            container["args"] = Value::Array(args);
        }
    }
}

/// Namespaces created by a manifest set
fn created_namespaces(objects: &[DynamicObject]) -> BTreeSet<String> {
    objects
        .iter()
        .filter(|o| o.types.as_ref().is_some_and(|t| t.kind == "Namespace"))
        .filter_map(|o| o.metadata.name.clone())
        .collect()
}

// =============================================================================
// Installer trait and implementation
// =============================================================================

/// The underlying installer the [`Manager`](crate::Manager) delegates to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComponentInstaller: Send + Sync {
    /// Install the components named in `options`
    async fn init(&self, options: &InitOptions, config: &ConfigReader) -> Result<()>;
}

/// Installer applying manifests from the providers directory
pub struct NativeInstaller {
    client: Arc<dyn ResourceClient>,
    cancel: CancellationToken,
}

impl NativeInstaller {
    /// Create an installer applying through `client`
    pub fn new(client: Arc<dyn ResourceClient>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Read, substitute and parse one manifest file
    fn load_manifest(path: &Path, config: &ConfigReader) -> Result<Vec<DynamicObject>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::capi_installation(format!(
                "failed to read provider manifest {}: {}",
                path.display(),
                e
            ))
        })?;

        let substituted = substitute(&raw, |key| config.get_opt(key));
        if !substituted.missing.is_empty() {
            debug!(
                path = %path.display(),
                missing = ?substituted.missing,
                "variables left unsubstituted"
            );
        }
        parse_manifests(&substituted.text)
    }

    /// Apply objects in kind priority order
    async fn apply_all(&self, objects: &mut [DynamicObject]) -> Result<()> {
        sort_for_apply(objects);
        for obj in objects.iter() {
            self.client.apply(obj).await?;
        }
        Ok(())
    }

    /// Wait for every deployment in `namespace` to have all replicas ready
    async fn wait_for_deployments(&self, namespace: &str, timeout: Duration) -> Result<()> {
        info!(namespace = %namespace, "waiting for deployments");
        let client = &self.client;
        poll_until_converged(
            &format!("deployments in {}", namespace),
            PollSettings::new(PROVIDER_READY_INTERVAL, timeout),
            &self.cancel,
            || async move {
                let deployments: Vec<_> = client.list_deployments(namespace).await?;
                if deployments.is_empty() {
                    return Ok(PollOutcome::pending(format!(
                        "no deployments in {} yet",
                        namespace
                    )));
                }
                for deployment in &deployments {
                    if let PollOutcome::Pending(reason) = deployment_readiness(deployment) {
                        return Ok(PollOutcome::Pending(reason));
                    }
                }
                Ok::<_, Error>(PollOutcome::Converged(()))
            },
        )
        .await
    }

    /// Install cert-manager unless its namespace already exists
    async fn ensure_cert_manager(
        &self,
        providers_dir: &Path,
        options: &InitOptions,
        config: &ConfigReader,
    ) -> Result<()> {
        if self.client.namespace_exists(CERT_MANAGER_NAMESPACE).await? {
            debug!("cert-manager already installed");
            return Ok(());
        }

        let dir = providers_dir.join(CERT_MANAGER_DIR);
        let version = resolve_version(&dir)?;
        info!(version = %version, "installing cert-manager");

        let mut objects = Self::load_manifest(&dir.join(&version).join(CERT_MANAGER_FILE), config)?;
        self.apply_all(&mut objects).await.map_err(|e| {
            Error::capi_installation(format!("failed to apply cert-manager: {}", e))
        })?;

        // provider webhooks need cert-manager serving before anything else applies
        self.wait_for_deployments(CERT_MANAGER_NAMESPACE, options.wait_timeout)
            .await?;
        info!("cert-manager ready");
        Ok(())
    }

    /// Install one component, returning the namespaces it created
    async fn install_component(
        &self,
        providers_dir: &Path,
        kind: ComponentType,
        token: &ProviderToken,
        options: &InitOptions,
        config: &ConfigReader,
    ) -> Result<BTreeSet<String>> {
        let dir: PathBuf = providers_dir.join(kind.dir_name(&token.name));
        let version = match &token.version {
            Some(v) => v.clone(),
            None => resolve_version(&dir)
                .map_err(|e| Error::capi_installation_for_provider(&token.name, e.to_string()))?,
        };

        let path = dir.join(&version).join(kind.components_file());
        let mut objects = Self::load_manifest(&path, config)
            .map_err(|e| Error::capi_installation_for_provider(&token.name, e.to_string()))?;

        if let Some(target) = options.target_namespace.as_deref().filter(|ns| !ns.is_empty()) {
            set_target_namespace(&mut objects, target);
        }
        if let Some(watching) = options.watching_namespace.as_deref().filter(|ns| !ns.is_empty())
        {
            set_watching_namespace(&mut objects, watching);
        }

        info!(
            provider = %token.name,
            provider_type = %kind,
            version = %version,
            objects = objects.len(),
            "applying provider components"
        );
        self.apply_all(&mut objects).await.map_err(|e| {
            Error::capi_installation_for_provider(
                &token.name,
                format!("failed to apply {} {}: {}", kind, token.name, e),
            )
        })?;

        Ok(created_namespaces(&objects))
    }
}

#[async_trait]
impl ComponentInstaller for NativeInstaller {
    async fn init(&self, options: &InitOptions, config: &ConfigReader) -> Result<()> {
        let components = options.components()?;
        if components.is_empty() {
            return Ok(());
        }

        let providers_dir = config.providers_dir();
        if options.core_provider.is_some() {
            self.ensure_cert_manager(&providers_dir, options, config)
                .await?;
        }

        let mut namespaces = BTreeSet::new();
        for (kind, token) in &components {
            namespaces.extend(
                self.install_component(&providers_dir, *kind, token, options, config)
                    .await?,
            );
        }

        if options.wait_providers {
            for namespace in &namespaces {
                self.wait_for_deployments(namespace, options.wait_timeout)
                    .await?;
            }
        }

        info!(components = components.len(), "provider components installed");
        Ok(())
    }
}
