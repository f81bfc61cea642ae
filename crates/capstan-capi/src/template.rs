//! Cluster template materialization
//!
//! A template is a multi-document YAML file with `${VAR}` placeholders. The
//! renderer reads it from a `file://` source, fills placeholders from the
//! per-cluster options first and the [`ConfigReader`] second, and parses the
//! result into dynamic objects ready to apply.

use std::path::PathBuf;

use kube::api::DynamicObject;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::substitute::substitute;
use capstan_common::kube_utils::{parse_manifests, type_of};
use capstan_common::{ConfigReader, Error, Result};

/// Where a cluster template comes from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TemplateSource {
    /// The template shipped with (or installed for) the provider
    #[default]
    ProviderDefault,
    /// A template file on disk
    File(PathBuf),
    /// Template bytes held in memory
    Inline(Vec<u8>),
}

/// Per-cluster parameters of a template rendering
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Name of the cluster being created
    pub cluster_name: String,
    /// Namespace the cluster objects are created in
    pub namespace: String,
    /// Kubernetes version of the cluster
    pub kubernetes_version: String,
    /// Control plane machine count
    pub control_plane_machine_count: i64,
    /// Worker machine count
    pub worker_machine_count: i64,
    /// Template source
    pub source: TemplateSource,
}

impl TemplateOptions {
    /// Variables the options contribute, taking precedence over the reader
    fn variable(&self, key: &str) -> Option<String> {
        match key {
            "CLUSTER_NAME" => Some(self.cluster_name.clone()),
            "NAMESPACE" => Some(self.namespace.clone()),
            "KUBERNETES_VERSION" => Some(self.kubernetes_version.clone()),
            "CONTROL_PLANE_MACHINE_COUNT" => Some(self.control_plane_machine_count.to_string()),
            "WORKER_MACHINE_COUNT" => Some(self.worker_machine_count.to_string()),
            _ => None,
        }
    }
}

/// A materialized cluster template
#[derive(Clone, Debug, Default)]
pub struct Template {
    /// Objects in document order
    pub objects: Vec<DynamicObject>,
}

impl Template {
    /// Number of objects in the template
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the template has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Turns a template source into objects
#[cfg_attr(test, automock)]
pub trait TemplateRenderer: Send + Sync {
    /// Render the template at `url` (a `file://` URL or plain path)
    fn render(
        &self,
        url: &str,
        config: &ConfigReader,
        options: &TemplateOptions,
    ) -> Result<Template>;
}

/// Renderer reading local files and substituting variables natively
#[derive(Clone, Debug, Default)]
pub struct NativeRenderer;

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
];

impl TemplateRenderer for NativeRenderer {
    fn render(
        &self,
        url: &str,
        config: &ConfigReader,
        options: &TemplateOptions,
    ) -> Result<Template> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let raw =
            std::fs::read_to_string(path).map_err(|e| Error::io(format!("template {}", path), e))?;

        let substituted = substitute(&raw, |key| {
            options.variable(key).or_else(|| config.get_opt(key))
        });
        if !substituted.missing.is_empty() {
            return Err(Error::MissingTemplateVariables {
                variables: substituted.missing.into_iter().collect(),
            });
        }

        let mut objects = parse_manifests(&substituted.text).map_err(|e| match e {
            Error::Serialization { message, .. } => Error::template(format!("{}: {}", path, message)),
            other => other,
        })?;
        for obj in &mut objects {
            let (_, kind) = type_of(obj)?;
            if obj.metadata.namespace.is_none() && !CLUSTER_SCOPED_KINDS.contains(&kind) {
                obj.metadata.namespace = Some(options.namespace.clone());
            }
        }

        debug!(
            cluster = %options.cluster_name,
            objects = objects.len(),
            "rendered cluster template"
        );
        Ok(Template { objects })
    }
}
