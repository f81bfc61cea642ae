//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, ApiResource building and manifest helpers. Talking to
//! the API server happens through the resource client in `capstan-capi`; this
//! module only holds the pure pieces and the kube config plumbing.

use std::path::Path;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
///
/// Without a path the config is inferred (`KUBECONFIG`, `~/.kube/config`, then
/// in-cluster).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            config_from_kubeconfig(kubeconfig).await?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    client_with_timeouts(config)
}

/// Create a kube client from raw kubeconfig YAML, e.g. a workload cluster's
/// `<cluster>-kubeconfig` secret
pub async fn create_client_from_kubeconfig_bytes(kubeconfig: &[u8]) -> Result<Client, Error> {
    let text = std::str::from_utf8(kubeconfig).map_err(|e| {
        Error::internal_with_context("create_client", format!("kubeconfig is not utf-8: {}", e))
    })?;
    let kubeconfig = Kubeconfig::from_yaml(text).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to parse kubeconfig: {}", e))
    })?;
    let config = config_from_kubeconfig(kubeconfig).await?;
    client_with_timeouts(config)
}

async fn config_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })
}

fn client_with_timeouts(mut config: Config) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parse an apiVersion into (group, version)
///
/// ```
/// use capstan_common::kube_utils::parse_api_version;
///
/// assert_eq!(
///     parse_api_version("cluster.x-k8s.io/v1beta1"),
///     ("cluster.x-k8s.io".to_string(), "v1beta1".to_string())
/// );
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build a GroupVersionKind from an apiVersion and kind
pub fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = parse_api_version(api_version);
    GroupVersionKind::gvk(&group, &version, kind)
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The plural is guessed with [`pluralize_kind`]; prefer a discovered
/// resource when the server is reachable.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Known Kubernetes/CAPI resource pluralizations
const KIND_PLURALS: &[(&str, &str)] = &[
    ("cluster", "clusters"),
    ("machine", "machines"),
    ("machinedeployment", "machinedeployments"),
    ("machineset", "machinesets"),
    ("machinehealthcheck", "machinehealthchecks"),
    ("provider", "providers"),
    ("taloscontrolplane", "taloscontrolplanes"),
    ("talosconfig", "talosconfigs"),
    ("talosconfigtemplate", "talosconfigtemplates"),
    ("kubeadmcontrolplane", "kubeadmcontrolplanes"),
    ("kubeadmconfigtemplate", "kubeadmconfigtemplates"),
    ("awscluster", "awsclusters"),
    ("awsmachine", "awsmachines"),
    ("awsmachinetemplate", "awsmachinetemplates"),
    ("dockercluster", "dockerclusters"),
    ("dockermachine", "dockermachines"),
    ("dockermachinetemplate", "dockermachinetemplates"),
    ("clusterclass", "clusterclasses"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known CAPI/Kubernetes types, falling back to
/// simple pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Apply order for a resource kind
///
/// Lower values are applied first so that namespaces and CRDs exist before
/// anything that lives in them, and RBAC exists before workloads start.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Issuer" | "ClusterIssuer" | "Certificate" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 9,
        _ => 10,
    }
}

/// Split a multi-document YAML stream into its non-empty documents
///
/// Handles a leading `---`, trailing separators and comment-only documents.
pub fn split_yaml_documents(manifests: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in manifests.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            push_document(&mut docs, &mut current);
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut docs, &mut current);

    docs
}

fn push_document(docs: &mut Vec<String>, current: &mut String) {
    let has_content = current.lines().any(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if has_content {
        docs.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Parse a multi-document YAML stream into dynamic objects
///
/// Every document must carry `apiVersion` and `kind`; documents that are
/// explicitly `null` are skipped.
pub fn parse_manifests(manifests: &str) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();
    for doc in split_yaml_documents(manifests) {
        let value: serde_json::Value = serde_yaml::from_str(&doc)
            .map_err(|e| Error::serialization(format!("invalid YAML document: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        if kind.is_empty() || value.get("apiVersion").and_then(|v| v.as_str()).is_none() {
            return Err(Error::serialization(
                "manifest document is missing apiVersion or kind",
            ));
        }
        let obj: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))?;
        objects.push(obj);
    }
    Ok(objects)
}

/// Return the apiVersion and kind of a dynamic object
///
/// Errors when the object was built without type metadata.
pub fn type_of(obj: &DynamicObject) -> Result<(&str, &str), Error> {
    obj.types
        .as_ref()
        .map(|t| (t.api_version.as_str(), t.kind.as_str()))
        .ok_or_else(|| Error::serialization("object has no apiVersion/kind"))
}

/// Sort objects into apply order, stable within a kind
pub fn sort_for_apply(objects: &mut [DynamicObject]) {
    objects.sort_by_key(|o| {
        o.types
            .as_ref()
            .map(|t| kind_priority(&t.kind))
            .unwrap_or(u8::MAX)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::capi_cluster("Cluster", "clusters")]
    #[case::machine_deployment("MachineDeployment", "machinedeployments")]
    #[case::talos_control_plane("TalosControlPlane", "taloscontrolplanes")]
    #[case::policy_fallback("NetworkPolicy", "networkpolicies")]
    #[case::s_suffix("Ingress", "ingresses")]
    #[case::plain("Deployment", "deployments")]
    #[case::y_suffix("Gateway", "gateways")]
    fn pluralizes_kinds(#[case] kind: &str, #[case] plural: &str) {
        assert_eq!(pluralize_kind(kind), plural);
    }

    #[test]
    fn builds_api_resource_for_core_and_grouped_kinds() {
        let ar = build_api_resource("v1", "Namespace");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "namespaces");

        let ar = build_api_resource("cluster.x-k8s.io/v1beta1", "MachineDeployment");
        assert_eq!(ar.group, "cluster.x-k8s.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.api_version, "cluster.x-k8s.io/v1beta1");
    }

    #[test]
    fn splits_documents_and_drops_empty_ones() {
        let input = "---\n# comment only\n---\napiVersion: v1\nkind: Namespace\n---\n\n---\napiVersion: v1\nkind: ConfigMap\n";
        let docs = split_yaml_documents(input);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("Namespace"));
        assert!(docs[1].contains("ConfigMap"));
    }

    #[test]
    fn parse_manifests_rejects_untyped_documents() {
        let err = parse_manifests("metadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn parse_manifests_keeps_type_and_name() {
        let objs = parse_manifests(
            "apiVersion: cluster.x-k8s.io/v1beta1\nkind: Cluster\nmetadata:\n  name: demo\n  namespace: default\n",
        )
        .unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(type_of(&objs[0]).unwrap(), ("cluster.x-k8s.io/v1beta1", "Cluster"));
        assert_eq!(objs[0].metadata.name.as_deref(), Some("demo"));
    }

    #[test]
    fn sorts_namespaces_and_crds_before_workloads() {
        let mut objs = parse_manifests(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n---\napiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: c\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: n\n",
        )
        .unwrap();
        sort_for_apply(&mut objs);
        let kinds: Vec<_> = objs.iter().map(|o| type_of(o).unwrap().1.to_string()).collect();
        assert_eq!(kinds, vec!["Namespace", "CustomResourceDefinition", "Deployment"]);
    }

    #[test]
    fn gvk_splits_group_and_version() {
        let g = gvk("cluster.x-k8s.io/v1beta1", "Cluster");
        assert_eq!(g.group, "cluster.x-k8s.io");
        assert_eq!(g.version, "v1beta1");
        assert_eq!(g.kind, "Cluster");
    }
}
