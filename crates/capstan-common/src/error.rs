//! Error types for capstan
//!
//! Errors are structured with fields so callers can tell configuration
//! mistakes apart from remote access failures and exhausted waits. Transient
//! convergence ("not ready yet") is not an error here: pollers carry it in the
//! `Ok` channel as `PollOutcome::Pending`, and only an exhausted budget turns it
//! into [`Error::Timeout`].

use thiserror::Error;

/// Main error type for capstan operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error other than "not found"
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Provider token names a provider this build does not know
    #[error("unknown infrastructure provider type {name}")]
    UnknownProviderType {
        /// Name part of the `name[:version]` token
        name: String,
    },

    /// Provider setup options are missing fields or belong to another provider
    #[error("invalid configuration for provider {provider}: {message}")]
    InvalidConfiguration {
        /// Provider being configured
        provider: String,
        /// Description of what's wrong
        message: String,
    },

    /// Per-deployment provider options belong to another provider
    #[error("invalid deploy options for provider {provider}: {message}")]
    InvalidProviderOptions {
        /// Provider receiving the options
        provider: String,
        /// Description of what's wrong
        message: String,
    },

    /// Deploy was requested but no infrastructure provider is installed
    #[error("no infrastructure providers are installed")]
    NoProviderInstalled,

    /// Deploy requested a provider that is not among the installed ones
    #[error("no provider with name {name}{} is installed", version.as_deref().map(|v| format!(" and version {v}")).unwrap_or_default())]
    ProviderNotFound {
        /// Requested provider name
        name: String,
        /// Requested provider version, if pinned
        version: Option<String>,
    },

    /// Worker scale target could not be chosen without a name
    #[error("cluster {cluster} has {count} machine deployments, a machine deployment name is required")]
    AmbiguousMachineGroup {
        /// Cluster being scaled
        cluster: String,
        /// Number of candidate MachineDeployments
        count: usize,
    },

    /// A replica or node count was negative
    #[error("invalid replica count {replicas} for {target}: must be >= 0")]
    InvalidReplicas {
        /// What the count was for (e.g., "worker nodes")
        target: String,
        /// The rejected value
        replicas: i64,
    },

    /// A Cluster object referenced by name does not exist
    #[error("cluster {namespace}/{name} not found")]
    ClusterNotFound {
        /// Cluster name
        name: String,
        /// Cluster namespace
        namespace: String,
    },

    /// A field required on a remote object is absent
    #[error("failed to find field {path}")]
    FieldNotFound {
        /// Dotted path of the missing field
        path: String,
    },

    /// A field on a remote object exists but has an unexpected type
    #[error("field {path} is not a {expected}")]
    FieldType {
        /// Dotted path of the field
        path: String,
        /// Expected JSON type
        expected: &'static str,
    },

    /// A configuration variable has no value in overrides, env or config file
    #[error("failed to get value for variable {key:?}, set it with an environment variable or in the clusterctl config file")]
    MissingVariable {
        /// The variable name
        key: String,
    },

    /// A cluster template references variables that have no value
    #[error("value for variables [{}] is not set", variables.join(", "))]
    MissingTemplateVariables {
        /// Every unresolved variable, sorted
        variables: Vec<String>,
    },

    /// Validation error for caller-supplied options
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Provider component installation error
    #[error("CAPI installation error: {message}")]
    CapiInstallation {
        /// Description of what failed
        message: String,
        /// Provider being installed (if applicable)
        provider: Option<String>,
    },

    /// Template materialization error
    #[error("template error: {message}")]
    Template {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A bounded wait ran out of budget before converging
    #[error("timed out waiting for {operation}: {last}")]
    Timeout {
        /// The operation being waited on
        operation: String,
        /// The last observed pending condition
        last: String,
    },

    /// A wait was aborted by the session cancellation token
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was cancelled
        operation: String,
    },

    /// Local I/O error (template files, temp artifacts, config files)
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being read or written
        context: String,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an invalid-configuration error for a provider
    pub fn invalid_configuration(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-provider-options error for a provider
    pub fn invalid_provider_options(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidProviderOptions {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a field-not-found error from path segments
    pub fn field_not_found(path: &[&str]) -> Self {
        Self::FieldNotFound {
            path: path.join("."),
        }
    }

    /// Create a field-type error from path segments
    pub fn field_type(path: &[&str], expected: &'static str) -> Self {
        Self::FieldType {
            path: path.join("."),
            expected,
        }
    }

    /// Create a CAPI installation error with the given message
    pub fn capi_installation(msg: impl Into<String>) -> Self {
        Self::CapiInstallation {
            message: msg.into(),
            provider: None,
        }
    }

    /// Create a CAPI installation error for a specific provider
    pub fn capi_installation_for_provider(
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::CapiInstallation {
            message: msg.into(),
            provider: Some(provider.into()),
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap an I/O error with the path or artifact it concerned
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Get the provider name if this error is associated with one
    pub fn provider(&self) -> Option<&str> {
        match self {
            Error::UnknownProviderType { name } => Some(name),
            Error::InvalidConfiguration { provider, .. } => Some(provider),
            Error::InvalidProviderOptions { provider, .. } => Some(provider),
            Error::ProviderNotFound { name, .. } => Some(name),
            Error::CapiInstallation { provider, .. } => provider.as_deref(),
            _ => None,
        }
    }
}

/// Returns true when a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
