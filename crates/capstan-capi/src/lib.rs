//! Cluster API lifecycle orchestration
//!
//! This crate provides:
//! - [`Provider`] trait and implementations for infrastructure providers (AWS, Docker)
//! - [`Manager`] for idempotent provider installation and cluster deployment
//! - [`Cluster`] handles with readiness, scale, health and delete
//! - [`NativeInstaller`] applying provider components from a local directory

pub mod client;
pub mod cluster;
pub mod constants;
pub mod deploy;
pub mod installer;
pub mod manager;
pub mod provider;
pub mod readiness;
pub mod scale;
pub mod substitute;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

// Re-export client types
pub use client::{KubeResourceClient, LifecycleApi, ResourceClient};

#[cfg(test)]
pub use client::MockResourceClient;

// Re-export orchestration types
pub use cluster::{Cluster, NodeAddresses};
pub use deploy::DeployOptions;
pub use manager::{Manager, ManagerOptions};
pub use readiness::{check_cluster_ready, NotReadyReason, Readiness};
pub use scale::{NodeGroup, ScaleOptions};

// Re-export installer types
pub use installer::{ComponentInstaller, ComponentType, InitOptions, NativeInstaller};

#[cfg(test)]
pub use installer::MockComponentInstaller;

// Re-export provider and template types
pub use provider::{
    create_provider, AwsDeployOptions, AwsProvider, AwsSetupOptions, DockerDeployOptions,
    DockerProvider, Provider, ProviderDeployOptions, ProviderKind, ProviderOptions, ProviderToken,
    SetupOptions,
};
pub use template::{NativeRenderer, Template, TemplateOptions, TemplateRenderer, TemplateSource};
