//! This module is responsible for interfacing with Kubernetes.

use std::{future::Future, path::Path, sync::Arc};

use anyhow::Context as _;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};

pub mod nodes;
pub mod pods;

pub mod consts {
    pub const KIND_POD: &str = "Pod";
    pub const KIND_BINDING: &str = "Binding";
    pub const KIND_NODE: &str = "Node";
    /// The field manager recorded on pod patches.
    pub const FIELD_MANAGER: &str = "node-labels-exporter";
}

/// Read access to nodes, usually served from a local cache.
pub trait NodeLookup: Send + Sync {
    fn get_node(&self, name: &str) -> Option<Arc<Node>>;
}

/// Direct access to live pods in the API server.
pub trait PodClient: Send + Sync {
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = anyhow::Result<Pod>> + Send;

    /// Apply a strategic merge patch to the pod.
    fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Build a client from the given kubeconfig, or from the default configuration
/// (in-cluster, `KUBECONFIG` or `~/.kube/config`) when none is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .context("Failed to create Kubernetes client");
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig file: {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("Failed to create config from kubeconfig: {}", path.display()))?;

    Client::try_from(config).context("Failed to create Kubernetes client from kubeconfig")
}
