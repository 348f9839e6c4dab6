use anyhow::Context as _;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};

use super::{consts, PodClient};

/// Pod reads and writes issued straight against the API server.
#[derive(Clone)]
pub struct KubePods {
    kube_client: kube::Client,
}

impl KubePods {
    pub fn new(kube_client: kube::Client) -> Self {
        Self { kube_client }
    }

    fn api(&self, namespace: &str) -> kube::Api<Pod> {
        kube::Api::namespaced(self.kube_client.clone(), namespace)
    }
}

impl PodClient for KubePods {
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> {
        self.api(namespace)
            .get(name)
            .await
            .with_context(|| format!("Failed to get pod {namespace}/{name}"))
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let params = PatchParams {
            field_manager: Some(consts::FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(namespace)
            .patch(name, &params, &Patch::Strategic(patch))
            .await
            .with_context(|| format!("Failed to patch pod {namespace}/{name}"))?;
        Ok(())
    }
}
