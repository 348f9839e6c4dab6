//! A watch-fed cache of cluster nodes.

use std::sync::Arc;

use anyhow::Context as _;
use futures::{future, StreamExt as _};
use k8s_openapi::api::core::v1::Node;
use kube::{
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt as _,
    },
    Api, Client,
};

use super::NodeLookup;

/// Nodes mirrored from the API server by a background watch.
///
/// The cache is eventually consistent with the cluster; lookups never hit the API server.
#[derive(Clone)]
pub struct NodeCache {
    store: Store<Node>,
}

impl NodeCache {
    /// Start watching nodes and wait until the initial list has been received.
    pub async fn start(client: Client) -> anyhow::Result<Self> {
        let api: Api<Node> = Api::all(client);
        let (store, writer) = reflector::store();

        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects();

        tokio::spawn(async move {
            stream
                .for_each(|event| {
                    match event {
                        Ok(node) => tracing::trace!("Node cache updated: {:?}", node.metadata.name),
                        Err(err) => tracing::warn!("Node watch error: {}", err),
                    }
                    future::ready(())
                })
                .await;
            tracing::error!("Node watch stream ended");
        });

        tracing::info!("Waiting for node cache to sync");
        store
            .wait_until_ready()
            .await
            .context("Node cache writer dropped before the initial sync")?;
        tracing::info!("Node cache synced with {} nodes", store.state().len());

        Ok(Self { store })
    }
}

impl NodeLookup for NodeCache {
    fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.store.get(&ObjectRef::new(name))
    }
}
