//! Serialized read-modify-write access to Node objects
//!
//! Every component that changes a node goes through [`NodeMutator::with_node`],
//! which holds one process-wide lock from the read until the write returns.
//! Two reconciliations can therefore never compute their changes against the
//! same stale copy of a node and overwrite each other.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Read and full-replace access to nodes
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Node>;

    /// Replace the whole object; the server rejects stale resource versions
    async fn replace(&self, node: &Node) -> Result<Node>;
}

/// [`NodeStore`] backed by the Kubernetes API
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &str) -> Result<Node> {
        match self.api.get(name).await {
            Ok(node) => Ok(node),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::NodeNotFound(name.to_string())),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn replace(&self, node: &Node) -> Result<Node> {
        self.api
            .replace(&node.name_any(), &PostParams::default(), node)
            .await
            .map_err(Error::KubeError)
    }
}

/// Outcome of a node mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeChange {
    /// The node was modified and written back
    Modified,
    /// Nothing to do; the node was not written
    Unchanged,
}

impl NodeChange {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            NodeChange::Modified
        } else {
            NodeChange::Unchanged
        }
    }
}

/// Sole writer of Node objects
pub struct NodeMutator {
    store: Arc<dyn NodeStore>,
    lock: Mutex<()>,
}

impl NodeMutator {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Fetch a node, let `mutate` edit it and write it back if it changed.
    ///
    /// The lock covers the entire cycle, including the API round-trips.
    #[instrument(skip(self, mutate))]
    pub async fn with_node<F>(&self, name: &str, mutate: F) -> Result<NodeChange>
    where
        F: FnOnce(&mut Node) -> Result<NodeChange> + Send,
    {
        let _guard = self.lock.lock().await;

        let mut node = self.store.get(name).await?;
        match mutate(&mut node)? {
            NodeChange::Unchanged => {
                debug!("Node {} already up to date", name);
                Ok(NodeChange::Unchanged)
            }
            NodeChange::Modified => {
                self.store.replace(&node).await?;
                debug!("Node {} updated", name);
                #[cfg(feature = "metrics")]
                super::metrics::inc_node_update();
                Ok(NodeChange::Modified)
            }
        }
    }
}
