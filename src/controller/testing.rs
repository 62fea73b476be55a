//! In-memory stand-ins for the Kubernetes API used by controller tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use tokio::sync::{mpsc, Notify};

use super::cache::ResourceSource;
use super::node_mutator::NodeStore;
use crate::error::{Error, Result};

pub fn test_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn api_error(code: u16) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected".to_string(),
        reason: "Injected".to_string(),
        code,
    }))
}

#[derive(Default)]
struct FakeNodes {
    nodes: HashMap<String, Node>,
    writes: usize,
    conflicts: usize,
    failing_writes: usize,
}

/// Node store with optimistic-concurrency checks and fault injection
#[derive(Default)]
pub struct FakeNodeStore {
    state: Mutex<FakeNodes>,
    latency: Duration,
}

impl FakeNodeStore {
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let store = Self::default();
        for node in nodes {
            store.insert(node);
        }
        store
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, mut node: Node) {
        node.metadata.resource_version = Some("1".to_string());
        self.state.lock().unwrap().nodes.insert(node.name_any(), node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    /// Make the next `count` writes fail with a server error
    pub fn fail_writes(&self, count: usize) {
        self.state.lock().unwrap().failing_writes = count;
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn conflicts(&self) -> usize {
        self.state.lock().unwrap().conflicts
    }

    pub fn taints(&self, name: &str) -> Vec<(String, String, String)> {
        self.node(name)
            .and_then(|n| n.spec)
            .and_then(|s| s.taints)
            .unwrap_or_default()
            .into_iter()
            .map(|t| (t.key, t.value.unwrap_or_default(), t.effect))
            .collect()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl NodeStore for FakeNodeStore {
    async fn get(&self, name: &str) -> Result<Node> {
        self.simulate_latency().await;
        self.node(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    async fn replace(&self, node: &Node) -> Result<Node> {
        self.simulate_latency().await;
        let mut state = self.state.lock().unwrap();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(api_error(503));
        }

        let name = node.name_any();
        let current_version = state
            .nodes
            .get(&name)
            .ok_or_else(|| Error::NodeNotFound(name.clone()))?
            .metadata
            .resource_version
            .clone();
        if current_version != node.metadata.resource_version {
            state.conflicts += 1;
            return Err(api_error(409));
        }

        let next_version = current_version
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let mut stored = node.clone();
        stored.metadata.resource_version = Some(next_version.to_string());
        state.nodes.insert(name, stored.clone());
        state.writes += 1;
        Ok(stored)
    }
}

struct ChannelState<K> {
    /// Streams prepared by the test before the cache asks for them
    ready: VecDeque<mpsc::UnboundedReceiver<Event<K>>>,
    /// Senders for streams the cache opened on its own
    opened: VecDeque<mpsc::UnboundedSender<Event<K>>>,
}

/// Watch source whose streams are fed by the test through channels.
///
/// A stream ends when every sender for it has been dropped.
pub struct ChannelSource<K> {
    state: Arc<Mutex<ChannelState<K>>>,
    opened: Arc<Notify>,
}

impl<K> Clone for ChannelSource<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            opened: Arc::clone(&self.opened),
        }
    }
}

impl<K: Send + 'static> ChannelSource<K> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                ready: VecDeque::new(),
                opened: VecDeque::new(),
            })),
            opened: Arc::new(Notify::new()),
        }
    }

    /// Prepare the next stream the cache will open and return its sender
    pub fn sender(&self) -> mpsc::UnboundedSender<Event<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().ready.push_back(rx);
        tx
    }

    /// Wait for the cache to open a stream nobody prepared and return its sender
    pub async fn next_sender(&self) -> mpsc::UnboundedSender<Event<K>> {
        loop {
            let notified = self.opened.notified();
            if let Some(tx) = self.state.lock().unwrap().opened.pop_front() {
                return tx;
            }
            notified.await;
        }
    }
}

impl<K: Send + 'static> ResourceSource<K> for ChannelSource<K> {
    fn watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            match state.ready.pop_front() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.opened.push_back(tx);
                    rx
                }
            }
        };
        self.opened.notify_one();

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        })
        .boxed()
    }
}
