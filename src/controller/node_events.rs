//! Tainting of freshly registered and rebooted nodes
//!
//! When the kubelet reports that a node registered or rebooted, its previous
//! attestation no longer describes the running platform. The node is tainted
//! untrusted until the next HostAttributes reconciliation clears it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, Node};
use tracing::{debug, info, instrument, warn};

use super::cache::{object_key, ResourceEventHandler};
use super::node_mutator::{NodeChange, NodeMutator};
use super::queue::WorkQueue;
use super::taints::{add_untrusted_taints, has_taint, is_control_plane, TaintEffect, TaintSpec};
use super::worker::Reconcile;
use crate::config::ControllerPolicy;
use crate::error::{Error, Result};

pub const REGISTERED_NODE_REASON: &str = "RegisteredNode";
pub const REBOOTED_REASON: &str = "Rebooted";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLifecycle {
    Registered,
    Rebooted,
}

/// Count and timestamp identifying one occurrence of a (possibly repeated) event
type Occurrence = (Option<i32>, Option<DateTime<Utc>>);

/// Decides which lifecycle events warrant tainting a node
pub struct NodeEventFilter {
    policy: Arc<ControllerPolicy>,
    /// Events at or before this instant were replayed by the initial listing
    started_at: DateTime<Utc>,
    /// Last occurrence already applied, per event uid
    handled: Mutex<HashMap<String, Occurrence>>,
}

impl NodeEventFilter {
    pub fn new(policy: Arc<ControllerPolicy>, started_at: DateTime<Utc>) -> Self {
        Self {
            policy,
            started_at,
            handled: Mutex::new(HashMap::new()),
        }
    }

    fn handled(&self) -> MutexGuard<'_, HashMap<String, Occurrence>> {
        self.handled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether this exact occurrence of the event was already applied
    pub fn already_handled(&self, event: &Event) -> bool {
        self.handled().get(&event_identity(event)) == Some(&occurrence(event))
    }

    pub fn mark_handled(&self, event: &Event) {
        self.handled().insert(event_identity(event), occurrence(event));
    }

    pub fn forget(&self, event: &Event) {
        self.handled().remove(&event_identity(event));
    }

    /// The affected node and lifecycle change, if the event should taint it
    pub fn qualifies(&self, event: &Event) -> Option<(String, NodeLifecycle)> {
        if event.involved_object.kind.as_deref() != Some("Node") {
            return None;
        }
        let lifecycle = match event.reason.as_deref()? {
            REGISTERED_NODE_REASON if self.policy.taint_registered_nodes => NodeLifecycle::Registered,
            REBOOTED_REASON if self.policy.taint_rebooted_nodes => NodeLifecycle::Rebooted,
            _ => return None,
        };
        if event_time(event)? <= self.started_at {
            return None;
        }
        let node = event.involved_object.name.clone().filter(|n| !n.is_empty())?;
        Some((node, lifecycle))
    }
}

/// Most recent timestamp the event carries
pub fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

fn event_identity(event: &Event) -> String {
    event
        .metadata
        .uid
        .clone()
        .unwrap_or_else(|| object_key(event))
}

fn occurrence(event: &Event) -> Occurrence {
    (event.count, event_time(event))
}

/// Queues qualifying lifecycle events
pub struct NodeEventHandler {
    filter: Arc<NodeEventFilter>,
    queue: WorkQueue,
}

impl NodeEventHandler {
    pub fn new(filter: Arc<NodeEventFilter>, queue: WorkQueue) -> Self {
        Self { filter, queue }
    }

    fn enqueue_if_qualifying(&self, event: &Event) {
        if self.filter.already_handled(event) {
            return;
        }
        if let Some((node, lifecycle)) = self.filter.qualifies(event) {
            debug!("Node {} {:?}, queueing taint", node, lifecycle);
            self.queue.enqueue(&object_key(event));
        }
    }
}

impl ResourceEventHandler<Event> for NodeEventHandler {
    fn on_add(&self, obj: &Arc<Event>) {
        self.enqueue_if_qualifying(obj);
    }

    fn on_update(&self, old: &Arc<Event>, new: &Arc<Event>) {
        // A relist replays every event unchanged
        if old.metadata.resource_version.is_some()
            && old.metadata.resource_version == new.metadata.resource_version
        {
            return;
        }
        // Repeated events bump the count and timestamp of the same object
        self.enqueue_if_qualifying(new);
    }

    fn on_delete(&self, obj: &Arc<Event>) {
        self.filter.forget(obj);
    }
}

pub struct NodeEventReconciler {
    filter: Arc<NodeEventFilter>,
    mutator: Arc<NodeMutator>,
}

impl NodeEventReconciler {
    pub fn new(filter: Arc<NodeEventFilter>, mutator: Arc<NodeMutator>) -> Self {
        Self { filter, mutator }
    }
}

#[async_trait]
impl Reconcile<Event> for NodeEventReconciler {
    fn name(&self) -> &'static str {
        "nodeevents"
    }

    #[instrument(skip(self, obj), fields(event = %object_key(obj.as_ref())))]
    async fn reconcile(&self, obj: Arc<Event>) -> Result<()> {
        let Some((node, lifecycle)) = self.filter.qualifies(&obj) else {
            return Ok(());
        };
        if self.filter.already_handled(&obj) {
            debug!("Lifecycle event for node {} already applied", node);
            return Ok(());
        }

        match self.mutator.with_node(&node, taint_pending_attestation).await {
            Ok(NodeChange::Modified) => {
                info!("Tainted node {} after {:?} pending attestation", node, lifecycle);
                #[cfg(feature = "metrics")]
                super::metrics::inc_taint_change("added");
            }
            Ok(NodeChange::Unchanged) => {}
            Err(Error::NodeNotFound(name)) => {
                warn!("Node {} from lifecycle event no longer exists", name);
            }
            Err(e) => return Err(e),
        }
        self.filter.mark_handled(&obj);
        Ok(())
    }
}

/// Add both untrusted taints unless the node is control plane or already tainted
pub fn taint_pending_attestation(node: &mut Node) -> Result<NodeChange> {
    if is_control_plane(node) {
        return Ok(NodeChange::Unchanged);
    }
    if has_taint(node, &TaintSpec::untrusted(TaintEffect::NoSchedule)) {
        return Ok(NodeChange::Unchanged);
    }
    Ok(NodeChange::from_changed(add_untrusted_taints(node)))
}
