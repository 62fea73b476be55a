//! Reconciliation of HostAttributes objects onto nodes
//!
//! Every host record of a HostAttributes object is synced independently: its
//! trust labels, annotations and untrusted taints are recomputed against a
//! fresh copy of the node under the node mutation lock.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::cache::object_key;
use super::labels::map_host;
use super::node_mutator::{NodeChange, NodeMutator};
use super::taints::{add_untrusted_taints, is_control_plane, remove_untrusted_taints};
use super::worker::Reconcile;
use crate::config::ControllerPolicy;
use crate::crd::{HostAttributes, HostTrustRecord};
use crate::error::{Error, Result};

pub struct TrustReconciler {
    policy: Arc<ControllerPolicy>,
    mutator: Arc<NodeMutator>,
}

impl TrustReconciler {
    pub fn new(policy: Arc<ControllerPolicy>, mutator: Arc<NodeMutator>) -> Self {
        Self { policy, mutator }
    }

    #[instrument(skip(self, host), fields(node = %host.hostname))]
    async fn sync_host(&self, host: &HostTrustRecord) -> Result<NodeChange> {
        if host.hostname.is_empty() {
            warn!("Skipping host record without a host name");
            return Ok(NodeChange::Unchanged);
        }
        if !host.has_signed_report() {
            debug!("No signed report for {}, leaving node untouched", host.hostname);
            return Ok(NodeChange::Unchanged);
        }

        let policy = Arc::clone(&self.policy);
        self.mutator
            .with_node(&host.hostname, move |node| {
                apply_host_record(node, host, &policy)
            })
            .await
    }
}

#[async_trait]
impl Reconcile<HostAttributes> for TrustReconciler {
    fn name(&self) -> &'static str {
        "hostattributes"
    }

    async fn reconcile(&self, obj: Arc<HostAttributes>) -> Result<()> {
        let key = object_key(obj.as_ref());
        let hosts = &obj.spec.host_list;
        info!("Reconciling HostAttributes {} ({} hosts)", key, hosts.len());

        let mut failures = Vec::new();
        for host in hosts {
            match self.sync_host(host).await {
                Ok(NodeChange::Modified) => info!("Updated trust metadata on node {}", host.hostname),
                Ok(NodeChange::Unchanged) => {}
                Err(Error::NodeNotFound(name)) => {
                    warn!("Node {} from {} not found, skipping", name, key)
                }
                Err(e) if !e.is_retriable() => {
                    warn!("Cannot sync node {} from {}: {}", host.hostname, key, e)
                }
                Err(e) => failures.push(format!("{}: {}", host.hostname, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::HostSyncFailed {
                key,
                failed: failures.len(),
                total: hosts.len(),
                message: failures.join("; "),
            })
        }
    }
}

/// Bring one node in line with its host's trust record.
///
/// Labels and annotations are always synced. Taints are only touched for hosts
/// with a platform report, since only that report vouches for `trusted`, and
/// never on control-plane nodes.
pub fn apply_host_record(
    node: &mut Node,
    host: &HostTrustRecord,
    policy: &ControllerPolicy,
) -> Result<NodeChange> {
    let Some(delta) = map_host(host, node.labels(), &policy.tag_prefix) else {
        return Ok(NodeChange::Unchanged);
    };
    let mut changed = delta.apply_to(&mut node.metadata);

    if host.hvs_report().is_some() {
        if is_control_plane(node) {
            debug!("Node {} is a control-plane node, not tainting", host.hostname);
        } else if !host.trusted {
            if policy.taint_untrusted_nodes {
                let tainted = add_untrusted_taints(node);
                if tainted {
                    info!("Tainting untrusted node {}", host.hostname);
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_taint_change("added");
                }
                changed |= tainted;
            }
        } else {
            let untainted = remove_untrusted_taints(node);
            if untainted {
                info!("Removing untrusted taints from node {}", host.hostname);
                #[cfg(feature = "metrics")]
                super::metrics::inc_taint_change("removed");
            }
            changed |= untainted;
        }
    }

    Ok(NodeChange::from_changed(changed))
}
