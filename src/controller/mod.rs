//! Controller module for host trust reconciliation
//! This module contains the watch caches, work queues and reconcilers that
//! mirror HostAttributes trust reports and node lifecycle events onto nodes.

pub mod cache;
pub mod labels;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod node_events;
#[cfg(test)]
mod node_events_test;
pub mod node_mutator;
pub mod queue;
mod runner;
#[cfg(test)]
mod runner_test;
pub mod taints;
#[cfg(test)]
mod testing;
pub mod trust;
pub mod worker;

pub use cache::{object_key, CacheStore, KubeSource, ResourceSource, WatchCache};
pub use node_events::{NodeEventFilter, NodeLifecycle};
pub use node_mutator::{KubeNodeStore, NodeChange, NodeMutator, NodeStore};
pub use queue::{calculate_backoff, WorkQueue};
pub use runner::{
    run_controller, ControllerState, ControllerStatus, TrustController, NODE_EVENT_FIELD_SELECTOR,
};
pub use trust::{apply_host_record, TrustReconciler};
pub use worker::{Reconcile, Worker, MAX_RETRIES};
