//! Prometheus metrics for the trust node controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `isecl_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `isecl_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `isecl_work_queue_depth` (gauge): keys waiting in a queue.
//! - `isecl_work_queue_retries_total` (counter): retries scheduled per queue.
//! - `isecl_work_queue_dropped_total` (counter): keys dropped after exhausting retries.
//! - `isecl_node_updates_total` (counter): node objects written.
//! - `isecl_node_taint_changes_total` (counter): untrusted taint additions and removals.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "hostattributes"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "validation"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaintLabels {
    /// "added" or "removed"
    pub action: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static QUEUE_RETRIES_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DROPPED_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static NODE_UPDATES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static TAINT_CHANGES_TOTAL: Lazy<Family<TaintLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "isecl_reconcile_duration_seconds",
        "Duration of reconcile attempts in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "isecl_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "isecl_work_queue_depth",
        "Keys waiting to be reconciled",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "isecl_work_queue_retries_total",
        "Total number of retries scheduled",
        QUEUE_RETRIES_TOTAL.clone(),
    );
    registry.register(
        "isecl_work_queue_dropped_total",
        "Total number of keys dropped after exhausting their retries",
        QUEUE_DROPPED_TOTAL.clone(),
    );
    registry.register(
        "isecl_node_updates_total",
        "Total number of node objects written",
        NODE_UPDATES_TOTAL.clone(),
    );
    registry.register(
        "isecl_node_taint_changes_total",
        "Total number of untrusted taint additions and removals",
        TAINT_CHANGES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DEPTH.get_or_create(&labels).set(depth as i64);
}

pub fn inc_queue_retry(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_RETRIES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_queue_dropped(queue: &str) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DROPPED_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_node_update() {
    NODE_UPDATES_TOTAL.inc();
}

pub fn inc_taint_change(action: &str) {
    let labels = TaintLabels {
        action: action.to_string(),
    };
    TAINT_CHANGES_TOTAL.get_or_create(&labels).inc();
}
