//! Queue-draining reconcile workers
//!
//! A worker takes a key from the [`WorkQueue`], looks the object up in the
//! [`CacheStore`] and hands it to a [`Reconcile`] implementation. Failures are
//! retried with backoff until [`MAX_RETRIES`] consecutive attempts have
//! failed, after which the key is dropped until something enqueues it again.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::cache::CacheStore;
use super::queue::WorkQueue;
use crate::error::{Error, Result};

/// Consecutive failures after which a key is dropped
pub const MAX_RETRIES: u32 = 5;

/// Business logic run for every dequeued key
#[async_trait]
pub trait Reconcile<K>: Send + Sync + 'static {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn reconcile(&self, obj: Arc<K>) -> Result<()>;

    /// The key is no longer in the cache.
    ///
    /// Nothing is undone on deletion; metadata applied earlier stays on the node.
    async fn deleted(&self, key: &str) {
        info!("{} {} no longer exists, nothing to reconcile", self.name(), key);
    }
}

/// Connects a queue, a cache and a reconciler
pub struct Worker<K, R> {
    queue: WorkQueue,
    store: CacheStore<K>,
    reconciler: Arc<R>,
}

impl<K, R> Clone for Worker<K, R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            store: self.store.clone(),
            reconciler: Arc::clone(&self.reconciler),
        }
    }
}

impl<K, R> Worker<K, R>
where
    K: Send + Sync + 'static,
    R: Reconcile<K>,
{
    pub fn new(queue: WorkQueue, store: CacheStore<K>, reconciler: Arc<R>) -> Self {
        Self {
            queue,
            store,
            reconciler,
        }
    }

    /// Start `count` concurrent workers; they exit once the queue shuts down
    pub fn spawn(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|id| {
                let worker = self.clone();
                tokio::spawn(async move { worker.run(id).await })
            })
            .collect()
    }

    pub async fn run(&self, id: usize) {
        debug!("{} worker {} started", self.reconciler.name(), id);
        while let Some(key) = self.queue.dequeue().await {
            self.process(&key)
                .instrument(info_span!("reconcile", controller = self.reconciler.name(), key = %key))
                .await;
            self.queue.done(&key);
        }
        debug!("{} worker {} stopped", self.reconciler.name(), id);
    }

    async fn process(&self, key: &str) {
        let started = Instant::now();
        let result = match self.store.get(key) {
            Some(obj) => self.reconciler.reconcile(obj).await,
            None => {
                self.reconciler.deleted(key).await;
                Ok(())
            }
        };

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration_seconds(
            self.reconciler.name(),
            started.elapsed().as_secs_f64(),
        );
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        self.handle_result(key, result);
    }

    fn handle_result(&self, key: &str, result: Result<()>) {
        let name = self.reconciler.name();
        let err = match result {
            Ok(()) => {
                debug!("Reconciled {} {}", name, key);
                self.queue.acknowledge(key);
                return;
            }
            Err(err) => err,
        };

        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_error(name, err.kind());

        if !err.is_retriable() {
            error!("Dropping {} {}: {} (not retriable)", name, key, err);
            self.queue.forget(key);
            return;
        }

        let failures = self.queue.num_requeues(key) + 1;
        if failures < MAX_RETRIES {
            warn!(
                "Reconcile of {} {} failed (attempt {}/{}), retrying: {}",
                name, key, failures, MAX_RETRIES, err
            );
            self.queue.retry(key);
        } else {
            self.queue.forget(key);
            report_dropped(self.queue.name(), key, &err);
        }
    }
}

/// Process-wide sink for keys that exhausted their retries
pub fn report_dropped(queue: &str, key: &str, err: &Error) {
    error!(
        queue,
        key,
        "Giving up on {} after {} consecutive failures: {}",
        key,
        MAX_RETRIES,
        err
    );
    #[cfg(feature = "metrics")]
    super::metrics::inc_queue_dropped(queue);
}
