//! Deduplicating, rate-limited work queue
//!
//! Keys, not payloads, are queued: the watch cache stays the source of truth
//! and a worker always reads the latest cached object when it picks a key up.
//! A key is never handed to two workers at once; enqueueing a key that is
//! being processed marks it dirty so it runs again once the current attempt
//! completes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::RetrySettings;

/// Exponential per-key backoff: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(31));
    base.saturating_mul(factor).min(max)
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, whether queued or deferred behind an
    /// in-flight attempt
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    retry: RetrySettings,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Cloneable handle to a shared work queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, retry: RetrySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                retry,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state is only touched by short non-panicking sections, so a
        // poisoned lock still holds consistent data.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a key unless it is already pending
    pub fn enqueue(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down {
            trace!(queue = %self.inner.name, key, "queue shutting down, dropping key");
            return;
        }
        if !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            debug!(queue = %self.inner.name, key, "key in flight, deferring");
            return;
        }
        state.queue.push_back(key.to_string());
        self.record_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue has been shut down and every pending key
    /// has been handed out.
    pub async fn dequeue(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a concurrent enqueue
            // cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of a key as finished.
    ///
    /// If the key was enqueued again while in flight it goes back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            self.record_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Successful processing: clear the failure history of a key
    pub fn acknowledge(&self, key: &str) {
        self.forget(key);
    }

    /// Drop the failure history of a key so the next enqueue starts fresh
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Number of retries recorded for a key since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Re-enqueue a key after its backoff delay and count the failure
    pub fn retry(&self, key: &str) {
        let attempt = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let attempt = *failures;
            *failures += 1;
            attempt
        };

        let delay = calculate_backoff(
            attempt,
            self.inner.retry.base_delay,
            self.inner.retry.max_delay,
        );
        debug!(queue = %self.inner.name, key, ?delay, attempt = attempt + 1, "scheduling retry");

        #[cfg(feature = "metrics")]
        super::metrics::inc_queue_retry(&self.inner.name);

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(&key);
        });
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every blocked `dequeue`
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    #[allow(unused_variables)]
    fn record_depth(&self, state: &QueueState) {
        #[cfg(feature = "metrics")]
        super::metrics::set_queue_depth(&self.inner.name, state.queue.len());
    }
}
