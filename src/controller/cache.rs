//! Watch-backed local cache of Kubernetes objects
//!
//! A [`WatchCache`] consumes a list+watch stream from a [`ResourceSource`],
//! keeps a keyed snapshot of the objects it has seen and tells a
//! [`ResourceEventHandler`] about every add, update and delete. Readers get a
//! [`CacheStore`] handle; only the cache itself ever writes the snapshot.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::queue::WorkQueue;

/// Delay before re-subscribing after a watch stream ends
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Cache key of an object: `namespace/name`, or `name` when cluster scoped
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Producer of list+watch event streams for one resource type
pub trait ResourceSource<K>: Send + Sync + 'static {
    /// Open a new stream, starting with a full initial listing
    fn watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>>;
}

/// [`ResourceSource`] backed by the Kubernetes API
pub struct KubeSource<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> KubeSource<K> {
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self { api, config }
    }
}

impl<K> ResourceSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>> {
        watcher::watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .boxed()
    }
}

/// Callbacks invoked as the cache observes changes.
///
/// Delivery is at-least-once; implementations must be idempotent.
pub trait ResourceEventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &Arc<K>);
}

/// Handler that feeds every change into a work queue
pub struct EnqueueHandler {
    queue: WorkQueue,
}

impl EnqueueHandler {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }
}

impl<K: Resource + Send + Sync + 'static> ResourceEventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &Arc<K>) {
        self.queue.enqueue(&object_key(obj.as_ref()));
    }

    fn on_update(&self, _old: &Arc<K>, new: &Arc<K>) {
        self.queue.enqueue(&object_key(new.as_ref()));
    }

    fn on_delete(&self, obj: &Arc<K>) {
        self.queue.enqueue(&object_key(obj.as_ref()));
    }
}

type Snapshot<K> = HashMap<String, Arc<K>>;

/// Read-only handle on a cache snapshot
pub struct CacheStore<K> {
    objects: Arc<RwLock<Snapshot<K>>>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for CacheStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            synced: self.synced.clone(),
        }
    }
}

impl<K> CacheStore<K> {
    fn read(&self) -> RwLockReadGuard<'_, Snapshot<K>> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point lookup by cache key
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the initial listing has been loaded.
    ///
    /// Returns `false` if the cache was dropped before it ever synced.
    pub async fn wait_synced(&self) -> bool {
        let mut synced = self.synced.clone();
        let ok = synced.wait_for(|s| *s).await.is_ok();
        ok
    }
}

enum Change<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(Arc<K>),
}

/// Owner of a cache snapshot, driven by a watch stream
pub struct WatchCache<K> {
    kind: String,
    objects: Arc<RwLock<Snapshot<K>>>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    /// Snapshot being assembled during a (re)list
    pending: Option<Snapshot<K>>,
}

impl<K> WatchCache<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            kind: kind.into(),
            objects: Arc::new(RwLock::new(HashMap::new())),
            synced_tx,
            synced_rx,
            pending: None,
        }
    }

    pub fn store(&self) -> CacheStore<K> {
        CacheStore {
            objects: Arc::clone(&self.objects),
            synced: self.synced_rx.clone(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot<K>> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume watch streams from `source` until `stop` fires.
    ///
    /// Errors inside a stream are logged and left to the source's own backoff;
    /// a stream that ends is re-opened, which triggers a fresh listing.
    pub async fn run<S, H>(mut self, source: S, handler: H, mut stop: watch::Receiver<bool>)
    where
        S: ResourceSource<K>,
        H: ResourceEventHandler<K>,
    {
        info!("Starting {} watch", self.kind);

        loop {
            let mut stream = source.watch();
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            info!("Stopping {} watch", self.kind);
                            return;
                        }
                    }
                    next = stream.next() => match next {
                        Some(Ok(event)) => self.apply(event, &handler),
                        Some(Err(e)) => warn!("{} watch error: {}", self.kind, e),
                        None => {
                            warn!("{} watch stream ended, re-establishing", self.kind);
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = stop.changed() => {
                    info!("Stopping {} watch", self.kind);
                    return;
                }
                _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
            }
        }
    }

    /// Fold one watch event into the snapshot and notify the handler
    pub(crate) fn apply<H: ResourceEventHandler<K>>(&mut self, event: Event<K>, handler: &H) {
        let changes = match event {
            Event::Init => {
                trace!("{} relist started", self.kind);
                self.pending = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let key = object_key(&obj);
                self.pending
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
                Vec::new()
            }
            Event::InitDone => self.replace(),
            Event::Apply(obj) => {
                let key = object_key(&obj);
                let obj = Arc::new(obj);
                match self.write().insert(key, Arc::clone(&obj)) {
                    Some(old) => vec![Change::Updated(old, obj)],
                    None => vec![Change::Added(obj)],
                }
            }
            Event::Delete(obj) => {
                let key = object_key(&obj);
                let removed = self.write().remove(&key);
                vec![Change::Deleted(removed.unwrap_or_else(|| Arc::new(obj)))]
            }
        };

        for change in changes {
            match change {
                Change::Added(obj) => handler.on_add(&obj),
                Change::Updated(old, new) => handler.on_update(&old, &new),
                Change::Deleted(obj) => handler.on_delete(&obj),
            }
        }
    }

    /// Swap in the relisted snapshot, diffing it against the previous one
    fn replace(&mut self) -> Vec<Change<K>> {
        let fresh = self.pending.take().unwrap_or_default();
        let mut changes = Vec::with_capacity(fresh.len());
        {
            let mut objects = self.write();
            for (key, obj) in &fresh {
                match objects.get(key) {
                    Some(old) => changes.push(Change::Updated(Arc::clone(old), Arc::clone(obj))),
                    None => changes.push(Change::Added(Arc::clone(obj))),
                }
            }
            for (key, old) in objects.iter() {
                if !fresh.contains_key(key) {
                    changes.push(Change::Deleted(Arc::clone(old)));
                }
            }
            *objects = fresh;
        }

        debug!("{} cache synced with {} objects", self.kind, self.store().len());
        self.synced_tx.send_replace(true);
        changes
    }
}
