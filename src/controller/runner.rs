//! Wiring of caches, queues and workers into the running controller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::cache::{EnqueueHandler, KubeSource, ResourceSource, WatchCache};
use super::node_events::{NodeEventFilter, NodeEventHandler, NodeEventReconciler};
use super::node_mutator::{KubeNodeStore, NodeMutator, NodeStore};
use super::queue::WorkQueue;
use super::trust::TrustReconciler;
use super::worker::Worker;
use crate::config::ControllerConfig;
use crate::crd::HostAttributes;
use crate::error::{Error, Result};

/// Only lifecycle events about nodes are watched
pub const NODE_EVENT_FIELD_SELECTOR: &str = "involvedObject.kind=Node";

/// Liveness flags shared with the health endpoint
#[derive(Debug, Default)]
pub struct ControllerStatus {
    ready: AtomicBool,
    leader: AtomicBool,
}

impl ControllerStatus {
    /// Caches are synced and workers are running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

/// Shared state for the controller process
pub struct ControllerState {
    pub client: Client,
    pub config: ControllerConfig,
    pub status: Arc<ControllerStatus>,
}

impl ControllerState {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            status: Arc::new(ControllerStatus::default()),
        }
    }
}

/// Main entry point to start the controller against the cluster
pub async fn run_controller(state: Arc<ControllerState>, stop: watch::Receiver<bool>) -> Result<()> {
    let client = state.client.clone();
    let config = &state.config;
    let host_attributes: Api<HostAttributes> = Api::namespaced(client.clone(), &config.namespace);

    info!(
        "Starting trust controller for HostAttributes in namespace {}",
        config.namespace
    );

    // Verify CRD exists
    match host_attributes.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("HostAttributes CRD is available"),
        Err(e) => {
            error!(
                "HostAttributes CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "HostAttributes CRD not installed".to_string(),
            ));
        }
    }

    let events: Api<Event> = Api::all(client.clone());
    let controller = TrustController::new(
        config.clone(),
        KubeSource::new(host_attributes, watcher::Config::default()),
        KubeSource::new(
            events,
            watcher::Config::default().fields(NODE_EVENT_FIELD_SELECTOR),
        ),
        Arc::new(KubeNodeStore::new(client)),
        Arc::clone(&state.status),
    );
    controller.run(stop).await
}

/// The controller independent of where its watch streams and nodes come from
pub struct TrustController<HS, ES> {
    config: ControllerConfig,
    hosts: HS,
    events: ES,
    nodes: Arc<dyn NodeStore>,
    status: Arc<ControllerStatus>,
}

impl<HS, ES> TrustController<HS, ES>
where
    HS: ResourceSource<HostAttributes>,
    ES: ResourceSource<Event>,
{
    pub fn new(
        config: ControllerConfig,
        hosts: HS,
        events: ES,
        nodes: Arc<dyn NodeStore>,
        status: Arc<ControllerStatus>,
    ) -> Self {
        Self {
            config,
            hosts,
            events,
            nodes,
            status,
        }
    }

    /// Run until `stop` turns true, then drain the queues and join every task
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let policy = Arc::new(self.config.policy.clone());
        let mutator = Arc::new(NodeMutator::new(self.nodes));
        // Lifecycle events older than this were replayed by the initial listing
        let started_at = Utc::now();

        let host_queue = WorkQueue::new("hostattributes", self.config.retry);
        let event_queue = WorkQueue::new("nodeevents", self.config.retry);
        let filter = Arc::new(NodeEventFilter::new(Arc::clone(&policy), started_at));

        let host_cache = WatchCache::<HostAttributes>::new("HostAttributes");
        let host_store = host_cache.store();
        let event_cache = WatchCache::<Event>::new("Event");
        let event_store = event_cache.store();

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(host_cache.run(
                self.hosts,
                EnqueueHandler::new(host_queue.clone()),
                stop.clone(),
            )),
            tokio::spawn(event_cache.run(
                self.events,
                NodeEventHandler::new(Arc::clone(&filter), event_queue.clone()),
                stop.clone(),
            )),
        ];

        let synced = tokio::select! {
            synced = async { host_store.wait_synced().await && event_store.wait_synced().await } => synced,
            _ = stopped(&mut stop) => false,
        };

        if synced {
            info!(
                "Caches synced ({} HostAttributes), starting {} workers",
                host_store.len(),
                self.config.workers
            );
            tasks.extend(
                Worker::new(
                    host_queue.clone(),
                    host_store,
                    Arc::new(TrustReconciler::new(Arc::clone(&policy), Arc::clone(&mutator))),
                )
                .spawn(self.config.workers),
            );
            tasks.extend(
                Worker::new(
                    event_queue.clone(),
                    event_store,
                    Arc::new(NodeEventReconciler::new(filter, mutator)),
                )
                .spawn(1),
            );
            self.status.set_ready(true);
            stopped(&mut stop).await;
        } else {
            warn!("Stopped before caches finished syncing");
        }

        info!("Shutting down trust controller");
        self.status.set_ready(false);
        host_queue.shutdown();
        event_queue.shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Controller task failed: {}", e);
            }
        }
        info!("Trust controller stopped");
        Ok(())
    }
}

/// Resolves once stop is requested or its sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}
