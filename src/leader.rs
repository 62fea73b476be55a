//! Lease-based leader election
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! controller. A leader that fails to renew in time raises the stop signal
//! and exits, so at most one replica writes to nodes at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::controller::ControllerStatus;

pub const LEASE_NAME: &str = "isecl-k8s-controller-leader";
pub const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Identity recorded in the lease: the pod name, else the host name
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

/// What a replica should do with the lease it just read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// The holder stopped renewing; claim it
    TakeOver,
    /// Someone else holds a live lease
    Wait,
}

impl LeaseAction {
    pub fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> Self {
        let Some(lease) = lease else {
            return LeaseAction::Create;
        };
        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(identity) {
            return LeaseAction::Renew;
        }
        let ttl = chrono::Duration::seconds(
            spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS).into(),
        );
        match spec.renew_time {
            Some(MicroTime(renewed)) if now <= renewed + ttl => LeaseAction::Wait,
            _ => LeaseAction::TakeOver,
        }
    }
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until the lease is ours. Returns `false` if stopped first.
    pub async fn acquire(&self, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                    return true;
                }
                Ok(false) => debug!("Lease {} held by another replica", LEASE_NAME),
                Err(e) => warn!("Leader election error: {:?}", e),
            }

            tokio::select! {
                _ = stop.wait_for(|s| *s) => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Keep renewing the lease until stopped; raise `stop` once it is lost
    pub async fn hold(self, status: Arc<ControllerStatus>, stop: watch::Sender<bool>) {
        let mut stopped = stop.subscribe();
        let lease_duration = Duration::from_secs(LEASE_DURATION_SECS as u64);
        let mut last_renewed = Instant::now();
        status.set_leader(true);

        loop {
            let interval = if last_renewed.elapsed() < RENEW_INTERVAL {
                RENEW_INTERVAL
            } else {
                RETRY_INTERVAL
            };
            tokio::select! {
                _ = stopped.wait_for(|s| *s) => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                    break;
                }
                Err(e) => {
                    warn!("Failed to renew lease {}: {:?}", LEASE_NAME, e);
                    if last_renewed.elapsed() >= lease_duration {
                        error!("Lease {} expired without renewal", LEASE_NAME);
                        break;
                    }
                }
            }
        }

        status.set_leader(false);
        stop.send_replace(true);
    }

    /// One election round. `Ok(true)` means we hold the lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let current = match self.leases.get(LEASE_NAME).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(err)) if err.code == 404 => None,
            Err(e) => return Err(e),
        };

        let spec = LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            ..Default::default()
        };

        match LeaseAction::decide(current.as_ref(), &self.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Renew => {
                let patch = Lease {
                    spec: Some(spec),
                    ..Default::default()
                };
                self.leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(true)
            }
            LeaseAction::TakeOver => {
                let previous = current.as_ref().and_then(|l| l.spec.as_ref());
                info!(
                    "Lease held by {:?} has expired, taking over",
                    previous.and_then(|s| s.holder_identity.as_deref())
                );
                // resourceVersion makes a concurrent takeover fail with a conflict
                let patch = Lease {
                    metadata: ObjectMeta {
                        resource_version: current
                            .as_ref()
                            .and_then(|l| l.metadata.resource_version.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        acquire_time: Some(MicroTime(now)),
                        lease_transitions: Some(
                            previous.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
                        ),
                        ..spec
                    }),
                };
                match self
                    .leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
            LeaseAction::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        acquire_time: Some(MicroTime(now)),
                        ..spec
                    }),
                };
                match self.leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
                        Ok(true)
                    }
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}
