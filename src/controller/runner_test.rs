//! End-to-end tests for the assembled controller against in-memory sources

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::api::core::v1::{Event, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;
    use kube::ResourceExt;
    use tokio::sync::watch;

    use crate::config::{ControllerConfig, ControllerPolicy, RetrySettings};
    use crate::controller::runner::{ControllerStatus, TrustController};
    use crate::controller::testing::{test_node, ChannelSource, FakeNodeStore};
    use crate::crd::{HostAttributes, HostAttributesSpec, HostTrustRecord};

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            workers: 2,
            policy: ControllerPolicy {
                taint_untrusted_nodes: true,
                taint_registered_nodes: true,
                taint_rebooted_nodes: true,
                ..Default::default()
            },
            retry: RetrySettings {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
            ..Default::default()
        }
    }

    fn hosts(trusted: bool) -> HostAttributes {
        let mut ha = HostAttributes::new(
            "cluster-hosts",
            HostAttributesSpec {
                host_list: vec![HostTrustRecord {
                    hostname: "worker-1".to_string(),
                    trusted,
                    hvs_signed_report: Some("report".to_string()),
                    ..Default::default()
                }],
            },
        );
        ha.metadata.namespace = Some("default".to_string());
        ha
    }

    fn reboot_event(node: &str, at: chrono::DateTime<Utc>) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.reboot", node)),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
            reason: Some("Rebooted".to_string()),
            last_timestamp: Some(Time(at)),
            ..Default::default()
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_controller_mirrors_trust_and_lifecycle_events() {
        let host_source = ChannelSource::<HostAttributes>::new();
        let host_tx = host_source.sender();
        let event_source = ChannelSource::<Event>::new();
        let event_tx = event_source.sender();
        let nodes = Arc::new(FakeNodeStore::with_nodes([
            test_node("worker-1"),
            test_node("worker-2"),
        ]));
        let status = Arc::new(ControllerStatus::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let controller = TrustController::new(
            test_config(),
            host_source,
            event_source,
            nodes.clone(),
            Arc::clone(&status),
        );
        let task = tokio::spawn(controller.run(stop_rx));

        // Initial listings: one untrusted host and a reboot from long ago
        host_tx.send(watcher::Event::Init).unwrap();
        host_tx.send(watcher::Event::InitApply(hosts(false))).unwrap();
        host_tx.send(watcher::Event::InitDone).unwrap();
        event_tx.send(watcher::Event::Init).unwrap();
        event_tx
            .send(watcher::Event::InitApply(reboot_event(
                "worker-2",
                Utc::now() - ChronoDuration::days(1),
            )))
            .unwrap();
        event_tx.send(watcher::Event::InitDone).unwrap();

        eventually("readiness", || status.is_ready()).await;
        eventually("untrusted taints", || nodes.taints("worker-1").len() == 2).await;
        let labels = nodes.node("worker-1").unwrap().labels().clone();
        assert_eq!(labels["isecl.trusted"], "false");

        // A fresh reboot taints the node pending attestation
        event_tx
            .send(watcher::Event::Apply(reboot_event("worker-2", Utc::now())))
            .unwrap();
        eventually("reboot taints", || nodes.taints("worker-2").len() == 2).await;

        // Attestation passes and the taints go away
        host_tx.send(watcher::Event::Apply(hosts(true))).unwrap();
        eventually("taint removal", || nodes.taints("worker-1").is_empty()).await;

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("controller should stop")
            .unwrap()
            .unwrap();
        assert!(!status.is_ready());
    }

    #[tokio::test]
    async fn test_stop_before_sync_returns_cleanly() {
        let host_source = ChannelSource::<HostAttributes>::new();
        let _host_tx = host_source.sender();
        let event_source = ChannelSource::<Event>::new();
        let _event_tx = event_source.sender();
        let status = Arc::new(ControllerStatus::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let controller = TrustController::new(
            test_config(),
            host_source,
            event_source,
            Arc::new(FakeNodeStore::default()),
            Arc::clone(&status),
        );
        let task = tokio::spawn(controller.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("controller should stop")
            .unwrap()
            .unwrap();
        assert!(!status.is_ready());
    }
}
