//! Tests for lifecycle-event driven node tainting

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use k8s_openapi::api::core::v1::{Event, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher;

    use crate::config::{ControllerPolicy, RetrySettings};
    use crate::controller::cache::WatchCache;
    use crate::controller::node_events::{
        event_time, taint_pending_attestation, NodeEventFilter, NodeEventHandler,
        NodeEventReconciler, NodeLifecycle, REBOOTED_REASON, REGISTERED_NODE_REASON,
    };
    use crate::controller::node_mutator::{NodeChange, NodeMutator};
    use crate::controller::queue::WorkQueue;
    use crate::controller::taints::remove_untrusted_taints;
    use crate::controller::testing::{test_node, FakeNodeStore};
    use crate::controller::worker::{Reconcile, Worker};

    fn lifecycle_policy() -> Arc<ControllerPolicy> {
        Arc::new(ControllerPolicy {
            taint_registered_nodes: true,
            taint_rebooted_nodes: true,
            ..Default::default()
        })
    }

    fn node_event(name: &str, node: &str, reason: &str, at: DateTime<Utc>) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            last_timestamp: Some(Time(at)),
            ..Default::default()
        }
    }

    fn fast_queue() -> WorkQueue {
        WorkQueue::new(
            "nodeevents",
            RetrySettings {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        )
    }

    fn with_version(mut event: Event, uid: &str, version: &str, count: i32) -> Event {
        event.metadata.uid = Some(uid.to_string());
        event.metadata.resource_version = Some(version.to_string());
        event.count = Some(count);
        event
    }

    fn started_an_hour_ago() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::hours(1)
    }

    #[test]
    fn test_filter_accepts_fresh_lifecycle_events() {
        let filter = NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago());
        let now = Utc::now();

        assert_eq!(
            filter.qualifies(&node_event("e1", "node-1", REBOOTED_REASON, now)),
            Some(("node-1".to_string(), NodeLifecycle::Rebooted))
        );
        assert_eq!(
            filter.qualifies(&node_event("e2", "node-2", REGISTERED_NODE_REASON, now)),
            Some(("node-2".to_string(), NodeLifecycle::Registered))
        );
    }

    #[test]
    fn test_filter_rejects_events_from_before_startup() {
        let started = Utc::now();
        let filter = NodeEventFilter::new(lifecycle_policy(), started);
        let stale = node_event("e1", "node-1", REBOOTED_REASON, started - ChronoDuration::minutes(5));

        assert_eq!(filter.qualifies(&stale), None);
    }

    #[test]
    fn test_filter_respects_policy_flags() {
        let policy = Arc::new(ControllerPolicy {
            taint_rebooted_nodes: true,
            ..Default::default()
        });
        let filter = NodeEventFilter::new(policy, started_an_hour_ago());
        let now = Utc::now();

        assert!(filter
            .qualifies(&node_event("e1", "node-1", REBOOTED_REASON, now))
            .is_some());
        assert_eq!(
            filter.qualifies(&node_event("e2", "node-1", REGISTERED_NODE_REASON, now)),
            None
        );
    }

    #[test]
    fn test_filter_ignores_other_objects_and_reasons() {
        let filter = NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago());
        let now = Utc::now();

        let mut pod_event = node_event("e1", "pod-1", REBOOTED_REASON, now);
        pod_event.involved_object.kind = Some("Pod".to_string());
        assert_eq!(filter.qualifies(&pod_event), None);

        assert_eq!(
            filter.qualifies(&node_event("e2", "node-1", "NodeReady", now)),
            None
        );

        let mut anonymous = node_event("e3", "", REBOOTED_REASON, now);
        anonymous.involved_object.name = None;
        assert_eq!(filter.qualifies(&anonymous), None);
    }

    #[test]
    fn test_event_time_falls_back_to_first_timestamp() {
        let at = Utc::now();
        let mut event = node_event("e1", "node-1", REBOOTED_REASON, at);
        event.last_timestamp = None;
        assert_eq!(event_time(&event), None);

        event.first_timestamp = Some(Time(at));
        assert_eq!(event_time(&event), Some(at));
    }

    #[test]
    fn test_taint_pending_attestation_skips_control_plane() {
        let mut node = test_node("cp-1");
        node.metadata.labels = Some(BTreeMap::from([(
            "node-role.kubernetes.io/master".to_string(),
            String::new(),
        )]));

        assert_eq!(
            taint_pending_attestation(&mut node).unwrap(),
            NodeChange::Unchanged
        );
        assert!(node.spec.is_none());
    }

    #[tokio::test]
    async fn test_repeated_reboot_event_taints_once() {
        let store = Arc::new(FakeNodeStore::with_nodes([test_node("node-1")]));
        let filter = Arc::new(NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago()));
        let reconciler =
            NodeEventReconciler::new(filter, Arc::new(NodeMutator::new(store.clone())));
        let event = Arc::new(node_event("e1", "node-1", REBOOTED_REASON, Utc::now()));

        reconciler.reconcile(Arc::clone(&event)).await.unwrap();
        reconciler.reconcile(event).await.unwrap();

        assert_eq!(store.taints("node-1").len(), 2);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_event_for_missing_node_is_not_an_error() {
        let store = Arc::new(FakeNodeStore::default());
        let filter = Arc::new(NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago()));
        let reconciler =
            NodeEventReconciler::new(filter, Arc::new(NodeMutator::new(store.clone())));

        reconciler
            .reconcile(Arc::new(node_event("e1", "gone", REGISTERED_NODE_REASON, Utc::now())))
            .await
            .unwrap();
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_failed_taint_write_is_retried() {
        let store = Arc::new(FakeNodeStore::with_nodes([test_node("node-1")]));
        store.fail_writes(2);
        let filter = Arc::new(NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago()));
        let queue = WorkQueue::new(
            "nodeevents",
            RetrySettings {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        );

        let mut cache = WatchCache::<Event>::new("Event");
        let handler = NodeEventHandler::new(Arc::clone(&filter), queue.clone());
        cache.apply(
            watcher::Event::Apply(node_event("e1", "node-1", REBOOTED_REASON, Utc::now())),
            &handler,
        );
        assert_eq!(queue.len(), 1);

        let reconciler = Arc::new(NodeEventReconciler::new(
            filter,
            Arc::new(NodeMutator::new(store.clone())),
        ));
        let handles = Worker::new(queue.clone(), cache.store(), reconciler).spawn(1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.taints("node-1").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("taints should be applied after retries");
        assert_eq!(store.writes(), 1);

        queue.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_relist_does_not_retaint_attested_node() {
        let store = Arc::new(FakeNodeStore::with_nodes([test_node("node-1")]));
        let filter = Arc::new(NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago()));
        let mutator = Arc::new(NodeMutator::new(store.clone()));
        let reconciler = NodeEventReconciler::new(Arc::clone(&filter), Arc::clone(&mutator));
        let queue = fast_queue();
        let handler = NodeEventHandler::new(Arc::clone(&filter), queue.clone());
        let mut cache = WatchCache::<Event>::new("Event");
        let reboot = with_version(
            node_event("e1", "node-1", REBOOTED_REASON, Utc::now()),
            "uid-1",
            "7",
            1,
        );

        cache.apply(watcher::Event::Apply(reboot.clone()), &handler);
        let key = queue.dequeue().await.unwrap();
        let cached = cache.store().get(&key).unwrap();
        reconciler.reconcile(cached).await.unwrap();
        queue.done(&key);
        assert_eq!(store.taints("node-1").len(), 2);

        // Attestation clears the node
        mutator
            .with_node("node-1", |node| {
                Ok(NodeChange::from_changed(remove_untrusted_taints(node)))
            })
            .await
            .unwrap();
        assert!(store.taints("node-1").is_empty());

        // The watch relists after an error and replays the same event
        cache.apply(watcher::Event::Init, &handler);
        cache.apply(watcher::Event::InitApply(reboot.clone()), &handler);
        cache.apply(watcher::Event::InitDone, &handler);
        assert!(queue.is_empty());

        // A stale queue entry for the same occurrence is also a no-op
        reconciler.reconcile(Arc::new(reboot)).await.unwrap();
        assert!(store.taints("node-1").is_empty());
    }

    #[tokio::test]
    async fn test_repeated_reboot_after_attestation_taints_again() {
        let store = Arc::new(FakeNodeStore::with_nodes([test_node("node-1")]));
        let filter = Arc::new(NodeEventFilter::new(lifecycle_policy(), started_an_hour_ago()));
        let mutator = Arc::new(NodeMutator::new(store.clone()));
        let reconciler = NodeEventReconciler::new(Arc::clone(&filter), Arc::clone(&mutator));
        let queue = fast_queue();
        let handler = NodeEventHandler::new(Arc::clone(&filter), queue.clone());
        let mut cache = WatchCache::<Event>::new("Event");
        let first = Utc::now() - ChronoDuration::minutes(10);

        let reboot = with_version(
            node_event("e1", "node-1", REBOOTED_REASON, first),
            "uid-1",
            "7",
            1,
        );
        cache.apply(watcher::Event::Apply(reboot), &handler);
        let key = queue.dequeue().await.unwrap();
        reconciler
            .reconcile(cache.store().get(&key).unwrap())
            .await
            .unwrap();
        queue.done(&key);
        mutator
            .with_node("node-1", |node| {
                Ok(NodeChange::from_changed(remove_untrusted_taints(node)))
            })
            .await
            .unwrap();

        // The kubelet reports a second reboot on the same Event object
        let again = with_version(
            node_event("e1", "node-1", REBOOTED_REASON, Utc::now()),
            "uid-1",
            "9",
            2,
        );
        cache.apply(watcher::Event::Apply(again), &handler);
        let key = queue.dequeue().await.unwrap();
        reconciler
            .reconcile(cache.store().get(&key).unwrap())
            .await
            .unwrap();
        queue.done(&key);

        assert_eq!(store.taints("node-1").len(), 2);
    }
}
