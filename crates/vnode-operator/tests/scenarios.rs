//! End-to-end scenarios for a virtual node
//!
//! Both controllers run together against in-memory fakes of the API server,
//! on a paused clock so grace periods and heartbeat cadence are exact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, Pod};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vnode_common::kube_utils::api_error;
use vnode_common::{Error, Result};
use vnode_node::testing::{FakeLeaseApi, FakeNodeApi, TestNodeProvider};
use vnode_node::{NodeController, NodeProvider, NodeTemplate};
use vnode_operator::{MockConfig, MockProvider, ReadinessProbe, VirtualNode};
use vnode_pod::status::{self, PHASE_RUNNING, PHASE_SUCCEEDED};
use vnode_pod::testing::{test_pod, FakeClusterResources, FakePodApi, TestPodProvider, TEST_NODE};
use vnode_pod::{PodClient, PodController, PodEventStream, PodLifecycleHandler};
use vnode_queue::Monitor;

// =============================================================================
// Harness
// =============================================================================

fn condition(kind: &str) -> NodeCondition {
    NodeCondition {
        type_: kind.to_string(),
        status: "True".to_string(),
        ..Default::default()
    }
}

fn node_with(conditions: &[&str]) -> Node {
    let mut node = NodeTemplate::new(TEST_NODE, "mock").build();
    node.status.get_or_insert_with(NodeStatus::default).conditions =
        Some(conditions.iter().map(|c| condition(c)).collect());
    node
}

fn condition_types(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.iter().map(|c| c.type_.clone()).collect())
        .unwrap_or_default()
}

fn phase_of(api: &FakePodApi, name: &str) -> Option<String> {
    api.pod("default", name)
        .and_then(|p| status::phase(&p).map(str::to_string))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Fake cluster plus the in-memory provider
struct Cluster {
    nodes: Arc<FakeNodeApi>,
    leases: Arc<FakeLeaseApi>,
    pods: Arc<FakePodApi>,
    provider: Arc<MockProvider>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            nodes: FakeNodeApi::new(),
            leases: FakeLeaseApi::new(),
            pods: FakePodApi::new(),
            provider: MockProvider::new(MockConfig::default()),
        }
    }

    fn virtual_node(&self, node: Node) -> VirtualNode {
        let node = NodeController::builder(self.provider.clone(), node, self.nodes.clone())
            .lease_client(self.leases.clone())
            .build()
            .unwrap();
        let pods = PodController::builder(
            self.provider.clone(),
            self.pods.clone(),
            FakeClusterResources::new(),
        )
        .build()
        .unwrap();
        VirtualNode::new(node, pods).startup_timeout(Some(Duration::from_secs(30)))
    }
}

struct Harness {
    vnode: Arc<VirtualNode>,
    ctx: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    fn spawn(vnode: VirtualNode) -> Self {
        let vnode = Arc::new(vnode);
        let ctx = CancellationToken::new();
        let task = {
            let (vnode, ctx) = (vnode.clone(), ctx.clone());
            tokio::spawn(async move { vnode.run(ctx).await })
        };
        Self { vnode, ctx, task }
    }

    async fn start(vnode: VirtualNode) -> Self {
        let harness = Self::spawn(vnode);
        harness.vnode.ready().cancelled().await;
        harness
    }

    async fn stop(self) -> Result<()> {
        self.ctx.cancel();
        self.task.await.unwrap()
    }
}

/// Pod API whose watch never delivers the initial list
struct StalledPodApi;

#[async_trait]
impl PodClient for StalledPodApi {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Pod> {
        Err(Error::not_found("pod", name))
    }

    async fn update_status(&self, pod: &Pod) -> Result<Pod> {
        Ok(pod.clone())
    }

    async fn delete(
        &self,
        _namespace: &str,
        _name: &str,
        _grace_period_seconds: Option<u32>,
        _uid: Option<String>,
    ) -> Result<()> {
        Ok(())
    }

    fn watch(&self) -> PodEventStream {
        futures::stream::pending().boxed()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

/// Story: a pod is created, runs, and is removed after its grace period
#[tokio::test(start_paused = true)]
async fn story_create_run_delete() {
    let cluster = Cluster::new();
    let harness = Harness::start(cluster.virtual_node(node_with(&["Ready"]))).await;

    let mut pod = test_pod("default", "my-pod");
    pod.metadata.uid = Some("4f20ff31-7775-11e8-893d-000c29a24ab0".to_string());
    cluster.pods.create(pod).unwrap();
    settle().await;

    assert_eq!(cluster.provider.creates(), 1);
    assert_eq!(phase_of(&cluster.pods, "my-pod").as_deref(), Some(PHASE_RUNNING));

    cluster.pods.request_delete("default", "my-pod", 30).unwrap();
    settle().await;
    assert_eq!(cluster.provider.deletes(), 1);
    assert!(cluster.pods.pod("default", "my-pod").is_some());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(cluster.pods.pod("default", "my-pod").is_none());
    assert_eq!(cluster.pods.removed(), vec!["default/my-pod"]);
    assert_eq!(cluster.provider.deletes(), 1);
    assert_eq!(cluster.provider.creates(), 1);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_terminal_pod_is_never_dispatched() {
    let cluster = Cluster::new();
    let harness = Harness::start(cluster.virtual_node(node_with(&["Ready"]))).await;

    let mut pod = test_pod("default", "finished");
    pod.status.get_or_insert_with(Default::default).phase = Some(PHASE_SUCCEEDED.to_string());
    let created = cluster.pods.create(pod).unwrap();
    settle().await;

    let provider = &cluster.provider;
    assert_eq!(provider.creates() + provider.updates() + provider.deletes(), 0);
    assert!(provider.get_pods().await.unwrap().is_empty());
    assert_eq!(cluster.pods.pod("default", "finished"), Some(created));
    assert_eq!(cluster.pods.status_updates(), 0);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dangling_provider_pod_is_deleted_at_startup() {
    let cluster = Cluster::new();
    cluster.provider.insert(test_pod("default", "ghost"));

    let harness = Harness::start(cluster.virtual_node(node_with(&["Ready"]))).await;
    assert_eq!(cluster.provider.deletes(), 1);
    assert!(cluster.provider.pod("default", "ghost").is_none());

    settle().await;
    assert_eq!(cluster.provider.deletes(), 1);
    harness.stop().await.unwrap();
}

/// Story: conditions and annotations added by someone else survive our patches
#[tokio::test(start_paused = true)]
async fn story_manual_conditions_are_preserved() {
    let cluster = Cluster::new();
    let harness = Harness::start(cluster.virtual_node(node_with(&["BaseCondition"]))).await;
    assert_eq!(
        condition_types(&cluster.nodes.node(TEST_NODE).unwrap()),
        vec!["BaseCondition"]
    );

    cluster
        .nodes
        .external_patch(
            TEST_NODE,
            &json!({
                "metadata": {"annotations": {"manuallyAddedAnnotation": "value"}},
                "status": {"conditions": [
                    {"type": "ManuallyAddedCondition", "status": "True"}
                ]}
            }),
        )
        .unwrap();

    assert!(cluster
        .provider
        .update_node_status(node_with(&["BaseCondition", "NewCondition"])));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = cluster.nodes.node(TEST_NODE).unwrap();
    let mut types = condition_types(&stored);
    types.sort();
    assert_eq!(
        types,
        vec!["BaseCondition", "ManuallyAddedCondition", "NewCondition"]
    );
    let annotations = stored.metadata.annotations.unwrap_or_default();
    assert_eq!(
        annotations.get("manuallyAddedAnnotation").map(String::as_str),
        Some("value")
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ping_cadence_holds_under_status_pushes() {
    let ping_interval = Duration::from_millis(10);
    let node_provider = TestNodeProvider::new();
    let nodes = FakeNodeApi::new();
    let node = NodeController::builder(node_provider.clone(), node_with(&["Ready"]), nodes.clone())
        .ping_interval(ping_interval)
        .status_interval(Duration::from_millis(60))
        .build()
        .unwrap();
    let pods = PodController::builder(
        TestPodProvider::with_notifier(),
        FakePodApi::new(),
        FakeClusterResources::new(),
    )
    .build()
    .unwrap();
    let harness = Harness::start(VirtualNode::new(node, pods)).await;

    for _ in 0..10 {
        assert!(node_provider.push(node_with(&["Ready"])));
        tokio::time::sleep(ping_interval).await;
    }
    tokio::time::sleep(ping_interval * 3).await;

    let times = node_provider.ping_times();
    assert!(times.len() >= 10, "only {} pings", times.len());
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap <= ping_interval * 5 / 2,
            "pings {:?} apart, interval {:?}",
            gap,
            ping_interval
        );
    }
    assert!(nodes.patches() >= 10);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_monitor_wakes_every_subscriber() {
    let monitor = Monitor::new();
    let mut subscriptions: Vec<_> = (0..10).map(|_| monitor.subscribe()).collect();
    let signals: Vec<_> = subscriptions.iter().map(|s| s.ready()).collect();
    assert!(signals.iter().all(|s| !s.is_cancelled()));

    monitor.set(1);

    for (signal, subscription) in signals.iter().zip(subscriptions.iter_mut()) {
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("every subscriber is woken");
        let seen = subscription.value();
        assert_eq!(seen.value, Some(1));
        assert_eq!(seen.version, 1);
    }
}

// =============================================================================
// Startup and readiness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_readiness_tracks_controllers() {
    let cluster = Cluster::new();
    let vnode = cluster.virtual_node(node_with(&["Ready"]));
    assert!(vnode.check().is_err());

    let harness = Harness::start(vnode).await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(harness.vnode.check().is_ok());
    assert!(cluster.provider.pings() >= 1);
    assert_eq!(cluster.nodes.creates(), 1);
    assert!(cluster.leases.lease(TEST_NODE).is_some());

    let vnode = harness.vnode.clone();
    harness.stop().await.unwrap();
    assert!(vnode.node_controller().done().is_cancelled());
    assert!(vnode.pod_controller().done().is_cancelled());
    assert!(vnode.check().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_node_registration_failure_fails_run() {
    let cluster = Cluster::new();
    cluster.nodes.insert(node_with(&["Ready"]));
    cluster
        .nodes
        .fail_next_patch(Error::from(api_error(500, "InternalError", "etcd unavailable")));
    let harness = Harness::spawn(cluster.virtual_node(node_with(&["Ready"])));

    let err = harness.task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("etcd unavailable"), "{}", err);
    assert!(!harness.vnode.ready().is_cancelled());
    assert_eq!(cluster.provider.creates(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pod_controller_startup_times_out() {
    let provider = MockProvider::new(MockConfig::default());
    let node = NodeController::builder(provider.clone(), node_with(&["Ready"]), FakeNodeApi::new())
        .build()
        .unwrap();
    let pods = PodController::builder(
        provider.clone() as Arc<dyn PodLifecycleHandler>,
        Arc::new(StalledPodApi),
        FakeClusterResources::new(),
    )
    .build()
    .unwrap();
    let vnode = VirtualNode::new(node, pods).startup_timeout(Some(Duration::from_secs(5)));
    let harness = Harness::spawn(vnode);

    let err = harness.task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{}", err);
    assert!(harness.vnode.node_controller().done().is_cancelled());
    assert!(harness.vnode.pod_controller().done().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_startup_is_clean() {
    let provider = MockProvider::new(MockConfig::default());
    let node = NodeController::builder(
        provider.clone() as Arc<dyn NodeProvider>,
        node_with(&["Ready"]),
        FakeNodeApi::new(),
    )
    .build()
    .unwrap();
    let pods = PodController::builder(provider, Arc::new(StalledPodApi), FakeClusterResources::new())
        .build()
        .unwrap();
    let harness = Harness::spawn(VirtualNode::new(node, pods));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!harness.vnode.ready().is_cancelled());
    harness.stop().await.unwrap();
}
