//! In-memory provider
//!
//! [`MockProvider`] "runs" pods by recording them and reporting them as
//! running. Status changes are delivered asynchronously: every change goes
//! into a channel drained by a task started in `notify_pods`, so provider
//! calls never wait on the controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, Node, NodeAddress, NodeCondition,
    NodeStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vnode_common::kube_utils::{meta_key, object_key};
use vnode_common::{Error, Result};
use vnode_node::{NodeProvider, NodeStatusCallback};
use vnode_pod::status::{self, PHASE_RUNNING};
use vnode_pod::{PodLifecycleHandler, PodNotifier, PodStatusCallback};

/// Capacity and address the mock node advertises
#[derive(Clone, Debug)]
pub struct MockConfig {
    /// CPU capacity
    pub cpu: String,
    /// Memory capacity
    pub memory: String,
    /// Maximum number of pods
    pub pods: String,
    /// Internal IP reported in the node addresses
    pub internal_ip: Option<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            cpu: "20".to_string(),
            memory: "100Gi".to_string(),
            pods: "20".to_string(),
            internal_ip: std::env::var("VKUBELET_POD_IP").ok(),
        }
    }
}

/// Provider that keeps pods in memory
pub struct MockProvider {
    config: MockConfig,
    pods: Mutex<HashMap<String, Pod>>,
    pod_events: mpsc::UnboundedSender<Pod>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Pod>>>,
    node_callback: Mutex<Option<NodeStatusCallback>>,
    pings: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl MockProvider {
    /// Provider advertising `config`
    pub fn new(config: MockConfig) -> Arc<Self> {
        let (pod_events, pending) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            pods: Mutex::new(HashMap::new()),
            pod_events,
            pending: Mutex::new(Some(pending)),
            node_callback: Mutex::new(None),
            pings: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Store a pod as if it had been running before startup
    pub fn insert(&self, pod: Pod) {
        self.pods.lock().insert(meta_key(&pod.metadata), pod);
    }

    /// Provider's copy of a pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.lock().get(&object_key(namespace, name)).cloned()
    }

    /// Replace a pod's phase and report the change
    ///
    /// Returns false when the pod is not running here.
    pub fn set_phase(&self, namespace: &str, name: &str, phase: &str) -> bool {
        let updated = {
            let mut pods = self.pods.lock();
            let Some(pod) = pods.get_mut(&object_key(namespace, name)) else {
                return false;
            };
            pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
            pod.clone()
        };
        self.notify(updated);
        true
    }

    /// Push a new node body to the node controller
    ///
    /// Returns false until the node controller has registered.
    pub fn update_node_status(&self, node: Node) -> bool {
        let callback = self.node_callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(node);
                true
            }
            None => false,
        }
    }

    /// Number of pings answered
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of successful `create_pod` calls
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful `update_pod` calls
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of successful `delete_pod` calls
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn notify(&self, pod: Pod) {
        // Only fails once the receiver is dropped, after shutdown
        let _ = self.pod_events.send(pod);
    }
}

fn running_status(pod: &Pod) -> PodStatus {
    let now = Time(Utc::now());
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    let condition = |kind: &str| PodCondition {
        type_: kind.to_string(),
        status: "True".to_string(),
        last_transition_time: Some(now.clone()),
        ..Default::default()
    };
    PodStatus {
        phase: Some(PHASE_RUNNING.to_string()),
        host_ip: std::env::var("VKUBELET_POD_IP").ok(),
        pod_ip: Some("127.0.0.1".to_string()),
        start_time: Some(now.clone()),
        conditions: Some(vec![
            condition("PodScheduled"),
            condition("Initialized"),
            condition("Ready"),
        ]),
        container_statuses: Some(
            containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    ready: true,
                    started: Some(true),
                    restart_count: 0,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(now.clone()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn node_condition(kind: &str, status: &str, reason: &str, message: &str) -> NodeCondition {
    let now = Time(Utc::now());
    NodeCondition {
        type_: kind.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

#[async_trait]
impl NodeProvider for MockProvider {
    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn notify_node_status(&self, _ctx: CancellationToken, callback: NodeStatusCallback) {
        *self.node_callback.lock() = Some(callback);
    }

    fn configure_node(&self, node: &mut Node) {
        let status = node.status.get_or_insert_with(NodeStatus::default);
        let resources = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.config.cpu.clone())),
            ("memory".to_string(), Quantity(self.config.memory.clone())),
            ("pods".to_string(), Quantity(self.config.pods.clone())),
        ]);
        status.capacity = Some(resources.clone());
        status.allocatable = Some(resources);
        if status.conditions.is_none() {
            status.conditions = Some(vec![
                node_condition("Ready", "True", "KubeletReady", "kubelet is ready."),
                node_condition(
                    "OutOfDisk",
                    "False",
                    "KubeletHasSufficientDisk",
                    "kubelet has sufficient disk space available",
                ),
                node_condition(
                    "MemoryPressure",
                    "False",
                    "KubeletHasSufficientMemory",
                    "kubelet has sufficient memory available",
                ),
                node_condition(
                    "DiskPressure",
                    "False",
                    "KubeletHasNoDiskPressure",
                    "kubelet has no disk pressure",
                ),
                node_condition(
                    "NetworkUnavailable",
                    "False",
                    "RouteCreated",
                    "RouteController created a route",
                ),
            ]);
        }
        if let Some(ip) = &self.config.internal_ip {
            status.addresses = Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.clone(),
            }]);
        }
    }
}

#[async_trait]
impl PodLifecycleHandler for MockProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let key = meta_key(&pod.metadata);
        debug!(key, "Creating pod");
        let mut running = pod.clone();
        running.status = Some(running_status(pod));
        self.pods.lock().insert(key, running.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.notify(running);
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        let key = meta_key(&pod.metadata);
        debug!(key, "Updating pod");
        let updated = {
            let mut pods = self.pods.lock();
            let existing = pods.get(&key).ok_or_else(|| Error::not_found("pod", &key))?;
            let mut updated = pod.clone();
            updated.status = existing.status.clone();
            pods.insert(key, updated.clone());
            updated
        };
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.notify(updated);
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let key = meta_key(&pod.metadata);
        debug!(key, "Deleting pod");
        let mut removed = self
            .pods
            .lock()
            .remove(&key)
            .ok_or_else(|| Error::not_found("pod", &key))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);

        removed.metadata = pod.metadata.clone();
        status::mark_terminated(&mut removed, Utc::now());
        self.notify(removed);
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        Ok(self.pod(namespace, name).and_then(|p| p.status))
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.lock().values().cloned().collect())
    }

    fn as_notifier(&self) -> Option<&dyn PodNotifier> {
        Some(self)
    }
}

impl PodNotifier for MockProvider {
    fn notify_pods(&self, ctx: CancellationToken, callback: PodStatusCallback) {
        let Some(mut pending) = self.pending.lock().take() else {
            debug!("Pod notifier already registered");
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    pod = pending.recv() => match pod {
                        Some(pod) => callback(pod),
                        None => break,
                    },
                }
            }
            info!("Mock pod notifier stopped");
        });
    }
}
