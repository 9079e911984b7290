//! In-memory test doubles for the pod controller
//!
//! [`FakePodApi`] stores pods, serves watches (initial list followed by live
//! events), honors resourceVersion and UID preconditions, and turns graceful
//! deletes into deletion timestamps the way the API server does.
//! [`FakeClusterResources`] holds ConfigMaps, Secrets and Services for
//! environment resolution. [`TestPodProvider`] runs pods in memory, counts
//! every call and can push status when built with a notifier.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodSpec,
    PodStatus, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::runtime::watcher::{self, Event};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use vnode_common::kube_utils::{
    api_error, object_key, meta_key, REASON_ALREADY_EXISTS, REASON_CONFLICT, REASON_NOT_FOUND,
};
use vnode_common::{Error, Result};

use crate::client::{PodClient, PodEventStream};
use crate::env::ClusterResources;
use crate::provider::{PodLifecycleHandler, PodNotifier, PodStatusCallback};
use crate::status::{self, PHASE_PENDING, PHASE_RUNNING};

/// Node name used by [`test_pod`]
pub const TEST_NODE: &str = "testnode";

/// Pending pod bound to [`TEST_NODE`] with a single `app` container
pub fn test_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(TEST_NODE.to_string()),
            enable_service_links: Some(false),
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(PHASE_PENDING.to_string()),
            ..Default::default()
        }),
    }
}

fn not_found(kind: &str, key: &str) -> Error {
    Error::from(api_error(
        404,
        REASON_NOT_FOUND,
        &format!("{} \"{}\" not found", kind, key),
    ))
}

fn conflict(message: &str) -> Error {
    Error::from(api_error(409, REASON_CONFLICT, message))
}

// =============================================================================
// Pods
// =============================================================================

type WatchItem = std::result::Result<Event<Pod>, watcher::Error>;

#[derive(Default)]
struct PodApiStore {
    pods: HashMap<String, Pod>,
    version: u64,
    watchers: Vec<mpsc::UnboundedSender<WatchItem>>,
    fail_status: Vec<Error>,
    removed: Vec<String>,
}

impl PodApiStore {
    fn broadcast(&mut self, event: Event<Pod>) {
        self.watchers.retain(|w| w.send(Ok(event.clone())).is_ok());
    }

    fn store(&mut self, mut pod: Pod) -> Pod {
        self.version += 1;
        pod.metadata.resource_version = Some(self.version.to_string());
        self.pods.insert(meta_key(&pod.metadata), pod.clone());
        self.broadcast(Event::Apply(pod.clone()));
        pod
    }

    fn remove(&mut self, key: &str) -> Option<Pod> {
        let pod = self.pods.remove(key)?;
        self.removed.push(key.to_string());
        self.broadcast(Event::Delete(pod.clone()));
        Some(pod)
    }
}

/// In-memory pod API
#[derive(Default)]
pub struct FakePodApi {
    store: Mutex<PodApiStore>,
    status_updates: AtomicU64,
}

impl FakePodApi {
    /// Empty API with no pods
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a pod as a user would; fills in UID and creation time
    pub fn create(&self, mut pod: Pod) -> Result<Pod> {
        let key = meta_key(&pod.metadata);
        let mut store = self.store.lock();
        if store.pods.contains_key(&key) {
            return Err(Error::from(api_error(
                409,
                REASON_ALREADY_EXISTS,
                &format!("pods \"{}\" already exists", key),
            )));
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        pod.metadata.uid.get_or_insert_with(|| format!("uid-{}", name));
        pod.metadata
            .creation_timestamp
            .get_or_insert_with(|| Time(Utc::now()));
        Ok(store.store(pod))
    }

    /// Replace a pod as another actor would
    pub fn update(&self, pod: Pod) -> Result<Pod> {
        let key = meta_key(&pod.metadata);
        let mut store = self.store.lock();
        if !store.pods.contains_key(&key) {
            return Err(not_found("pods", &key));
        }
        Ok(store.store(pod))
    }

    /// Request a graceful delete as `kubectl delete --grace-period` would
    pub fn request_delete(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<()> {
        let mut store = self.store.lock();
        graceful_delete(&mut store, &object_key(namespace, name), grace_period_seconds)
    }

    /// Current stored pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.store.lock().pods.get(&object_key(namespace, name)).cloned()
    }

    /// Keys of pods removed from storage, in order
    pub fn removed(&self) -> Vec<String> {
        self.store.lock().removed.clone()
    }

    /// Number of successful status writes
    pub fn status_updates(&self) -> u64 {
        self.status_updates.load(Ordering::SeqCst)
    }

    /// Make the next status write fail with `err`; queued errors are used in order
    pub fn fail_next_status_update(&self, err: Error) {
        self.store.lock().fail_status.push(err);
    }

    /// End every open watch stream, as a dropped connection would
    pub fn close_watches(&self) {
        self.store.lock().watchers.clear();
    }
}

fn graceful_delete(store: &mut PodApiStore, key: &str, grace_period_seconds: i64) -> Result<()> {
    let mut pod = store
        .pods
        .get(key)
        .cloned()
        .ok_or_else(|| not_found("pods", key))?;
    if grace_period_seconds <= 0 {
        store.remove(key);
        return Ok(());
    }
    if pod.metadata.deletion_timestamp.is_none() {
        pod.metadata.deletion_timestamp = Some(Time(
            Utc::now() + chrono::Duration::seconds(grace_period_seconds),
        ));
        pod.metadata.deletion_grace_period_seconds = Some(grace_period_seconds);
        store.store(pod);
    }
    Ok(())
}

#[async_trait]
impl PodClient for FakePodApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pod(namespace, name)
            .ok_or_else(|| not_found("pods", &object_key(namespace, name)))
    }

    async fn update_status(&self, pod: &Pod) -> Result<Pod> {
        let key = meta_key(&pod.metadata);
        let mut store = self.store.lock();
        if !store.fail_status.is_empty() {
            return Err(store.fail_status.remove(0));
        }
        let mut current = store
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("pods", &key))?;
        if let Some(expected) = pod
            .metadata
            .resource_version
            .as_deref()
            .filter(|rv| *rv != "0")
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(conflict(
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }
        }
        current.status = pod.status.clone();
        let stored = store.store(current);
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
        uid: Option<String>,
    ) -> Result<()> {
        let key = object_key(namespace, name);
        let mut store = self.store.lock();
        let current = store.pods.get(&key).ok_or_else(|| not_found("pods", &key))?;
        if let Some(uid) = uid {
            if current.metadata.uid.as_deref() != Some(uid.as_str()) {
                return Err(conflict(&format!(
                    "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                    uid,
                    current.metadata.uid.as_deref().unwrap_or_default()
                )));
            }
        }
        let grace = grace_period_seconds.map_or(30, i64::from);
        graceful_delete(&mut store, &key, grace)
    }

    fn watch(&self) -> PodEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = self.store.lock();
        let _ = tx.send(Ok(Event::Init));
        for pod in store.pods.values() {
            let _ = tx.send(Ok(Event::InitApply(pod.clone())));
        }
        let _ = tx.send(Ok(Event::InitDone));
        store.watchers.push(tx);
        UnboundedReceiverStream::new(rx).boxed()
    }
}

// =============================================================================
// Cluster resources
// =============================================================================

/// In-memory ConfigMaps, Secrets and Services
#[derive(Default)]
pub struct FakeClusterResources {
    config_maps: Mutex<HashMap<String, ConfigMap>>,
    secrets: Mutex<HashMap<String, Secret>>,
    services: Mutex<Vec<Service>>,
}

impl FakeClusterResources {
    /// No objects
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a ConfigMap with string data
    pub fn insert_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let mut cm = ConfigMap::default();
        cm.metadata.namespace = Some(namespace.to_string());
        cm.metadata.name = Some(name.to_string());
        cm.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        self.config_maps.lock().insert(object_key(namespace, name), cm);
    }

    /// Store a Secret; values are stored as bytes
    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some(namespace.to_string());
        secret.metadata.name = Some(name.to_string());
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        );
        self.secrets.lock().insert(object_key(namespace, name), secret);
    }

    /// Store a ClusterIP service with one unnamed TCP port
    pub fn insert_service(&self, namespace: &str, name: &str, cluster_ip: &str, port: i32) {
        let mut service = Service::default();
        service.metadata.namespace = Some(namespace.to_string());
        service.metadata.name = Some(name.to_string());
        service.spec = Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ports: Some(vec![ServicePort {
                port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        self.services.lock().push(service);
    }
}

#[async_trait]
impl ClusterResources for FakeClusterResources {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_maps.lock().get(&object_key(namespace, name)).cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.lock().get(&object_key(namespace, name)).cloned())
    }

    async fn services(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(self
            .services
            .lock()
            .iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Scriptable pod provider
///
/// Created pods start running immediately. Built with
/// [`TestPodProvider::with_notifier`] it pushes every status change through
/// the registered callback; otherwise it relies on being polled.
#[derive(Default)]
pub struct TestPodProvider {
    pods: Mutex<HashMap<String, Pod>>,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    fail_creates: Mutex<Option<String>>,
    notifier: bool,
    callback: Mutex<Option<PodStatusCallback>>,
}

impl TestPodProvider {
    /// Provider without push notifications
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider that pushes status changes
    pub fn with_notifier() -> Arc<Self> {
        Arc::new(Self {
            notifier: true,
            ..Default::default()
        })
    }

    /// Store a pod as if the provider were already running it
    pub fn insert(&self, pod: Pod) {
        self.pods.lock().insert(meta_key(&pod.metadata), pod);
    }

    /// Provider's copy of a pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.lock().get(&object_key(namespace, name)).cloned()
    }

    /// Make creates fail with `message`, or succeed again with `None`
    pub fn fail_creates(&self, message: Option<&str>) {
        *self.fail_creates.lock() = message.map(str::to_string);
    }

    /// Change a pod's phase and push it
    ///
    /// Returns false when the provider does not run the pod.
    pub fn set_phase(&self, namespace: &str, name: &str, phase: &str) -> bool {
        let updated = {
            let mut pods = self.pods.lock();
            let Some(pod) = pods.get_mut(&object_key(namespace, name)) else {
                return false;
            };
            pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
            pod.clone()
        };
        self.push(updated);
        true
    }

    /// True once the controller registered its status callback
    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Number of `create_pod` calls
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of `update_pod` calls
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of successful `delete_pod` calls
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of `get_pods` calls
    pub fn lists(&self) -> u64 {
        self.lists.load(Ordering::SeqCst)
    }

    fn push(&self, pod: Pod) {
        if !self.notifier {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(pod);
        }
    }
}

fn running_status(pod: &Pod) -> PodStatus {
    let now = Time(Utc::now());
    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    PodStatus {
        phase: Some(PHASE_RUNNING.to_string()),
        start_time: Some(now.clone()),
        container_statuses: Some(
            containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    ready: true,
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

#[async_trait]
impl PodLifecycleHandler for TestPodProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_creates.lock().clone() {
            return Err(Error::provider(message));
        }
        let mut running = pod.clone();
        running.status = Some(running_status(pod));
        self.insert(running.clone());
        self.push(running);
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut pods = self.pods.lock();
        let key = meta_key(&pod.metadata);
        let existing = pods.get(&key).ok_or_else(|| Error::not_found("pod", &key))?;
        let mut updated = pod.clone();
        updated.status = existing.status.clone();
        pods.insert(key, updated);
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let key = meta_key(&pod.metadata);
        let existing = self
            .pods
            .lock()
            .remove(&key)
            .ok_or_else(|| Error::not_found("pod", &key))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);

        let mut gone = pod.clone();
        gone.status = existing.status;
        status::mark_terminated(&mut gone, Utc::now());
        self.push(gone);
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        Ok(self.pod(namespace, name).and_then(|p| p.status))
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.pods.lock().values().cloned().collect())
    }

    fn as_notifier(&self) -> Option<&dyn PodNotifier> {
        if self.notifier {
            Some(self)
        } else {
            None
        }
    }
}

impl PodNotifier for TestPodProvider {
    fn notify_pods(&self, _ctx: CancellationToken, callback: PodStatusCallback) {
        *self.callback.lock() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_pod_api_watch_replays_then_streams() {
        let api = FakePodApi::new();
        api.create(test_pod("default", "a")).unwrap();
        let mut stream = api.watch();

        assert!(matches!(stream.next().await, Some(Ok(Event::Init))));
        assert!(matches!(stream.next().await, Some(Ok(Event::InitApply(_)))));
        assert!(matches!(stream.next().await, Some(Ok(Event::InitDone))));

        api.create(test_pod("default", "b")).unwrap();
        match stream.next().await {
            Some(Ok(Event::Apply(pod))) => assert_eq!(pod.metadata.name.as_deref(), Some("b")),
            other => panic!("unexpected event: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn test_fake_pod_api_preconditions() {
        let api = FakePodApi::new();
        let created = api.create(test_pod("default", "a")).unwrap();

        let mut stale = created.clone();
        stale.metadata.resource_version = Some("999".to_string());
        assert!(api.update_status(&stale).await.unwrap_err().is_conflict());

        stale.metadata.resource_version = Some("0".to_string());
        assert!(api.update_status(&stale).await.is_ok());

        let err = api
            .delete("default", "a", Some(0), Some("other-uid".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        api.delete("default", "a", Some(0), Some("uid-a".to_string()))
            .await
            .unwrap();
        assert_eq!(api.removed(), vec!["default/a"]);
    }

    #[tokio::test]
    async fn test_graceful_delete_sets_deletion_timestamp() {
        let api = FakePodApi::new();
        api.create(test_pod("default", "a")).unwrap();
        api.request_delete("default", "a", 30).unwrap();

        let pod = api.pod("default", "a").unwrap();
        assert!(pod.metadata.deletion_timestamp.is_some());
        assert_eq!(pod.metadata.deletion_grace_period_seconds, Some(30));
        assert!(api.removed().is_empty());
    }
}
