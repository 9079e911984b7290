//! Pod informer: a local cache fed by a watch stream
//!
//! Watch events are turned into add/update/delete notifications delivered
//! sequentially to a single handler. A relist (after the initial list or a
//! watch restart) is diffed against the cache so pods that disappeared while
//! the watch was down are reported as deleted.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vnode_common::kube_utils::{meta_key, object_key};
use vnode_common::{Error, Result};

use crate::client::PodEventStream;

/// Extra predicate applied to every pod before it reaches the cache
pub type PodEventFilter = Arc<dyn Fn(&Pod) -> bool + Send + Sync>;

/// Change notification for one pod
#[derive(Clone, Debug)]
pub enum PodEvent {
    /// Pod seen for the first time
    Add(Arc<Pod>),
    /// New version of a cached pod
    Update {
        /// Previously cached version
        old: Arc<Pod>,
        /// Current version
        new: Arc<Pod>,
    },
    /// Pod removed
    Delete(Arc<Pod>),
}

/// Read side of the informer cache
#[derive(Clone, Default)]
pub struct PodStore {
    pods: Arc<DashMap<String, Arc<Pod>>>,
}

impl PodStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached pod by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.get_key(&object_key(namespace, name))
    }

    /// Cached pod by `namespace/name` key
    pub fn get_key(&self, key: &str) -> Option<Arc<Pod>> {
        self.pods.get(key).map(|p| p.value().clone())
    }

    /// Every cached pod
    pub fn list(&self) -> Vec<Arc<Pod>> {
        self.pods.iter().map(|p| p.value().clone()).collect()
    }

    /// Number of cached pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    fn insert(&self, key: String, pod: Arc<Pod>) -> Option<Arc<Pod>> {
        self.pods.insert(key, pod)
    }

    fn remove(&self, key: &str) -> Option<Arc<Pod>> {
        self.pods.remove(key).map(|(_, p)| p)
    }

    fn keys(&self) -> Vec<String> {
        self.pods.iter().map(|p| p.key().clone()).collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl PodStore {
    /// Insert a pod directly, bypassing the watch
    pub fn insert_for_test(&self, pod: Pod) {
        self.insert(meta_key(&pod.metadata), Arc::new(pod));
    }

    /// Remove a pod directly, bypassing the watch
    pub fn remove_for_test(&self, key: &str) {
        self.remove(key);
    }
}

/// Keeps a [`PodStore`] in sync with a watch stream
pub struct PodInformer {
    store: PodStore,
    filter: Option<PodEventFilter>,
    synced: CancellationToken,
    relist: Option<HashSet<String>>,
}

impl PodInformer {
    /// Informer writing into `store`
    pub fn new(store: PodStore, filter: Option<PodEventFilter>) -> Self {
        Self {
            store,
            filter,
            synced: CancellationToken::new(),
            relist: None,
        }
    }

    /// Fires once the initial list has been applied
    pub fn synced(&self) -> CancellationToken {
        self.synced.clone()
    }

    /// Consume `stream` until `ctx` is cancelled
    ///
    /// The watch is expected to run forever; a stream that ends leaves the
    /// cache stale and is reported as an error.
    pub async fn run<F>(
        mut self,
        ctx: CancellationToken,
        mut stream: PodEventStream,
        mut on_event: F,
    ) -> Result<()>
    where
        F: FnMut(PodEvent),
    {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event, &mut on_event),
                    Some(Err(e)) => warn!(error = %e, "Pod watch error, will retry"),
                    None => {
                        warn!("Pod watch stream ended");
                        return Err(Error::internal_with_context(
                            "informer",
                            "pod watch stream ended",
                        ));
                    }
                },
            }
        }
        debug!("Pod informer stopped");
        Ok(())
    }

    fn accepts(&self, pod: &Pod) -> bool {
        self.filter.as_ref().map_or(true, |f| f(pod))
    }

    fn apply<F: FnMut(PodEvent)>(&mut self, event: Event<Pod>, on_event: &mut F) {
        match event {
            Event::Init => {
                self.relist = Some(HashSet::new());
            }
            Event::InitApply(pod) => {
                if !self.accepts(&pod) {
                    return;
                }
                let key = meta_key(&pod.metadata);
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(key.clone());
                }
                self.upsert(key, pod, on_event);
            }
            Event::InitDone => {
                if let Some(seen) = self.relist.take() {
                    for key in self.store.keys() {
                        if seen.contains(&key) {
                            continue;
                        }
                        if let Some(gone) = self.store.remove(&key) {
                            debug!(key, "Pod vanished while the watch was down");
                            on_event(PodEvent::Delete(gone));
                        }
                    }
                }
                if !self.synced.is_cancelled() {
                    info!(pods = self.store.len(), "Pod informer synced");
                    self.synced.cancel();
                }
            }
            Event::Apply(pod) => {
                let key = meta_key(&pod.metadata);
                if self.accepts(&pod) {
                    self.upsert(key, pod, on_event);
                } else if let Some(gone) = self.store.remove(&key) {
                    debug!(key, "Pod no longer passes the filter");
                    on_event(PodEvent::Delete(gone));
                }
            }
            Event::Delete(pod) => {
                if let Some(gone) = self.store.remove(&meta_key(&pod.metadata)) {
                    on_event(PodEvent::Delete(gone));
                }
            }
        }
    }

    fn upsert<F: FnMut(PodEvent)>(&self, key: String, pod: Pod, on_event: &mut F) {
        let new = Arc::new(pod);
        match self.store.insert(key, new.clone()) {
            None => on_event(PodEvent::Add(new)),
            Some(old) if old.metadata.resource_version == new.metadata.resource_version => {}
            Some(old) => on_event(PodEvent::Update { old, new }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type Item = std::result::Result<Event<Pod>, kube::runtime::watcher::Error>;

    fn pod(name: &str, rv: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.name = Some(name.to_string());
        pod.metadata.resource_version = Some(rv.to_string());
        pod
    }

    fn describe(event: &PodEvent) -> String {
        let name = |p: &Pod| p.metadata.name.clone().unwrap_or_default();
        match event {
            PodEvent::Add(p) => format!("add {}", name(p)),
            PodEvent::Update { new, .. } => format!("update {}", name(new)),
            PodEvent::Delete(p) => format!("delete {}", name(p)),
        }
    }

    async fn drive(
        filter: Option<PodEventFilter>,
        events: Vec<Event<Pod>>,
    ) -> (PodStore, Vec<String>, bool) {
        let (tx, rx) = mpsc::unbounded_channel::<Item>();
        for event in events {
            tx.send(Ok(event)).unwrap();
        }
        drop(tx);

        let store = PodStore::new();
        let informer = PodInformer::new(store.clone(), filter);
        let synced = informer.synced();
        let mut seen = Vec::new();
        let result = informer
            .run(
                CancellationToken::new(),
                UnboundedReceiverStream::new(rx).boxed(),
                |e| seen.push(describe(&e)),
            )
            .await;
        assert!(result.is_err(), "a closed watch must be reported");
        (store, seen, synced.is_cancelled())
    }

    #[tokio::test]
    async fn test_initial_list_then_watch_events() {
        let (store, seen, synced) = drive(
            None,
            vec![
                Event::Init,
                Event::InitApply(pod("a", "1")),
                Event::InitDone,
                Event::Apply(pod("b", "2")),
                Event::Apply(pod("a", "3")),
                Event::Delete(pod("b", "4")),
            ],
        )
        .await;
        assert!(synced);
        assert_eq!(seen, vec!["add a", "add b", "update a", "delete b"]);
        assert_eq!(store.len(), 1);
        assert!(store.get("default", "a").is_some());
    }

    #[tokio::test]
    async fn test_relist_reports_vanished_pods() {
        let (store, seen, _) = drive(
            None,
            vec![
                Event::Init,
                Event::InitApply(pod("a", "1")),
                Event::InitApply(pod("b", "1")),
                Event::InitDone,
                Event::Init,
                Event::InitApply(pod("a", "1")),
                Event::InitDone,
            ],
        )
        .await;
        assert_eq!(seen, vec!["add a", "add b", "delete b"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_drops_pods_before_cache() {
        let filter: PodEventFilter = Arc::new(|p: &Pod| p.metadata.name.as_deref() != Some("skip"));
        let (store, seen, _) = drive(
            Some(filter),
            vec![
                Event::Init,
                Event::InitApply(pod("keep", "1")),
                Event::InitApply(pod("skip", "1")),
                Event::InitDone,
            ],
        )
        .await;
        assert_eq!(seen, vec!["add keep"]);
        assert!(store.get("default", "skip").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_resource_version_is_not_an_update() {
        let (_, seen, _) = drive(
            None,
            vec![
                Event::Init,
                Event::InitApply(pod("a", "1")),
                Event::InitDone,
                Event::Apply(pod("a", "1")),
            ],
        )
        .await;
        assert_eq!(seen, vec!["add a"]);
    }

    #[tokio::test]
    async fn test_pod_leaving_the_filter_is_deleted() {
        let filter: PodEventFilter =
            Arc::new(|p: &Pod| p.metadata.labels.as_ref().map_or(true, |l| !l.contains_key("skip")));
        let mut relabeled = pod("a", "2");
        relabeled.metadata.labels = Some([("skip".to_string(), "true".to_string())].into());
        let (store, seen, _) = drive(
            Some(filter),
            vec![
                Event::Init,
                Event::InitApply(pod("a", "1")),
                Event::InitDone,
                Event::Apply(relabeled),
            ],
        )
        .await;
        assert_eq!(seen, vec!["add a", "delete a"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_unknown_pod_is_silent() {
        let filter: PodEventFilter = Arc::new(|p: &Pod| p.metadata.name.as_deref() != Some("skip"));
        let (_, seen, _) = drive(
            Some(filter),
            vec![
                Event::Init,
                Event::InitDone,
                Event::Apply(pod("skip", "1")),
                Event::Delete(pod("skip", "2")),
                Event::Delete(pod("never-seen", "3")),
            ],
        )
        .await;
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_cleanly() {
        let (tx, rx) = mpsc::unbounded_channel::<Item>();
        tx.send(Ok(Event::Init)).unwrap();
        tx.send(Ok(Event::InitDone)).unwrap();

        let informer = PodInformer::new(PodStore::new(), None);
        let synced = informer.synced();
        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                informer
                    .run(ctx, UnboundedReceiverStream::new(rx).boxed(), |_| {})
                    .await
            }
        });
        synced.cancelled().await;
        ctx.cancel();
        assert!(task.await.unwrap().is_ok());
        drop(tx);
    }
}
