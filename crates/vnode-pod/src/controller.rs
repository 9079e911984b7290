//! Pod controller
//!
//! Informer events feed three queues. Keys on the sync and status queues are
//! `namespace/name`; the delete queue uses `namespace/name/uid` so a
//! force-delete never hits a recreated pod. The queues guarantee one handler
//! per key at a time, which is what makes the per-pod logic below race-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::Resource;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vnode_common::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use vnode_common::kube_utils::{meta_key, split_key, split_uid_key, uid_key};
use vnode_common::metrics::{record_pod_operation, Outcome, PodOperation, POD_STATUS_UPDATES};
use vnode_common::retry::{retry_if, RetryConfig};
use vnode_common::{Error, Result};
use vnode_queue::{Queue, RateLimiter, RetryFn};

use crate::client::PodClient;
use crate::compare;
use crate::env::{ClusterResources, EnvResolver};
use crate::informer::{PodEvent, PodEventFilter, PodInformer, PodStore};
use crate::known::KnownPods;
use crate::provider::{PodLifecycleHandler, PodStatusCallback};
use crate::status::{self, REASON_PROVIDER_FAILED};
use crate::sync_provider::{SyncProviderWrapper, DEFAULT_POLL_INTERVAL};
use crate::DEFAULT_WORKERS;

/// Attempts for one status write when the API server reports a conflict
const STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// The controller's work queues
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodQueue {
    /// Reconcile API pods into the provider
    SyncFromKubernetes,
    /// Force-remove pods from the API server once the provider is done
    DeleteFromKubernetes,
    /// Write provider-reported status back to the API server
    SyncStatusFromProvider,
}

impl PodQueue {
    /// Queue name used in logs and metrics
    pub fn name(self) -> &'static str {
        match self {
            Self::SyncFromKubernetes => "syncPodsFromKubernetes",
            Self::DeleteFromKubernetes => "deletePodsFromKubernetes",
            Self::SyncStatusFromProvider => "syncPodStatusFromProvider",
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`PodController`]
pub struct PodControllerBuilder {
    provider: Arc<dyn PodLifecycleHandler>,
    pods: Arc<dyn PodClient>,
    resources: Arc<dyn ClusterResources>,
    events: Arc<dyn EventPublisher>,
    workers: usize,
    filter: Option<PodEventFilter>,
    rate_limiters: HashMap<PodQueue, Arc<dyn RateLimiter>>,
    retries: HashMap<PodQueue, RetryFn>,
    poll_interval: Duration,
}

impl PodControllerBuilder {
    /// Publish Kubernetes events through `events`
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Handlers per queue
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Only handle pods accepted by `filter`
    pub fn filter(mut self, filter: PodEventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Override one queue's rate limiter
    pub fn rate_limiter(mut self, queue: PodQueue, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiters.insert(queue, limiter);
        self
    }

    /// Override one queue's retry decider
    pub fn retry(mut self, queue: PodQueue, retry: RetryFn) -> Self {
        self.retries.insert(queue, retry);
        self
    }

    /// Poll interval used when the provider cannot push status
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate and build the controller
    pub fn build(self) -> Result<PodController> {
        if self.workers == 0 {
            return Err(Error::invalid_input("pod controller needs at least one worker"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_input("poll interval must be positive"));
        }

        let queue = |kind: PodQueue| {
            let mut builder = Queue::builder(kind.name());
            if let Some(limiter) = self.rate_limiters.get(&kind) {
                builder = builder.rate_limiter(limiter.clone());
            }
            if let Some(retry) = self.retries.get(&kind) {
                builder = builder.retry(retry.clone());
            }
            builder.build()
        };
        let sync_queue = queue(PodQueue::SyncFromKubernetes);
        let delete_queue = queue(PodQueue::DeleteFromKubernetes);
        let status_queue = queue(PodQueue::SyncStatusFromProvider);

        let store = PodStore::new();
        let pushes = self.provider.as_notifier().is_some();
        let (provider, poller) = if pushes {
            (self.provider, None)
        } else {
            let wrapper = Arc::new(SyncProviderWrapper::new(self.provider, store.clone()));
            (wrapper.clone() as Arc<dyn PodLifecycleHandler>, Some(wrapper))
        };

        Ok(PodController {
            inner: Arc::new(Inner {
                provider,
                pods: self.pods,
                resolver: EnvResolver::new(self.resources, self.events.clone()),
                events: self.events,
                store,
                known: KnownPods::new(),
                sync_queue,
                delete_queue,
                status_queue,
            }),
            filter: self.filter,
            poller,
            poll_interval: self.poll_interval,
            workers: self.workers,
            started: AtomicBool::new(false),
            ready: CancellationToken::new(),
            done: CancellationToken::new(),
            err: Mutex::new(None),
        })
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Reconciles the pods bound to this node with the provider
pub struct PodController {
    inner: Arc<Inner>,
    filter: Option<PodEventFilter>,
    poller: Option<Arc<SyncProviderWrapper>>,
    poll_interval: Duration,
    workers: usize,
    started: AtomicBool,
    ready: CancellationToken,
    done: CancellationToken,
    err: Mutex<Option<String>>,
}

impl PodController {
    /// Start building a controller
    pub fn builder(
        provider: Arc<dyn PodLifecycleHandler>,
        pods: Arc<dyn PodClient>,
        resources: Arc<dyn ClusterResources>,
    ) -> PodControllerBuilder {
        PodControllerBuilder {
            provider,
            pods,
            resources,
            events: Arc::new(NoopEventPublisher),
            workers: DEFAULT_WORKERS,
            filter: None,
            rate_limiters: HashMap::new(),
            retries: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Fires once the cache is synced and dangling pods are reaped
    pub fn ready(&self) -> CancellationToken {
        self.ready.clone()
    }

    /// Fires when [`PodController::run`] has returned
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Final error, available once [`PodController::done`] has fired
    pub fn err(&self) -> Option<String> {
        self.err.lock().clone()
    }

    /// Informer cache of the pods bound to this node
    pub fn store(&self) -> PodStore {
        self.inner.store.clone()
    }

    /// Sync the cache, reap dangling pods, then run the queues until `ctx`
    /// is cancelled
    ///
    /// Returns `Ok(())` on cancellation. Can only be called once.
    #[instrument(skip_all)]
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("pod controller already started"));
        }
        let result = self.run_inner(&ctx).await;
        if let Err(e) = &result {
            error!(error = %e, "Pod controller failed");
            *self.err.lock() = Some(e.to_string());
        }
        self.done.cancel();
        result
    }

    async fn run_inner(&self, ctx: &CancellationToken) -> Result<()> {
        let tasks = ctx.child_token();

        let informer = PodInformer::new(self.inner.store.clone(), self.filter.clone());
        let synced = informer.synced();
        let stream = self.inner.pods.watch();
        let mut informer_task = {
            let (inner, tasks) = (self.inner.clone(), tasks.clone());
            tokio::spawn(async move {
                let result = informer
                    .run(tasks.clone(), stream, move |event| inner.on_pod_event(event))
                    .await;
                if result.is_err() {
                    tasks.cancel();
                }
                result
            })
        };

        let synced = tokio::select! {
            biased;
            _ = synced.cancelled() => true,
            _ = ctx.cancelled() => false,
            _ = &mut informer_task => {
                return Err(Error::internal_with_context(
                    "informer",
                    "pod watch ended before the initial list completed",
                ));
            }
        };
        if !synced {
            tasks.cancel();
            let _ = informer_task.await;
            return Ok(());
        }

        let callback: PodStatusCallback = {
            let inner = self.inner.clone();
            Arc::new(move |pod| inner.on_provider_pod(pod))
        };
        match self.inner.provider.as_notifier() {
            Some(notifier) => notifier.notify_pods(tasks.clone(), callback),
            None => warn!("Provider cannot report pod status"),
        }
        let poller_task = self.poller.clone().map(|poller| {
            let (tasks, interval) = (tasks.clone(), self.poll_interval);
            tokio::spawn(async move { poller.run(tasks, interval).await })
        });

        self.inner.delete_dangling(&tasks, self.workers).await;

        info!(pods = self.inner.store.len(), workers = self.workers, "Pod controller ready");
        self.ready.cancel();

        let sync = {
            let inner = self.inner.clone();
            self.inner.sync_queue.run(&tasks, self.workers, move |key| {
                let inner = inner.clone();
                async move { inner.sync_pod(key).await }
            })
        };
        let delete = {
            let inner = self.inner.clone();
            self.inner.delete_queue.run(&tasks, self.workers, move |key| {
                let inner = inner.clone();
                async move { inner.force_delete(key).await }
            })
        };
        let status = {
            let inner = self.inner.clone();
            self.inner.status_queue.run(&tasks, self.workers, move |key| {
                let inner = inner.clone();
                async move { inner.sync_status(key).await }
            })
        };
        tokio::join!(sync, delete, status);

        tasks.cancel();
        let result = match informer_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::panicked(format!("pod informer: {}", e))),
        };
        if let Some(task) = poller_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Pod status poller task failed");
            }
        }
        info!("Pod controller stopped");
        result
    }
}

/// Grace period from object metadata, clamped to `0..=u32::MAX`
fn grace_seconds(grace: i64) -> u32 {
    u32::try_from(grace.max(0)).unwrap_or(u32::MAX)
}

/// State shared by the informer handler, the provider callback and the
/// queue handlers
struct Inner {
    provider: Arc<dyn PodLifecycleHandler>,
    pods: Arc<dyn PodClient>,
    events: Arc<dyn EventPublisher>,
    resolver: EnvResolver,
    store: PodStore,
    known: KnownPods,
    sync_queue: Arc<Queue>,
    delete_queue: Arc<Queue>,
    status_queue: Arc<Queue>,
}

impl Inner {
    // =========================================================================
    // Event dispatch
    // =========================================================================

    fn on_pod_event(&self, event: PodEvent) {
        match event {
            PodEvent::Add(pod) => {
                let key = meta_key(&pod.metadata);
                self.known.track(&key);
                self.sync_queue.enqueue(&key);
            }
            PodEvent::Update { old, new } => {
                let key = meta_key(&new.metadata);
                if compare::spec_changed(&old, &new) {
                    self.sync_queue.enqueue(&key);
                }
                let Some(record) = self.known.get(&key) else {
                    return;
                };
                let stale = {
                    let record = record.lock();
                    record.status_suppressed
                        && record
                            .last_provider_pod
                            .as_ref()
                            .is_some_and(|p| p.status != new.status)
                };
                if stale {
                    self.status_queue.enqueue(&key);
                }
            }
            PodEvent::Delete(pod) => {
                let key = meta_key(&pod.metadata);
                self.known.remove(&key);
                if let (Some(ns), Some(name), Some(uid)) = (
                    pod.metadata.namespace.as_deref(),
                    pod.metadata.name.as_deref(),
                    pod.metadata.uid.as_deref(),
                ) {
                    self.delete_queue.forget(&uid_key(ns, name, uid));
                }
                self.sync_queue.enqueue(&key);
            }
        }
    }

    fn on_provider_pod(&self, pod: Pod) {
        let key = meta_key(&pod.metadata);
        let Some(record) = self.known.get(&key) else {
            debug!(key, "Ignoring status for a pod the informer does not know");
            return;
        };
        record.lock().last_provider_pod = Some(pod);
        self.status_queue.enqueue(&key);
    }

    // =========================================================================
    // syncPodsFromKubernetes
    // =========================================================================

    #[instrument(skip_all, fields(key = %key))]
    async fn sync_pod(&self, key: String) -> Result<()> {
        let (namespace, name) = split_key(&key)?;
        let Some(pod) = self.store.get_key(&key) else {
            return self.delete_orphan(&namespace, &name).await;
        };

        if pod.metadata.deletion_timestamp.is_some() && !status::has_running_containers(&pod) {
            debug!("Terminating pod has no running containers, force deleting");
            self.enqueue_force_delete(&pod, Duration::ZERO);
            return Ok(());
        }

        let Some(record) = self.known.get(&key) else {
            return Ok(());
        };
        let unchanged = record
            .lock()
            .last_reconciled
            .as_ref()
            .is_some_and(|last| compare::effectively_equal(last, &pod));
        if unchanged {
            debug!("Pod unchanged since last reconcile");
            return Ok(());
        }

        if pod.metadata.deletion_timestamp.is_some() {
            self.delete_in_provider(&pod).await?;
            let grace = grace_seconds(pod.metadata.deletion_grace_period_seconds.unwrap_or(0));
            self.enqueue_force_delete(&pod, Duration::from_secs(grace.into()));
            return Ok(());
        }

        if status::is_terminal(&pod) {
            debug!(phase = ?status::phase(&pod), "Pod is in a terminal phase, skipping");
            return Ok(());
        }

        let resolved = self.resolver.resolve(&pod).await?;
        if let Err(e) = self.create_or_update(&namespace, &name, &resolved).await {
            self.record_provider_failure(&pod, &e).await;
            return Err(e);
        }
        record.lock().last_reconciled = Some(pod);
        Ok(())
    }

    async fn create_or_update(&self, namespace: &str, name: &str, pod: &Pod) -> Result<()> {
        let existing = match self.provider.get_pod(namespace, name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(existing) => {
                if !compare::needs_provider_update(pod, &existing) {
                    debug!("Provider pod is up to date");
                    return Ok(());
                }
                let result = self.provider.update_pod(pod).await;
                record_pod_operation(PodOperation::Update, Outcome::of(&result));
                result?;
                info!("Updated pod in provider");
            }
            None => {
                let result = self.provider.create_pod(pod).await;
                record_pod_operation(PodOperation::Create, Outcome::of(&result));
                result?;
                info!("Created pod in provider");
            }
        }
        Ok(())
    }

    async fn record_provider_failure(&self, pod: &Pod, err: &Error) {
        warn!(error = %err, "Provider rejected pod");
        let mut failed = pod.clone();
        status::mark_provider_failed(&mut failed, &err.to_string());
        failed.metadata.resource_version = Some("0".to_string());
        if let Err(e) = self.pods.update_status(&failed).await {
            warn!(error = %e, "Failed to record provider failure in pod status");
        }
        self.events
            .publish(
                &pod.object_ref(&()),
                EventType::Warning,
                reasons::PROVIDER_FAILED,
                actions::SYNC_POD,
                Some(err.to_string()),
            )
            .await;
    }

    async fn delete_orphan(&self, namespace: &str, name: &str) -> Result<()> {
        match self.provider.get_pod(namespace, name).await {
            Ok(Some(pod)) => self.delete_in_provider(&pod).await,
            Ok(None) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_in_provider(&self, pod: &Pod) -> Result<()> {
        let result = self.provider.delete_pod(pod).await;
        match result {
            Ok(()) => {
                record_pod_operation(PodOperation::Delete, Outcome::Success);
                info!("Deleted pod in provider");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Pod already gone from provider");
                Ok(())
            }
            Err(e) => {
                record_pod_operation(PodOperation::Delete, Outcome::Error);
                Err(e)
            }
        }
    }

    fn enqueue_force_delete(&self, pod: &Pod, delay: Duration) {
        let meta = &pod.metadata;
        let Some(uid) = meta.uid.as_deref() else {
            warn!("Pod has no UID, cannot schedule force delete");
            return;
        };
        let key = uid_key(
            meta.namespace.as_deref().unwrap_or("default"),
            meta.name.as_deref().unwrap_or_default(),
            uid,
        );
        if delay.is_zero() {
            self.delete_queue.enqueue_immediate(&key);
        } else {
            self.delete_queue.enqueue_after(&key, delay);
        }
    }

    // =========================================================================
    // deletePodsFromKubernetes
    // =========================================================================

    #[instrument(skip_all, fields(key = %key))]
    async fn force_delete(&self, key: String) -> Result<()> {
        let (namespace, name, uid) = split_uid_key(&key)?;
        if let Some(cached) = self.store.get(&namespace, &name) {
            if cached.metadata.uid.as_deref() != Some(uid.as_str()) {
                debug!("Pod was recreated, not force deleting");
                return Ok(());
            }
        }

        match self.pods.delete(&namespace, &name, Some(0), Some(uid)).await {
            Ok(()) => {
                info!("Force deleted pod from the API server");
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(error = %e, "Pod already gone or replaced");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // syncPodStatusFromProvider
    // =========================================================================

    #[instrument(skip_all, fields(key = %key))]
    async fn sync_status(&self, key: String) -> Result<()> {
        let Some(record) = self.known.get(&key) else {
            return Ok(());
        };
        let Some(provider_pod) = record.lock().last_provider_pod.clone() else {
            return Ok(());
        };
        let Some(api_pod) = self.store.get_key(&key) else {
            return Ok(());
        };
        let (namespace, name) = split_key(&key)?;

        if provider_pod
            .metadata
            .uid
            .as_deref()
            .is_some_and(|uid| api_pod.metadata.uid.as_deref() != Some(uid))
        {
            debug!("Provider status belongs to an earlier pod with the same name");
            return Ok(());
        }

        if provider_pod.metadata.deletion_timestamp.is_some()
            && api_pod.metadata.deletion_timestamp.is_none()
        {
            let grace = provider_pod
                .metadata
                .deletion_grace_period_seconds
                .map(grace_seconds);
            info!(grace_seconds = ?grace, "Provider deleted pod, deleting it from the API server");
            return match self
                .pods
                .delete(&namespace, &name, grace, api_pod.metadata.uid.clone())
                .await
            {
                Err(e) if e.is_not_found() || e.is_conflict() => Ok(()),
                result => result,
            };
        }

        if status::is_terminal(&api_pod) || status::reason(&api_pod) == Some(REASON_PROVIDER_FAILED) {
            debug!(phase = ?status::phase(&api_pod), "Pod status is final, not overwriting it");
            record.lock().status_suppressed = true;
            return Ok(());
        }
        record.lock().status_suppressed = false;

        if provider_pod.status == api_pod.status {
            return Ok(());
        }

        let attempt = AtomicU32::new(0);
        let result = retry_if(
            &RetryConfig::immediate(STATUS_UPDATE_ATTEMPTS),
            "update pod status",
            Error::is_conflict,
            || {
                let first = attempt.fetch_add(1, Ordering::SeqCst) == 0;
                let pods = self.pods.clone();
                let cached = api_pod.clone();
                let status = provider_pod.status.clone();
                let (namespace, name) = (namespace.clone(), name.clone());
                async move {
                    let mut target = if first {
                        (*cached).clone()
                    } else {
                        pods.get(&namespace, &name).await?
                    };
                    target.status = status;
                    target.metadata.resource_version = Some("0".to_string());
                    pods.update_status(&target).await
                }
            },
        )
        .await;
        POD_STATUS_UPDATES.add(1, &Outcome::of(&result).labels());

        match result {
            Ok(_) => {
                debug!(phase = ?status::phase(&provider_pod), "Updated pod status");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Dangling pods
    // =========================================================================

    /// Delete provider pods the API server does not know about
    async fn delete_dangling(self: &Arc<Self>, ctx: &CancellationToken, workers: usize) {
        let pods = match self.provider.get_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list provider pods, skipping dangling pod cleanup");
                return;
            }
        };

        let limit = Arc::new(Semaphore::new(workers.max(1)));
        let mut deletes = JoinSet::new();
        for pod in pods {
            if self.store.get_key(&meta_key(&pod.metadata)).is_some() {
                continue;
            }
            let permit = tokio::select! {
                _ = ctx.cancelled() => break,
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let inner = self.clone();
            deletes.spawn(async move {
                let _permit = permit;
                inner.delete_dangling_pod(pod).await;
            });
        }
        while let Some(res) = deletes.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Dangling pod delete task failed");
            }
        }
    }

    async fn delete_dangling_pod(&self, pod: Pod) {
        let key = meta_key(&pod.metadata);
        let result = self.provider.delete_pod(&pod).await;
        record_pod_operation(PodOperation::Delete, Outcome::of(&result));
        match result {
            Ok(()) => {
                info!(key, "Deleted dangling pod from provider");
                self.events
                    .publish(
                        &pod.object_ref(&()),
                        EventType::Normal,
                        reasons::DANGLING_POD_DELETED,
                        actions::DELETE_POD,
                        Some(format!("Pod {} is not known to the API server", key)),
                    )
                    .await;
            }
            Err(e) => warn!(key, error = %e, "Failed to delete dangling pod"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockPodClient;
    use crate::status::{PHASE_FAILED, PHASE_RUNNING, PHASE_SUCCEEDED};
    use crate::testing::{test_pod, FakeClusterResources, FakePodApi, TestPodProvider};
    use futures::StreamExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use vnode_common::events::RecordingEventPublisher;

    struct Harness {
        events: Arc<RecordingEventPublisher>,
        ctx: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        async fn start(api: Arc<FakePodApi>, provider: Arc<TestPodProvider>) -> Self {
            let events = Arc::new(RecordingEventPublisher::default());
            let controller = PodController::builder(provider.clone(), api.clone(), FakeClusterResources::new())
                .events(events.clone())
                .workers(2)
                .poll_interval(Duration::from_secs(1))
                .build()
                .unwrap();
            let controller = Arc::new(controller);
            let ctx = CancellationToken::new();
            let task = {
                let (controller, ctx) = (controller.clone(), ctx.clone());
                tokio::spawn(async move { controller.run(ctx).await })
            };
            controller.ready().cancelled().await;
            Self {
                events,
                ctx,
                task,
            }
        }

        async fn stop(self) -> Result<()> {
            self.ctx.cancel();
            self.task.await.unwrap()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    fn phase_of(api: &FakePodApi, name: &str) -> Option<String> {
        api.pod("default", name)
            .and_then(|p| status::phase(&p).map(str::to_string))
    }

    #[test]
    fn test_grace_seconds_clamps() {
        assert_eq!(grace_seconds(-5), 0);
        assert_eq!(grace_seconds(30), 30);
        assert_eq!(grace_seconds(i64::MAX), u32::MAX);
    }

    #[test]
    fn test_builder_validation() {
        let build = |workers, poll| {
            PodController::builder(TestPodProvider::new(), FakePodApi::new(), FakeClusterResources::new())
                .workers(workers)
                .poll_interval(poll)
                .build()
        };
        assert!(build(0, Duration::from_secs(1)).is_err());
        assert!(build(1, Duration::ZERO).is_err());
        assert!(build(1, Duration::from_secs(1)).is_ok());
    }

    /// Story: a pod is created, runs, and is removed after its grace period
    #[tokio::test(start_paused = true)]
    async fn story_create_run_delete() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "my-pod")).unwrap();
        settle().await;
        assert_eq!(provider.creates(), 1);
        assert_eq!(phase_of(&api, "my-pod").as_deref(), Some(PHASE_RUNNING));

        api.request_delete("default", "my-pod", 30).unwrap();
        settle().await;
        assert_eq!(provider.deletes(), 1);
        assert!(api.pod("default", "my-pod").is_some(), "removed before grace period");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(api.pod("default", "my-pod").is_none());
        assert_eq!(provider.deletes(), 1);
        assert_eq!(provider.creates(), 1);

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_pod_is_left_alone() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        let mut pod = test_pod("default", "finished");
        pod.status.as_mut().unwrap().phase = Some(PHASE_SUCCEEDED.to_string());
        let created = api.create(pod).unwrap();
        settle().await;

        assert_eq!(provider.creates() + provider.updates() + provider.deletes(), 0);
        assert_eq!(api.status_updates(), 0);
        assert_eq!(api.pod("default", "finished"), Some(created));

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dangling_pod_is_reaped_at_startup() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        provider.insert(test_pod("default", "ghost"));
        api.create(test_pod("default", "kept")).unwrap();
        provider.insert(test_pod("default", "kept"));

        let harness = Harness::start(api.clone(), provider.clone()).await;
        assert_eq!(provider.deletes(), 1);
        assert!(provider.pod("default", "ghost").is_none());
        assert!(provider.pod("default", "kept").is_some());
        assert_eq!(harness.events.reasons(), vec![reasons::DANGLING_POD_DELETED]);

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_is_recorded_in_status() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        provider.fail_creates(Some("no capacity"));
        let harness = Harness::start(api.clone(), provider.clone()).await;

        let mut pod = test_pod("default", "web");
        pod.spec.as_mut().unwrap().restart_policy = Some("Never".to_string());
        api.create(pod).unwrap();
        settle().await;

        let stored = api.pod("default", "web").unwrap();
        assert_eq!(status::phase(&stored), Some(PHASE_FAILED));
        assert_eq!(status::reason(&stored), Some(REASON_PROVIDER_FAILED));
        assert!(stored
            .status
            .unwrap()
            .message
            .unwrap()
            .contains("no capacity"));
        assert!(harness
            .events
            .reasons()
            .contains(&reasons::PROVIDER_FAILED.to_string()));

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spec_change_updates_provider() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "web")).unwrap();
        settle().await;

        let mut pod = api.pod("default", "web").unwrap();
        pod.spec.as_mut().unwrap().containers[0].image = Some("nginx:1.28".to_string());
        api.update(pod).unwrap();
        settle().await;

        assert_eq!(provider.creates(), 1);
        assert_eq!(provider.updates(), 1);
        let in_provider = provider.pod("default", "web").unwrap();
        assert_eq!(
            in_provider.spec.unwrap().containers[0].image.as_deref(),
            Some("nginx:1.28")
        );

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_only_changes_do_not_resync() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "web")).unwrap();
        settle().await;
        assert!(provider.set_phase("default", "web", PHASE_SUCCEEDED));
        settle().await;

        assert_eq!(phase_of(&api, "web").as_deref(), Some(PHASE_SUCCEEDED));
        assert_eq!(provider.creates(), 1);
        assert_eq!(provider.updates(), 0);

        harness.stop().await.unwrap();
    }

    /// Story: once the API pod is final, later provider status is ignored
    #[tokio::test(start_paused = true)]
    async fn story_final_status_is_not_overwritten() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "job")).unwrap();
        settle().await;
        provider.set_phase("default", "job", PHASE_FAILED);
        settle().await;
        let writes = api.status_updates();

        provider.set_phase("default", "job", PHASE_RUNNING);
        settle().await;
        assert_eq!(phase_of(&api, "job").as_deref(), Some(PHASE_FAILED));
        assert_eq!(api.status_updates(), writes);

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_provider_status_reaches_api() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::new();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "web")).unwrap();
        settle().await;
        assert_eq!(provider.creates(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(phase_of(&api, "web").as_deref(), Some(PHASE_RUNNING));

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_initiated_deletion_removes_api_pod() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.create(test_pod("default", "evicted")).unwrap();
        settle().await;

        let mut evicted = provider.pod("default", "evicted").unwrap();
        evicted.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        evicted.metadata.deletion_grace_period_seconds = Some(0);
        provider.insert(evicted);
        provider.set_phase("default", "evicted", PHASE_FAILED);
        settle().await;

        assert!(api.pod("default", "evicted").is_none());

        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_conflicts_are_retried() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider.clone()).await;

        api.fail_next_status_update(Error::from(vnode_common::kube_utils::api_error(
            409,
            vnode_common::kube_utils::REASON_CONFLICT,
            "the object has been modified",
        )));
        api.create(test_pod("default", "web")).unwrap();
        settle().await;

        assert_eq!(phase_of(&api, "web").as_deref(), Some(PHASE_RUNNING));
        assert_eq!(api.status_updates(), 1);

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_watch_never_syncs() {
        let mut pods = MockPodClient::new();
        pods.expect_watch()
            .returning(|| futures::stream::empty().boxed());
        let controller = PodController::builder(
            TestPodProvider::with_notifier(),
            Arc::new(pods),
            FakeClusterResources::new(),
        )
        .build()
        .unwrap();

        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("initial list"));
        assert!(controller.done().is_cancelled());
        assert!(controller.err().is_some());
        assert!(!controller.ready().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_is_rejected() {
        let api = FakePodApi::new();
        let controller = Arc::new(
            PodController::builder(TestPodProvider::with_notifier(), api, FakeClusterResources::new())
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();
        let task = {
            let (controller, ctx) = (controller.clone(), ctx.clone());
            tokio::spawn(async move { controller.run(ctx).await })
        };
        controller.ready().cancelled().await;

        assert!(controller.run(ctx.clone()).await.is_err());
        ctx.cancel();
        task.await.unwrap().unwrap();
    }

    /// Story: a pod deleted while its provider status waits in the queue is
    /// dropped without a write or a retry
    #[tokio::test]
    async fn story_status_for_deleted_pod_is_dropped() {
        let api = FakePodApi::new();
        let controller =
            PodController::builder(TestPodProvider::with_notifier(), api.clone(), FakeClusterResources::new())
                .build()
                .unwrap();
        let inner = &controller.inner;

        let pod = api.create(test_pod("default", "web")).unwrap();
        let key = meta_key(&pod.metadata);
        inner.store.insert_for_test(pod.clone());
        inner.on_pod_event(PodEvent::Add(Arc::new(pod.clone())));

        let mut running = pod.clone();
        running.status.as_mut().unwrap().phase = Some(PHASE_RUNNING.to_string());
        inner.on_provider_pod(running);

        api.request_delete("default", "web", 0).unwrap();
        inner.store.remove_for_test(&key);
        inner.on_pod_event(PodEvent::Delete(Arc::new(pod)));
        assert!(inner.known.get(&key).is_none());

        inner.sync_status(key.clone()).await.unwrap();
        assert_eq!(api.status_updates(), 0);
        assert_eq!(inner.status_queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watch_stops_the_controller() {
        let api = FakePodApi::new();
        let provider = TestPodProvider::with_notifier();
        let harness = Harness::start(api.clone(), provider).await;

        api.close_watches();
        let err = tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("controller should stop once its watch ends")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("pod watch stream ended"));
        assert!(!harness.ctx.is_cancelled());
    }
}
