//! Status polling for providers that cannot push pod changes
//!
//! [`SyncProviderWrapper`] wraps a plain [`PodLifecycleHandler`] and supplies
//! [`PodNotifier`] by listing the provider's pods on an interval. Pods deleted
//! through the wrapper get a synthesized terminal status right away, and are
//! remembered so the poller does not later report them as lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vnode_common::kube_utils::meta_key;
use vnode_common::Result;

use crate::informer::PodStore;
use crate::provider::{PodLifecycleHandler, PodNotifier, PodStatusCallback};
use crate::status::{self, PHASE_RUNNING, REASON_PROVIDER_FAILED};

/// How often the provider is listed
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pods younger than this that are not running yet may legitimately be
/// missing from the provider
const STARTUP_GRACE_SECS: i64 = 60;

/// Adapter giving a poll-only provider push-style notifications
pub struct SyncProviderWrapper {
    inner: Arc<dyn PodLifecycleHandler>,
    lister: PodStore,
    /// `namespace/name` to UID of pods deleted through the wrapper
    deleted: DashMap<String, String>,
    callback: Mutex<Option<PodStatusCallback>>,
}

impl SyncProviderWrapper {
    /// Wrap `inner`, comparing its pods against the informer cache `lister`
    pub fn new(inner: Arc<dyn PodLifecycleHandler>, lister: PodStore) -> Self {
        Self {
            inner,
            lister,
            deleted: DashMap::new(),
            callback: Mutex::new(None),
        }
    }

    /// Poll every `interval` until `ctx` is cancelled
    pub async fn run(&self, ctx: CancellationToken, interval: Duration) {
        info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Pod status poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => self.poll().await,
            }
        }
        debug!("Pod status poller stopped");
    }

    /// List the provider once and push every pod whose status changed
    pub async fn poll(&self) {
        let Some(callback) = self.callback.lock().clone() else {
            return;
        };
        let pods = match self.inner.get_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list provider pods");
                return;
            }
        };
        let mut by_key: HashMap<String, Pod> = pods
            .into_iter()
            .map(|p| (meta_key(&p.metadata), p))
            .collect();

        let now = Utc::now();
        for api_pod in self.lister.list() {
            let key = meta_key(&api_pod.metadata);
            if let Some(provider_pod) = by_key.remove(&key) {
                if provider_pod.status != api_pod.status {
                    callback(provider_pod);
                }
                continue;
            }
            if self.was_deleted(&key, &api_pod)
                || status::is_terminal(&api_pod)
                || status::reason(&api_pod) == Some(REASON_PROVIDER_FAILED)
            {
                continue;
            }
            let running = status::phase(&api_pod) == Some(PHASE_RUNNING);
            let settled = api_pod
                .metadata
                .creation_timestamp
                .as_ref()
                .is_some_and(|t| now - t.0 > chrono::Duration::seconds(STARTUP_GRACE_SECS));
            if !running && !settled {
                continue;
            }

            debug!(key, "Pod missing from provider, marking it not found");
            let mut lost = (*api_pod).clone();
            status::mark_not_found(&mut lost, now);
            callback(lost);
        }

        self.deleted.retain(|key, uid| {
            self.lister
                .get_key(key)
                .is_some_and(|p| p.metadata.uid.as_deref() == Some(uid.as_str()))
        });
    }

    fn was_deleted(&self, key: &str, pod: &Pod) -> bool {
        self.deleted
            .get(key)
            .is_some_and(|uid| pod.metadata.uid.as_deref() == Some(uid.as_str()))
    }

    fn push(&self, pod: Pod) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(pod);
        }
    }
}

#[async_trait]
impl PodLifecycleHandler for SyncProviderWrapper {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.inner.create_pod(pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        self.inner.update_pod(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        self.inner.delete_pod(pod).await?;

        let key = meta_key(&pod.metadata);
        if let Some(uid) = pod.metadata.uid.clone() {
            self.deleted.insert(key, uid);
        }
        let mut terminated = pod.clone();
        status::mark_terminated(&mut terminated, Utc::now());
        self.push(terminated);
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.inner.get_pod(namespace, name).await
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        self.inner.get_pod_status(namespace, name).await
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        self.inner.get_pods().await
    }

    fn as_notifier(&self) -> Option<&dyn PodNotifier> {
        Some(self)
    }
}

impl PodNotifier for SyncProviderWrapper {
    fn notify_pods(&self, _ctx: CancellationToken, callback: PodStatusCallback) {
        *self.callback.lock() = Some(callback);
    }
}
