//! Pod-side provider contract

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio_util::sync::CancellationToken;

use vnode_common::Result;

/// Callback a provider invokes to push a pod whose status changed
///
/// Never blocks: the pod is recorded and its key enqueued.
pub type PodStatusCallback = Arc<dyn Fn(Pod) + Send + Sync>;

/// Imperative pod operations and cached reads implemented by a provider
#[async_trait]
pub trait PodLifecycleHandler: Send + Sync {
    /// Start running `pod`
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Apply an update to the mutable fields of `pod`
    async fn update_pod(&self, pod: &Pod) -> Result<()>;

    /// Stop `pod`. A pod the provider does not know is a not-found error.
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    /// Provider's view of a pod, `None` if it is not running there
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Provider's view of a pod's status, `None` if it is not running there
    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>>;

    /// Every pod the provider runs
    async fn get_pods(&self) -> Result<Vec<Pod>>;

    /// Push-based status notification, when the provider supports it
    ///
    /// Providers without it are polled.
    fn as_notifier(&self) -> Option<&dyn PodNotifier> {
        None
    }
}

/// Providers that push pod status changes themselves
pub trait PodNotifier: Send + Sync {
    /// Register the callback used to push pods
    ///
    /// Must return promptly. Providers that push asynchronously spawn their
    /// own task and stop it when `ctx` is cancelled.
    fn notify_pods(&self, ctx: CancellationToken, callback: PodStatusCallback);
}
