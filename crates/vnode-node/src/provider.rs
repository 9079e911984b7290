//! Node-side provider contract

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use vnode_common::Result;

/// Callback a provider invokes to push a new node body
///
/// Never blocks: the body is queued and applied by the node control loop.
pub type NodeStatusCallback = Arc<dyn Fn(Node) + Send + Sync>;

/// What the node controller needs from a provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Liveness probe. May block; the controller bounds it with an optional timeout.
    async fn ping(&self) -> Result<()>;

    /// Register the callback used to push node status changes
    ///
    /// Must return promptly. Providers that push asynchronously should spawn
    /// their own task and stop it when `ctx` is cancelled.
    fn notify_node_status(&self, ctx: CancellationToken, callback: NodeStatusCallback);

    /// Fill in capacity, addresses, conditions and node info before registration
    fn configure_node(&self, _node: &mut Node) {}
}

/// Provider that is always healthy and never pushes status
#[derive(Clone, Copy, Debug, Default)]
pub struct NaiveNodeProvider;

#[async_trait]
impl NodeProvider for NaiveNodeProvider {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn notify_node_status(&self, _ctx: CancellationToken, _callback: NodeStatusCallback) {}
}
