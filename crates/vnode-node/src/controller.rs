//! Node control loop
//!
//! One task owns the node body and the lease. Provider pushes arrive through
//! a channel and are applied inside the loop, so status writes are totally
//! ordered. Pings run on their own task and publish into a monitor the loop
//! reads on every ping tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Node;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vnode_common::metrics::{Outcome, NODE_STATUS_UPDATES};
use vnode_common::{Error, Result};
use vnode_queue::Monitor;

use crate::client::{LeaseClient, NodeClient};
use crate::lease::NodeLease;
use crate::ping::{PingResult, Pinger};
use crate::provider::NodeProvider;
use crate::status::{annotate_last_applied, build_status_patch, stamp_heartbeat};
use crate::{DEFAULT_PING_INTERVAL, DEFAULT_STATUS_INTERVAL};

/// Recovery hook for failed status patches
///
/// Returning `Ok` retries the patch once; an error is returned to the loop.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builder for [`NodeController`]
pub struct NodeControllerBuilder {
    provider: Arc<dyn NodeProvider>,
    node: Node,
    nodes: Arc<dyn NodeClient>,
    leases: Option<Arc<dyn LeaseClient>>,
    ping_interval: Duration,
    status_interval: Duration,
    ping_timeout: Option<Duration>,
    error_handler: Option<ErrorHandler>,
}

impl NodeControllerBuilder {
    /// Heartbeat through a lease in addition to status updates
    pub fn lease_client(mut self, leases: Arc<dyn LeaseClient>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Interval between provider pings
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Interval between status updates in lease mode
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Bound each provider ping
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    /// Hook consulted when a status patch fails
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Validate and build the controller
    pub fn build(self) -> Result<NodeController> {
        let name = self
            .node
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::invalid_input("node must have a name"))?;
        if self.ping_interval.is_zero() {
            return Err(Error::invalid_input("ping interval must be positive"));
        }
        if self.status_interval.is_zero() {
            return Err(Error::invalid_input("status interval must be positive"));
        }
        if self.ping_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_input("ping timeout must be positive"));
        }

        Ok(NodeController {
            name,
            provider: self.provider,
            nodes: self.nodes,
            leases: self.leases,
            ping_interval: self.ping_interval,
            status_interval: self.status_interval,
            ping_timeout: self.ping_timeout,
            error_handler: self.error_handler,
            template: Mutex::new(Some(self.node)),
            registered: Mutex::new(None),
            pings: Monitor::new(),
            ready: CancellationToken::new(),
            done: CancellationToken::new(),
            err: Mutex::new(None),
        })
    }
}

/// Registers a virtual node and keeps it alive
pub struct NodeController {
    name: String,
    provider: Arc<dyn NodeProvider>,
    nodes: Arc<dyn NodeClient>,
    leases: Option<Arc<dyn LeaseClient>>,
    ping_interval: Duration,
    status_interval: Duration,
    ping_timeout: Option<Duration>,
    error_handler: Option<ErrorHandler>,
    template: Mutex<Option<Node>>,
    registered: Mutex<Option<Node>>,
    pings: Monitor<PingResult>,
    ready: CancellationToken,
    done: CancellationToken,
    err: Mutex<Option<String>>,
}

impl NodeController {
    /// Start building a controller for `node`
    pub fn builder(
        provider: Arc<dyn NodeProvider>,
        node: Node,
        nodes: Arc<dyn NodeClient>,
    ) -> NodeControllerBuilder {
        NodeControllerBuilder {
            provider,
            node,
            nodes,
            leases: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            status_interval: DEFAULT_STATUS_INTERVAL,
            ping_timeout: None,
            error_handler: None,
        }
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fires once the node (and lease, if any) is registered
    pub fn ready(&self) -> CancellationToken {
        self.ready.clone()
    }

    /// Fires when [`NodeController::run`] has returned
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Final error, available once [`NodeController::done`] has fired
    pub fn err(&self) -> Option<String> {
        self.err.lock().clone()
    }

    /// Latest node body returned by the API server
    pub fn node(&self) -> Option<Node> {
        self.registered.lock().clone()
    }

    /// Outcome of the most recent provider ping
    pub fn last_ping(&self) -> Option<PingResult> {
        self.pings.get().value
    }

    /// Register the node and run the control loop until `ctx` is cancelled
    ///
    /// Returns `Ok(())` on cancellation. Can only be called once.
    #[instrument(skip_all, fields(node = %self.name))]
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        let Some(node) = self.template.lock().take() else {
            return Err(Error::internal("node controller already started"));
        };
        let result = self.run_inner(&ctx, node).await;
        if let Err(e) = &result {
            error!(error = %e, "Node controller failed");
            *self.err.lock() = Some(e.to_string());
        }
        self.done.cancel();
        result
    }

    async fn run_inner(&self, ctx: &CancellationToken, mut node: Node) -> Result<()> {
        self.provider.configure_node(&mut node);

        let tasks = ctx.child_token();
        let (push_tx, mut pushes) = mpsc::unbounded_channel::<Node>();
        self.provider.notify_node_status(
            tasks.clone(),
            Arc::new(move |pushed| {
                // The receiver only goes away once the loop has exited
                let _ = push_tx.send(pushed);
            }),
        );

        if let Err(e) = self.ensure_node(&mut node).await {
            tasks.cancel();
            return Err(e);
        }

        let mut lease = match &self.leases {
            Some(client) => {
                let mut lease = NodeLease::new(client.clone(), &node, self.ping_interval);
                match lease.ensure().await {
                    Ok(true) => Some(lease),
                    Ok(false) => None,
                    Err(e) => {
                        tasks.cancel();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        info!(lease = lease.is_some(), "Node registered");
        self.ready.cancel();

        let pinger = Arc::new(Pinger::with_results(
            self.provider.clone(),
            self.ping_timeout,
            self.pings.clone(),
        ));
        let ping_task = {
            let (pinger, tasks, interval) = (pinger.clone(), tasks.clone(), self.ping_interval);
            tokio::spawn(async move { pinger.run(tasks, interval).await })
        };

        let mut ping_ticker = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let status_timer = tokio::time::sleep(self.status_interval);
        tokio::pin!(status_timer);

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => break,

                Some(pushed) = pushes.recv() => {
                    let mut latest = pushed;
                    while let Ok(newer) = pushes.try_recv() {
                        latest = newer;
                    }
                    apply_push(&mut node, latest);
                    if lease.is_some() {
                        status_timer.as_mut().reset(Instant::now() + self.status_interval);
                    } else {
                        ping_ticker.reset();
                    }
                    if let Err(e) = self.update_status(&mut node, false).await {
                        warn!(error = %e, "Failed to apply status pushed by provider");
                    }
                }

                _ = ping_ticker.tick() => {
                    let Some(ping) = pinger.results().get().value else {
                        debug!("No ping result yet");
                        continue;
                    };
                    if let Some(err) = &ping.error {
                        debug!(error = %err, "Skipping heartbeat after failed ping");
                        continue;
                    }
                    match lease.as_mut() {
                        Some(lease) => {
                            if let Err(e) = lease.renew().await {
                                warn!(error = %e, "Failed to renew node lease");
                            }
                        }
                        None => {
                            if let Err(e) = self.update_status(&mut node, false).await {
                                warn!(error = %e, "Failed to update node status");
                            }
                        }
                    }
                }

                _ = &mut status_timer, if lease.is_some() => {
                    if let Err(e) = self.update_status(&mut node, false).await {
                        warn!(error = %e, "Failed to update node status");
                    }
                    status_timer.as_mut().reset(Instant::now() + self.status_interval);
                }
            }
        }

        tasks.cancel();
        if let Err(e) = ping_task.await {
            warn!(error = %e, "Ping task did not shut down cleanly");
        }
        info!("Node controller stopped");
        Ok(())
    }

    /// Patch the node's status, creating the node when it does not exist
    async fn ensure_node(&self, node: &mut Node) -> Result<()> {
        match self.update_status(node, true).await {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let mut body = node.clone();
        annotate_last_applied(&mut body)?;
        let created = self.nodes.create(&body).await?;
        info!("Created node");
        node.metadata.uid = created.metadata.uid.clone();
        *self.registered.lock() = Some(created);
        Ok(())
    }

    /// Stamp heartbeats and write the local status through a three-way patch
    async fn update_status(&self, node: &mut Node, initial: bool) -> Result<()> {
        stamp_heartbeat(node);

        let result = match self.patch_status(node).await {
            Err(e) if !initial && self.error_handler.is_some() => {
                self.recover(e, node).await
            }
            other => other,
        };
        // The initial NotFound is expected and leads to a create
        if !(initial && result.as_ref().is_err_and(|e| e.is_not_found())) {
            NODE_STATUS_UPDATES.add(1, &Outcome::of(&result).labels());
        }

        let updated = result?;
        node.metadata.uid = updated.metadata.uid.clone();
        *self.registered.lock() = Some(updated);
        Ok(())
    }

    async fn recover(&self, err: Error, node: &Node) -> Result<Node> {
        let Some(handler) = &self.error_handler else {
            return Err(err);
        };
        debug!(error = %err, "Status update failed, consulting error handler");
        handler(&err).await?;
        self.patch_status(node).await
    }

    async fn patch_status(&self, node: &Node) -> Result<Node> {
        let current = self.nodes.get(&self.name).await?;
        let patch = build_status_patch(&current, node)?;
        self.nodes.patch_status(&self.name, &patch).await
    }
}

/// Copy what the provider owns from a pushed body onto the local node
fn apply_push(node: &mut Node, pushed: Node) {
    node.status = pushed.status;
    node.metadata.labels = pushed.metadata.labels;
    node.metadata.annotations = pushed.metadata.annotations;
}
