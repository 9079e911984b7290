//! One virtual node: the node controller and the pod controller run together
//!
//! The node is registered first, then pods are synced against it. Each
//! controller gets the configured startup timeout to become ready; once both
//! are up, [`VirtualNode::run`] waits for cancellation or for either
//! controller to stop, and then shuts both down.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use vnode_common::events::KubeEventPublisher;
use vnode_common::{Error, Result, COMPONENT_NAME};
use vnode_node::{KubeLeaseClient, KubeNodeClient, NodeController, NodeProvider, NodeTemplate};
use vnode_pod::{KubeClusterResources, KubePodClient, PodController, PodLifecycleHandler};

use crate::config::VirtualNodeConfig;
use crate::health::ReadinessProbe;

/// Node and pod controllers for a single virtual node
pub struct VirtualNode {
    node: Arc<NodeController>,
    pods: Arc<PodController>,
    startup_timeout: Option<Duration>,
    ready: CancellationToken,
}

impl VirtualNode {
    /// Pair already-built controllers, with no startup timeout
    pub fn new(node: NodeController, pods: PodController) -> Self {
        Self {
            node: Arc::new(node),
            pods: Arc::new(pods),
            startup_timeout: None,
            ready: CancellationToken::new(),
        }
    }

    /// Build both controllers against a real API server
    pub fn from_config<P>(config: &VirtualNodeConfig, client: Client, provider: Arc<P>) -> Result<Self>
    where
        P: NodeProvider + PodLifecycleHandler + 'static,
    {
        config.validate()?;

        let template = NodeTemplate::new(&config.node_name, &config.provider_name)
            .disable_taint(config.disable_taint)
            .build();
        let mut node = NodeController::builder(
            provider.clone(),
            template,
            Arc::new(KubeNodeClient::new(client.clone())),
        )
        .ping_interval(config.ping_interval)
        .status_interval(config.status_interval);
        if config.enable_lease {
            node = node.lease_client(Arc::new(KubeLeaseClient::new(client.clone())));
        }
        if let Some(timeout) = config.ping_timeout {
            node = node.ping_timeout(timeout);
        }

        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            COMPONENT_NAME,
            Some(config.node_name.clone()),
        ));
        let pods = PodController::builder(
            provider,
            Arc::new(KubePodClient::new(
                client.clone(),
                &config.node_name,
                config.namespace.clone(),
            )),
            Arc::new(KubeClusterResources::new(client)),
        )
        .events(events)
        .workers(config.workers)
        .poll_interval(config.poll_interval)
        .build()?;

        Ok(Self::new(node.build()?, pods).startup_timeout(config.startup_timeout))
    }

    /// How long each controller may take to become ready; `None` waits forever
    pub fn startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// The node controller
    pub fn node_controller(&self) -> &NodeController {
        &self.node
    }

    /// The pod controller
    pub fn pod_controller(&self) -> &PodController {
        &self.pods
    }

    /// Fires once both controllers are ready
    pub fn ready(&self) -> CancellationToken {
        self.ready.clone()
    }

    /// Start both controllers and run until `ctx` is cancelled
    ///
    /// Fails when a controller does not become ready in time or stops with an
    /// error. Both controllers have exited by the time this returns.
    #[instrument(skip_all, fields(node = %self.node.name()))]
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        let tasks = ctx.child_token();

        let node_task = {
            let (node, tasks) = (self.node.clone(), tasks.clone());
            tokio::spawn(async move { node.run(tasks).await })
        };
        let started = self
            .wait_ready("node", &ctx, self.node.ready(), self.node.done(), || self.node.err())
            .await;
        if let Err(e) = started {
            tasks.cancel();
            let _ = join("node", node_task).await;
            return Err(e);
        }
        if ctx.is_cancelled() {
            tasks.cancel();
            return join("node", node_task).await;
        }

        let pod_task = {
            let (pods, tasks) = (self.pods.clone(), tasks.clone());
            tokio::spawn(async move { pods.run(tasks).await })
        };
        let started = self
            .wait_ready("pod", &ctx, self.pods.ready(), self.pods.done(), || self.pods.err())
            .await;
        if let Err(e) = started {
            tasks.cancel();
            let _ = join("pod", pod_task).await;
            let _ = join("node", node_task).await;
            return Err(e);
        }

        if !ctx.is_cancelled() {
            info!("Virtual node ready");
            self.ready.cancel();
            let node_done = self.node.done();
            let pods_done = self.pods.done();
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = node_done.cancelled() => {}
                _ = pods_done.cancelled() => {}
            }
        }

        tasks.cancel();
        let pod_result = join("pod", pod_task).await;
        let node_result = join("node", node_task).await;
        info!("Virtual node stopped");
        pod_result.and(node_result)
    }

    async fn wait_ready(
        &self,
        name: &str,
        ctx: &CancellationToken,
        ready: CancellationToken,
        done: CancellationToken,
        err: impl Fn() -> Option<String>,
    ) -> Result<()> {
        let wait = async {
            tokio::select! {
                biased;
                _ = ready.cancelled() => Ok(()),
                _ = done.cancelled() => Err(Error::internal_with_context(
                    name,
                    err().unwrap_or_else(|| "controller stopped before becoming ready".to_string()),
                )),
                _ = ctx.cancelled() => Ok(()),
            }
        };
        match self.startup_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::timeout(format!("{} controller startup", name), limit))?,
            None => wait.await,
        }
    }
}

async fn join(name: &str, task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(controller = name, error = %e, "Controller task failed");
            Err(Error::panicked(format!("{} controller: {}", name, e)))
        }
    }
}

impl ReadinessProbe for VirtualNode {
    fn check(&self) -> std::result::Result<(), String> {
        if !self.ready.is_cancelled() {
            return Err("controllers are starting".to_string());
        }
        if self.node.done().is_cancelled() {
            return Err("node controller stopped".to_string());
        }
        if self.pods.done().is_cancelled() {
            return Err("pod controller stopped".to_string());
        }
        match self.node.last_ping() {
            Some(ping) => match ping.error {
                Some(e) => Err(format!("last ping failed: {}", e)),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}
