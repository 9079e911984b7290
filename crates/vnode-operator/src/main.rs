//! vnode - presents a provider-backed virtual node to a Kubernetes cluster

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use vnode_common::kube_utils::create_client;
use vnode_common::telemetry::{init_telemetry, TelemetryConfig};
use vnode_operator::config::{VirtualNodeConfig, DEFAULT_HEALTH_ADDR};
use vnode_operator::startup::cancel_on_signal;
use vnode_operator::{health, MockConfig, MockProvider, VirtualNode};

/// vnode - virtual kubelet backed by a pluggable provider
#[derive(Parser, Debug)]
#[command(name = "vnode", version, about, long_about = None)]
struct Cli {
    /// Name of the node to register
    #[arg(long, env = "VNODE_NODE_NAME", default_value = "vnode")]
    node_name: String,

    /// Provider backing the node (only "mock" is built in)
    #[arg(long, env = "VNODE_PROVIDER", default_value = "mock")]
    provider: String,

    /// Register the node without the provider NoSchedule taint
    #[arg(long, env = "VNODE_DISABLE_TAINT")]
    disable_taint: bool,

    /// Only manage pods in this namespace
    #[arg(long, env = "VNODE_NAMESPACE")]
    namespace: Option<String>,

    /// Health server address
    #[arg(long, env = "VNODE_HEALTH_ADDR", default_value = DEFAULT_HEALTH_ADDR)]
    health_addr: SocketAddr,

    /// Do not start the health server
    #[arg(long, env = "VNODE_DISABLE_HEALTH")]
    disable_health: bool,

    /// Kubeconfig context (default: in-cluster or current context)
    #[arg(long, env = "VNODE_KUBE_CONTEXT")]
    kube_context: Option<String>,

    /// Workers per pod queue
    #[arg(long, env = "VNODE_WORKERS", default_value_t = vnode_pod::DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds between provider pings
    #[arg(long, env = "VNODE_PING_INTERVAL_SECS", default_value_t = 10)]
    ping_interval_secs: u64,

    /// Seconds between node status updates in lease mode
    #[arg(long, env = "VNODE_STATUS_INTERVAL_SECS", default_value_t = 60)]
    status_interval_secs: u64,

    /// Bound on each ping in seconds
    #[arg(long, env = "VNODE_PING_TIMEOUT_SECS")]
    ping_timeout_secs: Option<u64>,

    /// Seconds between status polls for providers that cannot push
    #[arg(long, env = "VNODE_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Heartbeat through node status only, without a lease
    #[arg(long, env = "VNODE_DISABLE_LEASE")]
    disable_lease: bool,

    /// Seconds each controller may take to become ready (0 waits forever)
    #[arg(long, env = "VNODE_STARTUP_TIMEOUT_SECS", default_value_t = 60)]
    startup_timeout_secs: u64,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "VNODE_LOG_PRETTY")]
    log_pretty: bool,
}

impl Cli {
    fn config(&self) -> VirtualNodeConfig {
        VirtualNodeConfig::new(&self.node_name)
            .provider_name(&self.provider)
            .disable_taint(self.disable_taint)
            .namespace(self.namespace.clone())
            .health_addr((!self.disable_health).then_some(self.health_addr))
            .kube_context(self.kube_context.clone())
            .workers(self.workers)
            .ping_interval(Duration::from_secs(self.ping_interval_secs))
            .status_interval(Duration::from_secs(self.status_interval_secs))
            .ping_timeout(self.ping_timeout_secs.map(Duration::from_secs))
            .poll_interval(Duration::from_secs(self.poll_interval_secs))
            .enable_lease(!self.disable_lease)
            .startup_timeout(
                (self.startup_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.startup_timeout_secs)),
            )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config();

    init_telemetry(TelemetryConfig {
        node_name: Some(config.node_name.clone()),
        pretty: cli.log_pretty,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let provider = match config.provider_name.as_str() {
        "mock" => MockProvider::new(MockConfig::default()),
        other => anyhow::bail!("Unknown provider {:?}; built-in providers: mock", other),
    };

    tracing::info!(
        node = %config.node_name,
        provider = %config.provider_name,
        namespace = ?config.namespace,
        "vnode starting..."
    );

    let client = create_client(config.kube_context.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let vnode = Arc::new(VirtualNode::from_config(&config, client, provider)?);

    let ctx = CancellationToken::new();
    tokio::spawn(cancel_on_signal(ctx.clone()));

    let health_task = config.health_addr.map(|addr| {
        let (probe, ctx) = (vnode.clone(), ctx.clone());
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, probe, ctx).await {
                tracing::error!(error = %e, "Health server failed");
            }
        })
    });

    let result = vnode.run(ctx.clone()).await;
    ctx.cancel();
    if let Some(task) = health_task {
        let _ = task.await;
    }

    result.map_err(|e| anyhow::anyhow!("Virtual node failed: {}", e))?;
    tracing::info!("vnode shutting down");
    Ok(())
}
