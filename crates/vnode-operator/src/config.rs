//! Runtime configuration for a virtual node
//!
//! The binary fills this from flags and `VNODE_*` environment variables;
//! library users start from [`VirtualNodeConfig::new`] and chain setters.

use std::net::SocketAddr;
use std::time::Duration;

use vnode_common::{Error, Result};
use vnode_node::{DEFAULT_PING_INTERVAL, DEFAULT_STATUS_INTERVAL};
use vnode_pod::sync_provider::DEFAULT_POLL_INTERVAL;
use vnode_pod::DEFAULT_WORKERS;

/// Default readiness deadline for each controller
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bind address of the health server
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Everything needed to run one virtual node
#[derive(Clone, Debug)]
pub struct VirtualNodeConfig {
    /// Name of the node object
    pub node_name: String,
    /// Provider name, used in the node taint
    pub provider_name: String,
    /// Register the node without the provider taint
    pub disable_taint: bool,
    /// Only manage pods in this namespace
    pub namespace: Option<String>,
    /// Health server address; `None` disables the server
    pub health_addr: Option<SocketAddr>,
    /// Kubeconfig context; `None` uses in-cluster or default configuration
    pub kube_context: Option<String>,
    /// Workers per pod queue
    pub workers: usize,
    /// Interval between provider pings
    pub ping_interval: Duration,
    /// Interval between status updates in lease mode
    pub status_interval: Duration,
    /// Optional bound on each ping
    pub ping_timeout: Option<Duration>,
    /// Interval between status polls for providers that cannot push
    pub poll_interval: Duration,
    /// Heartbeat through a node lease
    pub enable_lease: bool,
    /// How long each controller may take to become ready
    pub startup_timeout: Option<Duration>,
}

impl VirtualNodeConfig {
    /// Defaults for a node called `node_name`
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            provider_name: "mock".to_string(),
            disable_taint: false,
            namespace: None,
            health_addr: DEFAULT_HEALTH_ADDR.parse().ok(),
            kube_context: None,
            workers: DEFAULT_WORKERS,
            ping_interval: DEFAULT_PING_INTERVAL,
            status_interval: DEFAULT_STATUS_INTERVAL,
            ping_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            enable_lease: true,
            startup_timeout: Some(DEFAULT_STARTUP_TIMEOUT),
        }
    }

    /// Set the provider name
    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    /// Leave the provider taint off the node
    pub fn disable_taint(mut self, disable: bool) -> Self {
        self.disable_taint = disable;
        self
    }

    /// Restrict pods to one namespace
    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Set or disable the health server address
    pub fn health_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.health_addr = addr;
        self
    }

    /// Use a specific kubeconfig context
    pub fn kube_context(mut self, context: Option<String>) -> Self {
        self.kube_context = context;
        self
    }

    /// Workers per pod queue
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
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

    /// Bound each ping
    pub fn ping_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Interval between status polls
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Heartbeat through a node lease
    pub fn enable_lease(mut self, enable: bool) -> Self {
        self.enable_lease = enable;
        self
    }

    /// Readiness deadline per controller; `None` waits forever
    pub fn startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Reject configurations the controllers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::invalid_input("node name is required"));
        }
        if self.provider_name.is_empty() {
            return Err(Error::invalid_input("provider name is required"));
        }
        if self.workers == 0 {
            return Err(Error::invalid_input("workers must be at least 1"));
        }
        if self.ping_interval.is_zero() || self.status_interval.is_zero() {
            return Err(Error::invalid_input("ping and status intervals must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_input("poll interval must be positive"));
        }
        if self.ping_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_input("ping timeout must be positive"));
        }
        if self.startup_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_input("startup timeout must be positive"));
        }
        if self.namespace.as_deref() == Some("") {
            return Err(Error::invalid_input("namespace must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VirtualNodeConfig::new("vk-mock");
        assert!(config.validate().is_ok());
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.status_interval, Duration::from_secs(60));
        assert!(config.enable_lease);
        assert_eq!(config.health_addr, Some("0.0.0.0:8080".parse().unwrap()));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let base = || VirtualNodeConfig::new("vk-mock");
        assert!(VirtualNodeConfig::new("").validate().is_err());
        assert!(base().workers(0).validate().is_err());
        assert!(base().ping_interval(Duration::ZERO).validate().is_err());
        assert!(base().poll_interval(Duration::ZERO).validate().is_err());
        assert!(base().ping_timeout(Some(Duration::ZERO)).validate().is_err());
        assert!(base().startup_timeout(Some(Duration::ZERO)).validate().is_err());
        assert!(base().namespace(Some(String::new())).validate().is_err());
        assert!(base().provider_name("").validate().is_err());
    }
}
