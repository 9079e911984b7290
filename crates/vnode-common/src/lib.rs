//! Common types for vnode: errors, retry, Kubernetes helpers, events and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding node heartbeat leases
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";

/// Prefix for annotations and taints owned by vnode
pub const ANNOTATION_PREFIX: &str = "virtual-kubelet.io";

/// Taint key marking a node as backed by a provider
pub const PROVIDER_TAINT_KEY: &str = "virtual-kubelet.io/provider";

/// Component name used as the event reporter
pub const COMPONENT_NAME: &str = "vnode";
