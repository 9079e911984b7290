//! Node controller for vnode
//!
//! Registers the virtual node with the API server and keeps it alive:
//! provider pings drive lease renewals (or status updates when leases are
//! unavailable), a slower timer refreshes status in lease mode, and status
//! pushed by the provider is patched through immediately.
//!
//! Status is written with a three-way strategic merge patch so conditions,
//! labels and annotations added by other actors survive our updates.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod lease;
pub mod ping;
pub mod provider;
pub mod status;
pub mod template;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{KubeLeaseClient, KubeNodeClient, LeaseClient, NodeClient};
pub use controller::{ErrorHandler, NodeController, NodeControllerBuilder};
pub use lease::NodeLease;
pub use ping::{PingResult, Pinger};
pub use provider::{NaiveNodeProvider, NodeProvider, NodeStatusCallback};
pub use template::{provider_taint, NodeTemplate};

use std::time::Duration;

/// Default interval between provider pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between status updates in lease mode
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);
