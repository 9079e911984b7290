//! vnode operator: runs a virtual node backed by a provider
//!
//! [`VirtualNode`] pairs the node controller with the pod controller and owns
//! their startup and shutdown ordering. The `vnode` binary adds flag parsing,
//! telemetry, signal handling and the health server on top.

#![deny(missing_docs)]

pub mod config;
pub mod health;
pub mod mock;
pub mod startup;
pub mod virtual_node;

pub use config::VirtualNodeConfig;
pub use health::ReadinessProbe;
pub use mock::{MockConfig, MockProvider};
pub use virtual_node::VirtualNode;
