//! Pod controller for vnode
//!
//! Watches the pods bound to the virtual node and reconciles them with the
//! provider through three queues:
//!
//! - sync from Kubernetes: create, update or delete in the provider
//! - delete from Kubernetes: force-remove pods once their grace period is over
//! - sync status from provider: write provider-reported status back
//!
//! Providers that cannot push status are polled, see [`sync_provider`].

#![deny(missing_docs)]

pub mod client;
pub mod compare;
pub mod controller;
pub mod env;
pub mod informer;
pub mod known;
pub mod provider;
pub mod status;
pub mod sync_provider;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{KubePodClient, PodClient, PodEventStream};
pub use controller::{PodController, PodControllerBuilder, PodQueue};
pub use env::{ClusterResources, EnvResolver, KubeClusterResources};
pub use informer::{PodEvent, PodEventFilter, PodInformer, PodStore};
pub use provider::{PodLifecycleHandler, PodNotifier, PodStatusCallback};
pub use sync_provider::SyncProviderWrapper;

/// Default number of workers per pod queue
pub const DEFAULT_WORKERS: usize = 10;
