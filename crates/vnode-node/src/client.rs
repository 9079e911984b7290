//! API-server access for nodes and node leases
//!
//! Trait seams so the controller can be driven by in-memory fakes or mocks
//! in tests and by kube-rs in production.

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use vnode_common::{Error, Result, NODE_LEASE_NAMESPACE};

/// Node operations used by the node controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a node by name
    async fn get(&self, name: &str) -> Result<Node>;

    /// Register a new node
    async fn create(&self, node: &Node) -> Result<Node>;

    /// Apply a strategic merge patch through the `status` subresource
    async fn patch_status(&self, name: &str, patch: &Value) -> Result<Node>;
}

/// Lease operations used by the node controller
///
/// All leases live in the node-lease namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Fetch a lease by name
    async fn get(&self, name: &str) -> Result<Lease>;

    /// Create a lease
    async fn create(&self, lease: &Lease) -> Result<Lease>;

    /// Replace a lease; the lease's resourceVersion, if set, is the precondition
    async fn update(&self, lease: &Lease) -> Result<Lease>;

    /// Delete a lease by name
    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`NodeClient`] backed by kube-rs
pub struct KubeNodeClient {
    api: Api<Node>,
}

impl KubeNodeClient {
    /// Create a node client from a kube client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn get(&self, name: &str) -> Result<Node> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, node: &Node) -> Result<Node> {
        Ok(self.api.create(&PostParams::default(), node).await?)
    }

    async fn patch_status(&self, name: &str, patch: &Value) -> Result<Node> {
        Ok(self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?)
    }
}

/// [`LeaseClient`] backed by kube-rs
pub struct KubeLeaseClient {
    api: Api<Lease>,
}

impl KubeLeaseClient {
    /// Create a lease client scoped to the node-lease namespace
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::namespaced(client, NODE_LEASE_NAMESPACE),
        }
    }
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get(&self, name: &str) -> Result<Lease> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<Lease> {
        Ok(self.api.create(&PostParams::default(), lease).await?)
    }

    async fn update(&self, lease: &Lease) -> Result<Lease> {
        let name = lease
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_input("lease has no name"))?;
        Ok(self.api.replace(name, &PostParams::default(), lease).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
