//! API-server access for pods

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use vnode_common::{Error, Result};

/// Watch events for the pods bound to this node
pub type PodEventStream =
    BoxStream<'static, std::result::Result<watcher::Event<Pod>, watcher::Error>>;

/// Pod operations used by the pod controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Fetch a pod
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Write a pod's status through the `status` subresource
    ///
    /// A resourceVersion of `"0"` (or none) writes unconditionally; any other
    /// value is a precondition.
    async fn update_status(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod, optionally only if its UID still matches
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
        uid: Option<String>,
    ) -> Result<()>;

    /// Watch pods bound to this node, starting with a full list
    fn watch(&self) -> PodEventStream;
}

/// [`PodClient`] backed by kube-rs
pub struct KubePodClient {
    client: Client,
    node_name: String,
    namespace: Option<String>,
}

impl KubePodClient {
    /// Pods bound to `node_name`, in every namespace or only in `namespace`
    pub fn new(client: Client, node_name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            namespace,
        }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn update_status(&self, pod: &Pod) -> Result<Pod> {
        let name = pod
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_input("pod has no name"))?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        let mut body = json!({ "status": pod.status });
        if let Some(rv) = pod
            .metadata
            .resource_version
            .as_deref()
            .filter(|rv| *rv != "0")
        {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        Ok(self
            .api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
        uid: Option<String>,
    ) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds,
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.api(namespace).delete(name, &params).await?;
        Ok(())
    }

    fn watch(&self) -> PodEventStream {
        let api: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        // Shorter than the client read timeout so the server closes the watch first
        let config = watcher::Config::default()
            .fields(&format!("spec.nodeName={}", self.node_name))
            .timeout(25);
        watcher(api, config).default_backoff().boxed()
    }
}
