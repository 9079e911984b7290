//! Initial node body for a virtual node

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus, NodeSystemInfo, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vnode_common::PROVIDER_TAINT_KEY;

/// Taint keeping ordinary workloads off a provider-backed node
pub fn provider_taint(provider: &str) -> Taint {
    Taint {
        key: PROVIDER_TAINT_KEY.to_string(),
        value: Some(provider.to_string()),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

/// Builder for the node body registered at startup
///
/// The provider fills in capacity, addresses and conditions afterwards via
/// [`crate::NodeProvider::configure_node`].
#[derive(Clone, Debug)]
pub struct NodeTemplate {
    name: String,
    provider: String,
    operating_system: String,
    kubelet_version: String,
    taint: bool,
    labels: BTreeMap<String, String>,
}

impl NodeTemplate {
    /// Template for `name`, backed by the provider called `provider`
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            operating_system: "linux".to_string(),
            kubelet_version: concat!("v", env!("CARGO_PKG_VERSION")).to_string(),
            taint: true,
            labels: BTreeMap::new(),
        }
    }

    /// Leave the provider taint off the node
    pub fn disable_taint(mut self, disable: bool) -> Self {
        self.taint = !disable;
        self
    }

    /// Operating system reported in labels and node info
    pub fn operating_system(mut self, os: impl Into<String>) -> Self {
        self.operating_system = os.into();
        self
    }

    /// Version string reported as the kubelet version
    pub fn kubelet_version(mut self, version: impl Into<String>) -> Self {
        self.kubelet_version = version.into();
        self
    }

    /// Extra label on the node
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Build the node body
    pub fn build(self) -> Node {
        let mut labels = BTreeMap::from([
            ("type".to_string(), "virtual-kubelet".to_string()),
            ("kubernetes.io/role".to_string(), "agent".to_string()),
            ("kubernetes.io/hostname".to_string(), self.name.clone()),
            ("kubernetes.io/os".to_string(), self.operating_system.clone()),
            (
                "node.kubernetes.io/exclude-from-external-load-balancers".to_string(),
                "true".to_string(),
            ),
        ]);
        labels.extend(self.labels);

        let taints = self.taint.then(|| vec![provider_taint(&self.provider)]);

        Node {
            metadata: ObjectMeta {
                name: Some(self.name),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints,
                ..Default::default()
            }),
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    operating_system: self.operating_system,
                    architecture: "amd64".to_string(),
                    kubelet_version: self.kubelet_version,
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }
}
