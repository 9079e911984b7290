//! In-memory test doubles for the node controller
//!
//! [`FakeNodeApi`] and [`FakeLeaseApi`] behave like the API server for the
//! handful of calls the controller makes, including strategic merge patches,
//! resourceVersion preconditions and AlreadyExists/NotFound responses.
//! [`TestNodeProvider`] counts pings and lets tests push node status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vnode_common::kube_utils::{
    api_error, REASON_ALREADY_EXISTS, REASON_CONFLICT, REASON_NOT_FOUND,
};
use vnode_common::{Error, Result};

use crate::client::{LeaseClient, NodeClient};
use crate::provider::{NodeProvider, NodeStatusCallback};

// =============================================================================
// Strategic merge
// =============================================================================

/// List fields merged by a key instead of replaced
fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "conditions" | "addresses" => Some("type"),
        "taints" => Some("key"),
        _ => None,
    }
}

/// Apply a strategic merge patch the way the API server does for nodes
///
/// Supports nested object merges, `null` deletion, and keyed list merges with
/// `$patch: delete` directives. Other lists are replaced.
pub fn apply_strategic_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (field, value) in patch {
        match (value, merge_key(field)) {
            (Value::Null, _) => {
                target.remove(field);
            }
            (Value::Array(items), Some(key)) => {
                let list = target
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                merge_list(list, items, key);
            }
            (Value::Object(_), _) => {
                let slot = target.entry(field.clone()).or_insert(Value::Null);
                apply_strategic_merge(slot, value);
            }
            _ => {
                target.insert(field.clone(), value.clone());
            }
        }
    }
}

fn merge_list(list: &mut Value, items: &[Value], key: &str) {
    if !list.is_array() {
        *list = Value::Array(Vec::new());
    }
    let Value::Array(existing) = list else {
        return;
    };
    for item in items {
        let id = item.get(key).cloned();
        if item.get("$patch").and_then(Value::as_str) == Some("delete") {
            existing.retain(|e| e.get(key).cloned() != id);
            continue;
        }
        match existing.iter_mut().find(|e| e.get(key).cloned() == id) {
            Some(entry) => apply_strategic_merge(entry, item),
            None => existing.push(item.clone()),
        }
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::from(api_error(
        404,
        REASON_NOT_FOUND,
        &format!("{} \"{}\" not found", kind, name),
    ))
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Default)]
struct NodeStore {
    nodes: HashMap<String, Node>,
    version: u64,
    fail_patches: Vec<Error>,
}

/// In-memory node API
#[derive(Default)]
pub struct FakeNodeApi {
    store: Mutex<NodeStore>,
    creates: AtomicU64,
    patches: AtomicU64,
}

impl FakeNodeApi {
    /// Empty API with no nodes
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current stored body of a node
    pub fn node(&self, name: &str) -> Option<Node> {
        self.store.lock().nodes.get(name).cloned()
    }

    /// Store a node as if another actor had created it
    pub fn insert(&self, mut node: Node) {
        let mut store = self.store.lock();
        store.version += 1;
        let name = node.metadata.name.clone().unwrap_or_default();
        node.metadata.uid.get_or_insert_with(|| format!("uid-{}", name));
        node.metadata.resource_version = Some(store.version.to_string());
        store.nodes.insert(name, node);
    }

    /// Patch a node as another actor would (any subresource)
    pub fn external_patch(&self, name: &str, patch: &Value) -> Result<Node> {
        self.apply(name, patch)
    }

    /// Make the next patch fail with `err`; queued errors are used in order
    pub fn fail_next_patch(&self, err: Error) {
        self.store.lock().fail_patches.push(err);
    }

    /// Number of successful creates
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful status patches
    pub fn patches(&self) -> u64 {
        self.patches.load(Ordering::SeqCst)
    }

    fn apply(&self, name: &str, patch: &Value) -> Result<Node> {
        let mut store = self.store.lock();
        let current = store
            .nodes
            .get(name)
            .ok_or_else(|| not_found("nodes", name))?;
        let mut value = serde_json::to_value(current)?;
        apply_strategic_merge(&mut value, patch);
        let mut node: Node = serde_json::from_value(value)?;
        store.version += 1;
        node.metadata.resource_version = Some(store.version.to_string());
        store.nodes.insert(name.to_string(), node.clone());
        Ok(node)
    }
}

#[async_trait]
impl NodeClient for FakeNodeApi {
    async fn get(&self, name: &str) -> Result<Node> {
        self.node(name).ok_or_else(|| not_found("nodes", name))
    }

    async fn create(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.clone().unwrap_or_default();
        if self.store.lock().nodes.contains_key(&name) {
            return Err(Error::from(api_error(
                409,
                REASON_ALREADY_EXISTS,
                &format!("nodes \"{}\" already exists", name),
            )));
        }
        self.insert(node.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.get(&name).await
    }

    async fn patch_status(&self, name: &str, patch: &Value) -> Result<Node> {
        let injected = {
            let mut store = self.store.lock();
            if store.fail_patches.is_empty() {
                None
            } else {
                Some(store.fail_patches.remove(0))
            }
        };
        if let Some(err) = injected {
            return Err(err);
        }
        let node = self.apply(name, patch)?;
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(node)
    }
}

// =============================================================================
// Leases
// =============================================================================

#[derive(Default)]
struct LeaseStore {
    leases: HashMap<String, Lease>,
    version: u64,
}

/// In-memory lease API for the node-lease namespace
#[derive(Default)]
pub struct FakeLeaseApi {
    store: Mutex<LeaseStore>,
    unsupported: AtomicBool,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl FakeLeaseApi {
    /// Empty lease API
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lease API whose resource does not exist on the server
    pub fn unsupported() -> Arc<Self> {
        let api = Self::default();
        api.unsupported.store(true, Ordering::SeqCst);
        Arc::new(api)
    }

    /// Current stored lease
    pub fn lease(&self, name: &str) -> Option<Lease> {
        self.store.lock().leases.get(name).cloned()
    }

    /// Store a lease as if another actor had created it
    pub fn insert(&self, mut lease: Lease) {
        let mut store = self.store.lock();
        store.version += 1;
        lease.metadata.resource_version = Some(store.version.to_string());
        let name = lease.metadata.name.clone().unwrap_or_default();
        store.leases.insert(name, lease);
    }

    /// Remove a lease as garbage collection would
    pub fn remove(&self, name: &str) {
        self.store.lock().leases.remove(name);
    }

    /// Bump a lease's resourceVersion as a concurrent writer would
    pub fn touch(&self, name: &str) {
        let mut store = self.store.lock();
        store.version += 1;
        let version = store.version.to_string();
        if let Some(lease) = store.leases.get_mut(name) {
            lease.metadata.resource_version = Some(version);
        }
    }

    /// Number of successful creates
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful updates
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of successful deletes
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check_supported(&self) -> Result<()> {
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(Error::from(api_error(
                404,
                REASON_NOT_FOUND,
                "the server could not find the requested resource",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseClient for FakeLeaseApi {
    async fn get(&self, name: &str) -> Result<Lease> {
        self.check_supported()?;
        self.lease(name).ok_or_else(|| not_found("leases", name))
    }

    async fn create(&self, lease: &Lease) -> Result<Lease> {
        self.check_supported()?;
        let name = lease.metadata.name.clone().unwrap_or_default();
        if self.store.lock().leases.contains_key(&name) {
            return Err(Error::from(api_error(
                409,
                REASON_ALREADY_EXISTS,
                &format!("leases \"{}\" already exists", name),
            )));
        }
        self.insert(lease.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.get(&name).await
    }

    async fn update(&self, lease: &Lease) -> Result<Lease> {
        self.check_supported()?;
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut store = self.store.lock();
        let current = store
            .leases
            .get(&name)
            .ok_or_else(|| not_found("leases", &name))?;
        if let Some(expected) = lease.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::from(api_error(
                    409,
                    REASON_CONFLICT,
                    "the object has been modified; please apply your changes to the latest version",
                )));
            }
        }
        store.version += 1;
        let mut updated = lease.clone();
        updated.metadata.resource_version = Some(store.version.to_string());
        store.leases.insert(name, updated.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.check_supported()?;
        self.store
            .lock()
            .leases
            .remove(name)
            .ok_or_else(|| not_found("leases", name))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Scriptable node provider
///
/// Counts pings atomically, records when each ping started, and exposes the
/// registered status callback so tests can push node bodies.
#[derive(Default)]
pub struct TestNodeProvider {
    pings: AtomicU64,
    ping_times: Mutex<Vec<Instant>>,
    failing: AtomicBool,
    callback: Mutex<Option<NodeStatusCallback>>,
}

impl TestNodeProvider {
    /// Healthy provider
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of pings received
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Start instant of every ping, in order
    pub fn ping_times(&self) -> Vec<Instant> {
        self.ping_times.lock().clone()
    }

    /// Make subsequent pings fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// True once the controller registered its status callback
    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Push a node body through the registered callback
    ///
    /// Returns false when no callback is registered yet.
    pub fn push(&self, node: Node) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(cb) => {
                cb(node);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl NodeProvider for TestNodeProvider {
    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.ping_times.lock().push(Instant::now());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::provider("provider unreachable"));
        }
        Ok(())
    }

    fn notify_node_status(&self, _ctx: CancellationToken, callback: NodeStatusCallback) {
        *self.callback.lock() = Some(callback);
    }
}
