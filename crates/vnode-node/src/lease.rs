//! Node heartbeat lease
//!
//! The lease lives in `kube-node-lease`, is named after the node and owned by
//! it, so it is garbage collected with the node. `holderIdentity` is the node
//! name and the lease is valid for five ping intervals.
//!
//! # Restart recovery
//!
//! A lease left over from a previous run (ours or anyone else's) is deleted
//! and recreated rather than adopted, so its spec always matches our
//! configuration.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};
use std::sync::Arc;
use tracing::{debug, info, warn};

use vnode_common::metrics::{Outcome, LEASE_RENEWALS};
use vnode_common::{Result, NODE_LEASE_NAMESPACE};

use crate::client::LeaseClient;

/// Immediate update attempts per renewal before waiting for the next interval
pub const MAX_RENEW_ATTEMPTS: u32 = 5;

/// Lease validity as a multiple of the ping interval
const LEASE_DURATION_FACTOR: u32 = 5;

/// Whole seconds covering `LEASE_DURATION_FACTOR` ping intervals, rounded up
/// and saturated to the API field's range
fn lease_duration_seconds(ping_interval: Duration) -> i32 {
    let total = ping_interval.saturating_mul(LEASE_DURATION_FACTOR);
    let secs = total.as_secs().saturating_add(u64::from(total.subsec_nanos() > 0));
    i32::try_from(secs).unwrap_or(i32::MAX)
}

/// Lease body for `node`, without a renew time
///
/// The owner reference is only set when the node has a UID, i.e. once it has
/// been registered.
pub fn base_lease(node: &Node, ping_interval: Duration) -> Lease {
    let name = node.metadata.name.clone().unwrap_or_default();
    let duration = lease_duration_seconds(ping_interval);
    let owner = node.metadata.uid.clone().map(|uid| OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: name.clone(),
        uid,
        ..Default::default()
    });

    Lease {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(name),
            lease_duration_seconds: Some(duration.max(1)),
            ..Default::default()
        }),
    }
}

/// Owns the node's lease: creation, restart recovery and renewal
pub struct NodeLease {
    client: Arc<dyn LeaseClient>,
    base: Lease,
    latest: Option<Lease>,
}

impl NodeLease {
    /// Manage the lease for `node`
    pub fn new(client: Arc<dyn LeaseClient>, node: &Node, ping_interval: Duration) -> Self {
        Self {
            client,
            base: base_lease(node, ping_interval),
            latest: None,
        }
    }

    fn name(&self) -> &str {
        self.base.metadata.name.as_deref().unwrap_or_default()
    }

    /// Last lease body returned by the server
    pub fn latest(&self) -> Option<&Lease> {
        self.latest.as_ref()
    }

    fn stamped(&self) -> Lease {
        let mut lease = self.base.clone();
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        lease
    }

    /// Create the lease
    ///
    /// Returns `Ok(false)` when the server has no lease API, in which case
    /// the caller falls back to status-only heartbeats.
    pub async fn ensure(&mut self) -> Result<bool> {
        let lease = self.stamped();
        match self.client.create(&lease).await {
            Ok(created) => {
                debug!(lease = %self.name(), "Created node lease");
                self.latest = Some(created);
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    lease = %self.name(),
                    error = %e,
                    "Node leases are not supported, falling back to status updates"
                );
                Ok(false)
            }
            Err(e) if e.is_already_exists() => {
                self.replace_existing(&lease).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn replace_existing(&mut self, lease: &Lease) -> Result<()> {
        match self.client.get(self.name()).await {
            Ok(existing) => {
                let holder = existing
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.as_deref());
                if holder != Some(self.name()) {
                    warn!(
                        lease = %self.name(),
                        holder = holder.unwrap_or("<none>"),
                        "Node lease is held by another identity, taking it over"
                    );
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        info!(lease = %self.name(), "Replacing node lease left from a previous run");
        match self.client.delete(self.name()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.latest = Some(self.client.create(lease).await?);
        Ok(())
    }

    /// Bump `renewTime`
    ///
    /// Conflicts refetch the lease and retry immediately, up to
    /// [`MAX_RENEW_ATTEMPTS`] attempts. A missing lease is recreated.
    pub async fn renew(&mut self) -> Result<()> {
        let result = self.try_renew().await;
        LEASE_RENEWALS.add(1, &Outcome::of(&result).labels());
        result
    }

    async fn try_renew(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut lease = self.stamped();
            lease.metadata.resource_version = self
                .latest
                .as_ref()
                .and_then(|l| l.metadata.resource_version.clone());

            match self.client.update(&lease).await {
                Ok(updated) => {
                    self.latest = Some(updated);
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    info!(lease = %self.name(), "Node lease disappeared, recreating");
                    self.ensure().await?;
                    return Ok(());
                }
                Err(e) if attempt < MAX_RENEW_ATTEMPTS => {
                    debug!(
                        lease = %self.name(),
                        attempt,
                        error = %e,
                        "Lease renewal failed, retrying"
                    );
                    if e.is_conflict() {
                        match self.client.get(self.name()).await {
                            Ok(fresh) => self.latest = Some(fresh),
                            Err(e) => debug!(error = %e, "Could not refetch lease"),
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        lease = %self.name(),
                        attempts = attempt,
                        error = %e,
                        "Lease renewal failed, waiting for next interval"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLeaseClient;
    use crate::testing::FakeLeaseApi;
    use vnode_common::kube_utils::api_error;
    use vnode_common::Error;

    fn registered_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("testnode".to_string()),
                uid: Some("node-uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn holder(lease: &Lease) -> Option<&str> {
        lease.spec.as_ref()?.holder_identity.as_deref()
    }

    #[test]
    fn test_base_lease_shape() {
        let lease = base_lease(&registered_node(), Duration::from_secs(10));
        assert_eq!(lease.metadata.name.as_deref(), Some("testnode"));
        assert_eq!(lease.metadata.namespace.as_deref(), Some("kube-node-lease"));
        let owner = &lease.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.uid, "node-uid-1");
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("testnode"));
        assert_eq!(spec.lease_duration_seconds, Some(50));
        assert!(spec.renew_time.is_none());
    }

    #[test]
    fn test_lease_duration_rounds_up_and_saturates() {
        assert_eq!(lease_duration_seconds(Duration::from_millis(1500)), 8);
        assert_eq!(lease_duration_seconds(Duration::from_secs(u64::MAX / 2)), i32::MAX);
        assert_eq!(lease_duration_seconds(Duration::MAX), i32::MAX);
    }

    #[test]
    fn test_short_ping_interval_still_yields_positive_duration() {
        let lease = base_lease(&registered_node(), Duration::from_millis(10));
        assert_eq!(lease.spec.unwrap().lease_duration_seconds, Some(1));
    }

    #[tokio::test]
    async fn test_ensure_creates_lease() {
        let api = FakeLeaseApi::new();
        let mut lease = NodeLease::new(api.clone(), &registered_node(), Duration::from_secs(10));
        assert!(lease.ensure().await.unwrap());
        let stored = api.lease("testnode").unwrap();
        assert!(stored.spec.unwrap().renew_time.is_some());
        assert_eq!(api.creates(), 1);
    }

    #[tokio::test]
    async fn test_missing_lease_api_falls_back_to_status_only() {
        let api = FakeLeaseApi::unsupported();
        let mut lease = NodeLease::new(api, &registered_node(), Duration::from_secs(10));
        assert!(!lease.ensure().await.unwrap());
    }

    /// Story: after a crash someone else's lease is squashed
    #[tokio::test]
    async fn story_foreign_lease_is_replaced_on_restart() {
        let api = FakeLeaseApi::new();
        let mut foreign = base_lease(&registered_node(), Duration::from_secs(10));
        foreign.spec.as_mut().unwrap().holder_identity = Some("someone-else".to_string());
        api.insert(foreign);

        let mut lease = NodeLease::new(api.clone(), &registered_node(), Duration::from_secs(10));
        assert!(lease.ensure().await.unwrap());
        assert_eq!(api.deletes(), 1);
        assert_eq!(holder(&api.lease("testnode").unwrap()), Some("testnode"));
    }

    #[tokio::test]
    async fn test_renew_updates_renew_time() {
        let api = FakeLeaseApi::new();
        let mut lease = NodeLease::new(api.clone(), &registered_node(), Duration::from_secs(10));
        lease.ensure().await.unwrap();
        let before = api.lease("testnode").unwrap().spec.unwrap().renew_time.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        lease.renew().await.unwrap();
        let after = api.lease("testnode").unwrap().spec.unwrap().renew_time.unwrap();
        assert!(after.0 > before.0);
        assert_eq!(api.updates(), 1);
    }

    #[tokio::test]
    async fn test_renew_recovers_from_conflict() {
        let api = FakeLeaseApi::new();
        let mut lease = NodeLease::new(api.clone(), &registered_node(), Duration::from_secs(10));
        lease.ensure().await.unwrap();
        api.touch("testnode");

        lease.renew().await.unwrap();
        assert_eq!(api.updates(), 1);
    }

    #[tokio::test]
    async fn test_renew_recreates_garbage_collected_lease() {
        let api = FakeLeaseApi::new();
        let mut lease = NodeLease::new(api.clone(), &registered_node(), Duration::from_secs(10));
        lease.ensure().await.unwrap();
        api.remove("testnode");

        lease.renew().await.unwrap();
        assert_eq!(api.creates(), 2);
        assert!(api.lease("testnode").is_some());
    }

    #[tokio::test]
    async fn test_renew_gives_up_after_five_attempts() {
        let mut client = MockLeaseClient::new();
        client
            .expect_update()
            .times(MAX_RENEW_ATTEMPTS as usize)
            .returning(|_| Err(Error::from(api_error(500, "InternalError", "etcd timeout"))));
        client.expect_get().never();

        let mut lease = NodeLease::new(Arc::new(client), &registered_node(), Duration::from_secs(10));
        let err = lease.renew().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_conflicts_refetch_before_each_retry() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let mut client = MockLeaseClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        client.expect_update().times(2).returning(move |l| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::from(api_error(409, "Conflict", "stale")));
            }
            assert_eq!(l.metadata.resource_version.as_deref(), Some("42"));
            Ok(l.clone())
        });
        client.expect_get().times(1).returning(|_| {
            let mut fresh = base_lease(&registered_node(), Duration::from_secs(10));
            fresh.metadata.resource_version = Some("42".to_string());
            Ok(fresh)
        });

        let mut lease = NodeLease::new(Arc::new(client), &registered_node(), Duration::from_secs(10));
        lease.renew().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
