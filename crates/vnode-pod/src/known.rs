//! Per-pod bookkeeping shared between event handlers and queue workers
//!
//! Records are locked briefly and never across an `.await`, and no code path
//! holds two record locks at once.

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;

/// What the controller remembers about one pod
#[derive(Debug, Default)]
pub struct KnownPod {
    /// API body last handed to the provider
    pub last_reconciled: Option<Arc<Pod>>,
    /// Latest pod pushed by the provider
    pub last_provider_pod: Option<Pod>,
    /// The last status write was skipped because the API pod was terminal
    pub status_suppressed: bool,
}

/// Shared handle to a [`KnownPod`]
pub type KnownPodRef = Arc<Mutex<KnownPod>>;

/// Records for every pod the informer has reported, keyed `namespace/name`
#[derive(Clone, Default)]
pub struct KnownPods {
    records: Arc<DashMap<String, KnownPodRef>>,
}

impl KnownPods {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `key`, created if missing
    pub fn track(&self, key: &str) -> KnownPodRef {
        self.records.entry(key.to_string()).or_default().clone()
    }

    /// Record for `key`, if tracked
    pub fn get(&self, key: &str) -> Option<KnownPodRef> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Stop tracking `key`
    pub fn remove(&self, key: &str) -> Option<KnownPodRef> {
        self.records.remove(key).map(|(_, r)| r)
    }

    /// Number of tracked pods
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no pod is tracked
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_is_idempotent() {
        let known = KnownPods::new();
        let first = known.track("default/web");
        first.lock().status_suppressed = true;

        let second = known.track("default/web");
        assert!(second.lock().status_suppressed);
        assert_eq!(known.len(), 1);

        assert!(known.remove("default/web").is_some());
        assert!(known.get("default/web").is_none());
        assert!(known.is_empty());
    }
}
