//! Pod comparisons that decide whether a reconcile has work to do

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};

/// Same pod except for status and resourceVersion
///
/// Used to skip reconciles triggered by our own status writes.
pub fn effectively_equal(a: &Pod, b: &Pod) -> bool {
    let mut left = a.metadata.clone();
    let mut right = b.metadata.clone();
    left.resource_version = None;
    right.resource_version = None;
    left.managed_fields = None;
    right.managed_fields = None;
    left == right && a.spec == b.spec
}

/// True when a field the sync handler acts on changed between two versions
pub fn spec_changed(old: &Pod, new: &Pod) -> bool {
    let (o, n) = (old.spec.as_ref(), new.spec.as_ref());
    containers(o) != containers(n)
        || init_containers(o) != init_containers(n)
        || o.and_then(|s| s.active_deadline_seconds) != n.and_then(|s| s.active_deadline_seconds)
        || o.and_then(|s| s.tolerations.as_ref()) != n.and_then(|s| s.tolerations.as_ref())
        || old.metadata.labels != new.metadata.labels
        || old.metadata.annotations != new.metadata.annotations
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.deletion_grace_period_seconds
            != new.metadata.deletion_grace_period_seconds
}

/// True when the provider's copy differs from the API pod in a field that
/// may change after creation
pub fn needs_provider_update(api: &Pod, provider: &Pod) -> bool {
    let (a, p) = (api.spec.as_ref(), provider.spec.as_ref());
    images(containers(a)) != images(containers(p))
        || images(init_containers(a)) != images(init_containers(p))
        || a.and_then(|s| s.active_deadline_seconds) != p.and_then(|s| s.active_deadline_seconds)
        || a.and_then(|s| s.tolerations.as_ref()) != p.and_then(|s| s.tolerations.as_ref())
        || api.metadata.labels != provider.metadata.labels
        || api.metadata.annotations != provider.metadata.annotations
}

fn containers(spec: Option<&PodSpec>) -> &[Container] {
    spec.map(|s| s.containers.as_slice()).unwrap_or_default()
}

fn init_containers(spec: Option<&PodSpec>) -> &[Container] {
    spec.and_then(|s| s.init_containers.as_deref())
        .unwrap_or_default()
}

fn images(containers: &[Container]) -> Vec<Option<&str>> {
    containers.iter().map(|c| c.image.as_deref()).collect()
}
