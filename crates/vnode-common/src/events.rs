//! Kubernetes Event recording for vnode controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe pod`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given object.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "OptionalConfigMapNotFound")
    /// * `action` - What action was taken (e.g. "ResolveEnvironment")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given component.
    ///
    /// `instance` is usually the virtual node name so events from different
    /// virtual nodes can be told apart.
    pub fn new(client: Client, component: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the involved object
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, for assertions in tests.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingEventPublisher {
    /// All events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reasons of all events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Environment resolution
    /// Optional envFrom ConfigMap does not exist
    pub const OPTIONAL_CONFIGMAP_NOT_FOUND: &str = "OptionalConfigMapNotFound";
    /// Optional ConfigMap key reference does not exist
    pub const OPTIONAL_CONFIGMAP_KEY_NOT_FOUND: &str = "OptionalConfigMapKeyNotFound";
    /// Reading a mandatory ConfigMap failed for a reason other than 404
    pub const FAILED_TO_READ_MANDATORY_CONFIGMAP: &str = "FailedToReadMandatoryConfigMap";
    /// Mandatory ConfigMap does not exist
    pub const MANDATORY_CONFIGMAP_NOT_FOUND: &str = "MandatoryConfigMapNotFound";
    /// Mandatory ConfigMap key reference does not exist
    pub const MANDATORY_CONFIGMAP_KEY_NOT_FOUND: &str = "MandatoryConfigMapKeyNotFound";
    /// Optional envFrom Secret does not exist
    pub const OPTIONAL_SECRET_NOT_FOUND: &str = "OptionalSecretNotFound";
    /// Optional Secret key reference does not exist
    pub const OPTIONAL_SECRET_KEY_NOT_FOUND: &str = "OptionalSecretKeyNotFound";
    /// Reading a mandatory Secret failed for a reason other than 404
    pub const FAILED_TO_READ_MANDATORY_SECRET: &str = "FailedToReadMandatorySecret";
    /// Mandatory Secret does not exist
    pub const MANDATORY_SECRET_NOT_FOUND: &str = "MandatorySecretNotFound";
    /// Mandatory Secret key reference does not exist
    pub const MANDATORY_SECRET_KEY_NOT_FOUND: &str = "MandatorySecretKeyNotFound";
    /// Some keys could not be used as environment variable names
    pub const INVALID_ENVIRONMENT_VARIABLE_NAMES: &str = "InvalidEnvironmentVariableNames";

    // Pod lifecycle
    /// The provider rejected a create/update
    pub const PROVIDER_FAILED: &str = "ProviderFailed";
    /// A pod present only in the provider was deleted at startup
    pub const DANGLING_POD_DELETED: &str = "DanglingPodDeleted";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Materializing container environments
    pub const RESOLVE_ENVIRONMENT: &str = "ResolveEnvironment";
    /// Creating or updating a pod in the provider
    pub const SYNC_POD: &str = "SyncPod";
    /// Deleting a pod in the provider
    pub const DELETE_POD: &str = "DeletePod";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[test]
    fn reason_constants_match_kubelet_wording() {
        assert_eq!(reasons::OPTIONAL_CONFIGMAP_NOT_FOUND, "OptionalConfigMapNotFound");
        assert_eq!(reasons::MANDATORY_SECRET_KEY_NOT_FOUND, "MandatorySecretKeyNotFound");
        assert_eq!(
            reasons::INVALID_ENVIRONMENT_VARIABLE_NAMES,
            "InvalidEnvironmentVariableNames"
        );
    }

    #[tokio::test]
    async fn recording_publisher_captures_events_in_order() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference {
            name: Some("my-pod".to_string()),
            ..Default::default()
        };
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::OPTIONAL_SECRET_NOT_FOUND,
                actions::RESOLVE_ENVIRONMENT,
                Some("secret default/creds not found".to_string()),
            )
            .await;
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::DANGLING_POD_DELETED,
                actions::DELETE_POD,
                None,
            )
            .await;

        let events = publisher.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].warning);
        assert_eq!(events[0].object.as_deref(), Some("my-pod"));
        assert_eq!(
            publisher.reasons(),
            vec!["OptionalSecretNotFound", "DanglingPodDeleted"]
        );
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::PROVIDER_FAILED,
                actions::SYNC_POD,
                Some("test".to_string()),
            )
            .await;
    }
}
