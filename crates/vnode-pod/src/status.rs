//! Pod status helpers
//!
//! Phase checks and the statuses the controller writes on the provider's
//! behalf: provider failures, synthesized terminations and pods the provider
//! lost.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Phase of a pod that completed successfully
pub const PHASE_SUCCEEDED: &str = "Succeeded";
/// Phase of a pod that failed
pub const PHASE_FAILED: &str = "Failed";
/// Phase of a pod not yet running
pub const PHASE_PENDING: &str = "Pending";
/// Phase of a running pod
pub const PHASE_RUNNING: &str = "Running";

/// Status reason written when the provider rejects a pod
pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";
/// Status reason for a pod the provider no longer knows
pub const REASON_NOT_FOUND: &str = "NotFound";
/// Container termination reason for a pod deleted through the provider
pub const REASON_TERMINATED: &str = "Terminated";

const MESSAGE_POD_NOT_FOUND: &str =
    "The pod status was not found and may have been deleted from the provider";
const MESSAGE_CONTAINER_NOT_FOUND: &str = "Container was not found and was likely deleted";

/// Exit code reported for containers of a pod the provider lost
pub const EXIT_CODE_NOT_FOUND: i32 = -137;

/// Phase of a pod, if reported
pub fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Status reason of a pod, if reported
pub fn reason(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.reason.as_deref()
}

/// True once the pod reached `Succeeded` or `Failed`
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(phase(pod), Some(PHASE_SUCCEEDED | PHASE_FAILED))
}

/// True when any container is still running
///
/// Containers without a reported state count as not running.
pub fn has_running_containers(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses
                .iter()
                .any(|c| c.state.as_ref().is_some_and(|s| s.running.is_some()))
        })
}

/// Record a provider failure in the pod's status
///
/// Pods that will never be restarted fail outright; everything else stays
/// pending so the next reconcile can try again.
pub fn mark_provider_failed(pod: &mut Pod, message: &str) {
    let never_restart = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        == Some("Never");
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(if never_restart { PHASE_FAILED } else { PHASE_PENDING }.to_string());
    status.reason = Some(REASON_PROVIDER_FAILED.to_string());
    status.message = Some(message.to_string());
}

/// Terminal status for a pod the provider deleted
///
/// Running containers are terminated as of `now`.
pub fn mark_terminated(pod: &mut Pod, now: DateTime<Utc>) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(PHASE_SUCCEEDED.to_string());
    let terminated = ContainerStateTerminated {
        reason: Some(REASON_TERMINATED.to_string()),
        ..Default::default()
    };
    terminate_running(status, now, &terminated);
}

/// Failed status for a pod the provider no longer reports
pub fn mark_not_found(pod: &mut Pod, now: DateTime<Utc>) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(PHASE_FAILED.to_string());
    status.reason = Some(REASON_NOT_FOUND.to_string());
    status.message = Some(MESSAGE_POD_NOT_FOUND.to_string());
    let terminated = ContainerStateTerminated {
        exit_code: EXIT_CODE_NOT_FOUND,
        reason: Some(REASON_NOT_FOUND.to_string()),
        message: Some(MESSAGE_CONTAINER_NOT_FOUND.to_string()),
        ..Default::default()
    };
    terminate_running(status, now, &terminated);
}

fn terminate_running(status: &mut PodStatus, now: DateTime<Utc>, terminated: &ContainerStateTerminated) {
    let Some(containers) = status.container_statuses.as_mut() else {
        return;
    };
    for container in containers {
        let Some(running) = container.state.as_ref().and_then(|s| s.running.clone()) else {
            continue;
        };
        let mut state = terminated.clone();
        state.started_at = running.started_at;
        state.finished_at = Some(Time(now));
        state.container_id = container.container_id.clone();
        container.state = Some(ContainerState {
            terminated: Some(state),
            ..Default::default()
        });
        container.ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStateRunning, ContainerStatus, PodSpec};

    fn running_pod() -> Pod {
        Pod {
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some(PHASE_RUNNING.to_string()),
                container_statuses: Some(vec![
                    ContainerStatus {
                        name: "app".to_string(),
                        ready: true,
                        state: Some(ContainerState {
                            running: Some(ContainerStateRunning::default()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ContainerStatus {
                        name: "done".to_string(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: 0,
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(pod: &Pod, index: usize) -> ContainerStateTerminated {
        pod.status.as_ref().unwrap().container_statuses.as_ref().unwrap()[index]
            .state
            .as_ref()
            .unwrap()
            .terminated
            .clone()
            .unwrap()
    }

    #[test]
    fn test_running_and_terminal_checks() {
        let mut pod = running_pod();
        assert!(has_running_containers(&pod));
        assert!(!is_terminal(&pod));

        mark_terminated(&mut pod, Utc::now());
        assert!(!has_running_containers(&pod));
        assert!(is_terminal(&pod));
    }

    #[test]
    fn test_provider_failure_respects_restart_policy() {
        let mut pod = running_pod();
        mark_provider_failed(&mut pod, "quota exceeded");
        assert_eq!(phase(&pod), Some(PHASE_PENDING));
        assert_eq!(reason(&pod), Some(REASON_PROVIDER_FAILED));

        pod.spec.as_mut().unwrap().restart_policy = Some("Never".to_string());
        mark_provider_failed(&mut pod, "quota exceeded");
        assert_eq!(phase(&pod), Some(PHASE_FAILED));
        assert_eq!(
            pod.status.unwrap().message.as_deref(),
            Some("quota exceeded")
        );
    }

    #[test]
    fn test_terminated_only_touches_running_containers() {
        let mut pod = running_pod();
        let now = Utc::now();
        mark_terminated(&mut pod, now);

        let app = terminated(&pod, 0);
        assert_eq!(app.reason.as_deref(), Some(REASON_TERMINATED));
        assert_eq!(app.finished_at, Some(Time(now)));
        assert!(terminated(&pod, 1).reason.is_none());
    }

    #[test]
    fn test_not_found_uses_sigkill_exit_code() {
        let mut pod = running_pod();
        mark_not_found(&mut pod, Utc::now());
        assert_eq!(phase(&pod), Some(PHASE_FAILED));
        assert_eq!(reason(&pod), Some(REASON_NOT_FOUND));
        assert_eq!(terminated(&pod, 0).exit_code, EXIT_CODE_NOT_FOUND);
    }
}
