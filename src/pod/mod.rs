//! Pod reflection subsystem
//!
//! Pods scheduled on the virtual node are forwarded to a [`Provider`], the
//! execution surface standing for the remote cluster. Two independent
//! pipelines run per node:
//!
//! - spec sync: local pod changes become provider create/update/delete calls
//! - status sync: statuses reported by the provider are written back to the
//!   local pods
//!
//! The two writers never conflict: spec sync skips provider updates for pods
//! equal under [`pods_equal`], and status sync blindly overwrites the status
//! subresource, which nothing else writes for pods on the virtual node.

mod controller;
mod env;
mod equality;
mod known;
mod provider;
mod remote;

pub use controller::{KubeLocalPods, LocalPods, PodController};
pub use env::{expand_references, populate_environment_variables, EnvSource, KubeEnvSource};
pub use equality::pods_equal;
pub use known::{KnownPod, KnownPods};
pub use provider::{PodStatusReporter, Provider};
pub use remote::KubeProvider;

#[cfg(test)]
pub use controller::MockLocalPods;
#[cfg(test)]
pub use env::MockEnvSource;
#[cfg(test)]
pub use provider::MockProvider;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::feed::object_key;

/// Status reason set on pods the provider failed to run
pub const PROVIDER_FAILED_REASON: &str = "ProviderFailed";

/// Resource version that makes a status write unconditional
pub const UNCONDITIONAL_RESOURCE_VERSION: &str = "0";

/// Key (`namespace/name`) of a pod
pub fn pod_key(pod: &Pod) -> String {
    object_key(pod.namespace().as_deref(), &pod.name_any())
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Returns true if the pod is in the `Running` phase
pub fn is_pod_running(pod: &Pod) -> bool {
    phase(pod) == Some("Running")
}

/// Returns true if the pod has a `Ready` condition set to `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Terminal or provider-failed pods keep their status as is
pub fn should_skip_status_update(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
        || pod.status.as_ref().and_then(|s| s.reason.as_deref()) == Some(PROVIDER_FAILED_REASON)
}

/// Name of the node `pod` is bound to
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> PodCondition {
        PodCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_follows_the_ready_condition() {
        let ready = with_status(PodStatus {
            conditions: Some(vec![
                condition("foo", "False"),
                condition("bar", "True"),
                condition("Ready", "True"),
            ]),
            ..Default::default()
        });
        assert!(is_pod_ready(&ready));

        let not_ready = with_status(PodStatus {
            conditions: Some(vec![condition("Ready", "False")]),
            ..Default::default()
        });
        assert!(!is_pod_ready(&not_ready));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test]
    fn terminal_and_failed_pods_skip_status_updates() {
        for phase in ["Succeeded", "Failed"] {
            let pod = with_status(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            assert!(should_skip_status_update(&pod), "{phase}");
        }

        let provider_failed = with_status(PodStatus {
            phase: Some("Pending".to_string()),
            reason: Some(PROVIDER_FAILED_REASON.to_string()),
            ..Default::default()
        });
        assert!(should_skip_status_update(&provider_failed));

        let running = with_status(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(!should_skip_status_update(&running));
        assert!(is_pod_running(&running));
    }
}
