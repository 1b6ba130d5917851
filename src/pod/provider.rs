//! Provider interface and the status channel back from it

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::known::KnownPods;
use super::pod_key;
use crate::ProviderError;

/// Execution surface for pods scheduled on the virtual node
///
/// Implementations classify their failures into [`crate::ProviderErrorKind`];
/// the subsystem never inspects backend-specific error encodings. Calls may be
/// retried, so implementations must tolerate repeats.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Pod as the provider knows it, `None` if it does not
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ProviderError>;

    /// Start running `pod`
    async fn create_pod(&self, pod: &Pod) -> Result<(), ProviderError>;

    /// Apply the mutable fields of `pod` to the running pod
    async fn update_pod(&self, pod: &Pod) -> Result<(), ProviderError>;

    /// Stop and forget `pod`
    async fn delete_pod(&self, pod: &Pod) -> Result<(), ProviderError>;

    /// Start reporting pod statuses through `reporter`
    async fn notify_pods(&self, reporter: PodStatusReporter);
}

/// Handle the provider uses to push pod statuses back
#[derive(Clone)]
pub struct PodStatusReporter {
    known: KnownPods,
    status: UnboundedSender<String>,
    deletion: UnboundedSender<String>,
}

impl PodStatusReporter {
    pub(crate) fn new(
        known: KnownPods,
        status: UnboundedSender<String>,
        deletion: UnboundedSender<String>,
    ) -> Self {
        Self {
            known,
            status,
            deletion,
        }
    }

    /// Record the latest state of `pod` and schedule a status write.
    ///
    /// Reports for pods the subsystem does not know are dropped.
    pub fn report(&self, pod: Pod) {
        let key = pod_key(&pod);
        let Some(entry) = self.known.get(&key) else {
            debug!(%key, "Status report for unknown pod dropped");
            return;
        };
        entry.record_status(pod);
        if self.status.unbounded_send(key).is_err() {
            debug!("Status sync stopped, report kept for the next start");
        }
    }

    /// The provider no longer runs the pod at `key`; remove the local object
    pub fn report_deleted(&self, key: String) {
        if self.deletion.unbounded_send(key).is_err() {
            debug!("Deletion sync stopped, report dropped");
        }
    }
}
