//! Per-pod bookkeeping shared by the spec and status pipelines

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct KnownPodState {
    last_spec: Option<Pod>,
    last_status: Option<Pod>,
}

/// Bookkeeping for one pod on the virtual node
///
/// Statuses arrive from the provider concurrently with spec reconciliation,
/// so each entry carries its own lock.
#[derive(Debug, Default)]
pub struct KnownPod {
    state: Mutex<KnownPodState>,
}

impl KnownPod {
    /// Remember the pod spec last handed to the provider
    pub fn record_spec(&self, pod: Pod) {
        self.state.lock().last_spec = Some(pod);
    }

    /// Pod spec last handed to the provider
    pub fn last_spec(&self) -> Option<Pod> {
        self.state.lock().last_spec.clone()
    }

    /// Remember the latest pod reported by the provider
    pub fn record_status(&self, pod: Pod) {
        self.state.lock().last_status = Some(pod);
    }

    /// Latest pod reported by the provider
    pub fn last_status(&self) -> Option<Pod> {
        self.state.lock().last_status.clone()
    }
}

/// Map of known pods keyed by `namespace/name`
#[derive(Clone, Debug, Default)]
pub struct KnownPods {
    pods: Arc<DashMap<String, Arc<KnownPod>>>,
}

impl KnownPods {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key`, created if missing
    pub fn ensure(&self, key: &str) -> Arc<KnownPod> {
        self.pods
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KnownPod::default()))
            .clone()
    }

    /// Entry for `key`, if the pod is known
    pub fn get(&self, key: &str) -> Option<Arc<KnownPod>> {
        self.pods.get(key).map(|entry| entry.value().clone())
    }

    /// Forget `key`, returning its entry
    pub fn remove(&self, key: &str) -> Option<Arc<KnownPod>> {
        self.pods.remove(key).map(|(_, pod)| pod)
    }

    /// Number of known pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// Returns true if no pod is known
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}
