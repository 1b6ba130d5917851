//! Peering phase source for one remote cluster
//!
//! The phase itself is produced by the peering collaborator (discovery and
//! authentication are outside this crate). The dispatcher only consumes it:
//! it reads the current value when registering reflectors and re-evaluates
//! registrations whenever the phase changes.

use tokio::sync::watch;
use tracing::info;

use crate::crd::PeeringPhase;

/// Current peering phase of one remote cluster, with change notification
#[derive(Debug)]
pub struct PeeringState {
    cluster_id: String,
    tx: watch::Sender<PeeringPhase>,
}

impl PeeringState {
    /// Create a peering state starting at `initial`
    pub fn new(cluster_id: impl Into<String>, initial: PeeringPhase) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            cluster_id: cluster_id.into(),
            tx,
        }
    }

    /// Remote cluster this state belongs to
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Current phase
    pub fn phase(&self) -> PeeringPhase {
        *self.tx.borrow()
    }

    /// Record a new phase. Returns true if the phase actually changed.
    pub fn set_phase(&self, phase: PeeringPhase) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            info!(cluster_id = %self.cluster_id, %phase, "Peering phase changed");
        }
        changed
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<PeeringPhase> {
        self.tx.subscribe()
    }
}
