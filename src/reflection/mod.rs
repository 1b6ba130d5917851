//! Generic reflection of one resource type into a peered cluster
//!
//! A reflector watches a resource type in the source cluster and keeps the
//! target cluster's mirrors equal to the forged form of every source object.
//! It runs as a background task owned by a [`ReflectorHandle`].

mod forge;
mod reflector;
mod target;

pub use forge::{forge_mirror, mirror_metadata, ForgeContext, ForgeFn, ForgeTable, NamespaceMap};
pub use reflector::{KubeReflectorFactory, Reflector};
pub use target::{KubeMirrorTarget, MirrorTarget};

#[cfg(test)]
pub use target::MockMirrorTarget;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::ResourceId;

/// Owner of a running reflector task
///
/// Dropping the handle does not stop the task; call [`ReflectorHandle::stop`].
#[derive(Debug)]
pub struct ReflectorHandle {
    resource: ResourceId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReflectorHandle {
    /// Wrap a spawned reflector task and the token that cancels it
    pub fn new(resource: ResourceId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            resource,
            cancel,
            task,
        }
    }

    /// Cancel the watch and wait for the task to exit.
    ///
    /// In-flight reconciles finish; nothing new is scheduled.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(resource = %self.resource, error = %e, "Reflector task ended abnormally");
        }
        info!(resource = %self.resource, "Reflector stopped");
    }
}
