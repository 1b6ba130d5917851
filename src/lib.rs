//! Reflex - cross-cluster object reflection for peered Kubernetes clusters
//!
//! A foreign cluster is represented locally as a virtual node, and selected
//! objects are kept consistent across the cluster boundary with no shared
//! database or control plane between the two API servers.
//!
//! # Architecture
//!
//! - The [`dispatcher`] watches the `ClusterConfig` object and keeps the set of
//!   running reflectors equal to what configuration and peering phase demand
//! - Each [`reflection`] worker mirrors one resource type from the local
//!   cluster into the remote one, tagging every mirror with the reflection labels
//! - The [`pod`] subsystem forwards pods to a pluggable provider and syncs the
//!   provider-reported status back into the local cluster
//!
//! # Modules
//!
//! - [`crd`] - `ClusterConfig` CRD and peering types
//! - [`dispatcher`] - Starts/stops reflectors on configuration and phase changes
//! - [`reflection`] - Generic reflector, forge table and mirror target
//! - [`pod`] - Pod reflection state machine and provider interface
//! - [`feed`] - Watch feeds with tombstones for kube-runtime controllers
//! - [`peering`] - Peering phase source consumed by the dispatcher
//! - [`clients`] - Remote cluster client cache
//! - [`config`] - Runtime engine configuration
//! - [`retry`] - Exponential backoff shared by watches, applies and requeues
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

use std::collections::BTreeMap;

pub mod clients;
pub mod config;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod peering;
pub mod pod;
pub mod reflection;
pub mod retry;

pub use error::{Error, ProviderError, ProviderErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Reflection Label Contract
// =============================================================================
// External tooling filters mirrors on these keys. They are a stable contract:
// changing any of them orphans every mirror already present in remote clusters.

/// Label marking an object as a reflected mirror
pub const REFLECTED_LABEL: &str = "reflex.dev/reflected";

/// Value of [`REFLECTED_LABEL`] on every mirror
pub const REFLECTED_LABEL_VALUE: &str = "true";

/// Label naming the component that owns the mirror
pub const MANAGED_BY_LABEL: &str = "reflex.dev/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on every mirror
pub const MANAGED_BY_LABEL_VALUE: &str = "reflex";

/// Label carrying the cluster id the mirror originates from
pub const ORIGIN_CLUSTER_LABEL: &str = "reflex.dev/origin-cluster-id";

/// Annotation back-referencing the namespace of the source object
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "reflex.dev/source-namespace";

/// Annotation back-referencing the name of the source object
pub const SOURCE_NAME_ANNOTATION: &str = "reflex.dev/source-name";

/// Annotation back-referencing the UID of the source object
pub const SOURCE_UID_ANNOTATION: &str = "reflex.dev/source-uid";

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "reflex";

/// The fixed label set applied to every mirror object
pub fn reflection_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (REFLECTED_LABEL.to_string(), REFLECTED_LABEL_VALUE.to_string()),
        (
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
    ])
}

/// Label selector matching every mirror, regardless of origin
pub fn reflection_label_selector() -> String {
    format!(
        "{}={},{}={}",
        REFLECTED_LABEL, REFLECTED_LABEL_VALUE, MANAGED_BY_LABEL, MANAGED_BY_LABEL_VALUE
    )
}

/// Label selector matching mirrors that originate from `cluster_id`
pub fn origin_label_selector(cluster_id: &str) -> String {
    format!(
        "{},{}={}",
        reflection_label_selector(),
        ORIGIN_CLUSTER_LABEL,
        cluster_id
    )
}

/// Returns true if `labels` carries the full reflection label set
pub fn has_reflection_labels(labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    reflection_labels()
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_labels_are_recognized() {
        assert!(has_reflection_labels(Some(&reflection_labels())));
        assert!(!has_reflection_labels(None));

        let mut partial = reflection_labels();
        partial.remove(MANAGED_BY_LABEL);
        assert!(!has_reflection_labels(Some(&partial)));
    }

    #[test]
    fn origin_selector_scopes_to_cluster() {
        let selector = origin_label_selector("cluster-a");
        assert!(selector.starts_with(&reflection_label_selector()));
        assert!(selector.ends_with("reflex.dev/origin-cluster-id=cluster-a"));
    }
}
