//! ClusterConfig Custom Resource Definition
//!
//! The ClusterConfig CRD is the live configuration the dispatcher watches. It
//! is cluster-scoped and normally exists as a single instance.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DispatcherConfig, ReplicatedResource};

/// Specification for a ClusterConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.reflex.dev",
    version = "v1alpha1",
    kind = "ClusterConfig",
    plural = "clusterconfigs",
    shortname = "ccfg",
    namespaced = false,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigSpec {
    /// Which resource types are mirrored into peered clusters
    #[serde(default)]
    pub dispatcher_config: DispatcherConfig,
}

impl ClusterConfigSpec {
    /// Resource types listed for replication, in declaration order.
    ///
    /// Entries without a version or resource name are skipped.
    pub fn replicated_resources(&self) -> impl Iterator<Item = ReplicatedResource> + '_ {
        self.dispatcher_config
            .resources_to_replicate
            .iter()
            .filter(|r| r.is_complete())
            .map(ReplicatedResource::from)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        for r in &self.dispatcher_config.resources_to_replicate {
            if !r.is_complete() {
                return Err(crate::Error::validation(format!(
                    "resource to replicate must set version and resource, got group={:?} version={:?} resource={:?}",
                    r.group, r.version, r.resource
                )));
            }
        }
        Ok(())
    }
}
