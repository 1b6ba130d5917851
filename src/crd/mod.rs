//! Custom Resource Definitions for Reflex
//!
//! The CRD schemas are consumed only as typed data: the engine reads the
//! `ClusterConfig` and never writes it.

mod cluster_config;
mod types;

pub use cluster_config::{ClusterConfig, ClusterConfigSpec};
pub use types::{
    DispatcherConfig, PeeringPhase, ReplicatedResource, Resource, ResourceId,
};
