//! Runtime configuration of the reflection engine

use std::path::PathBuf;

use crate::crd::{ClusterConfig, PeeringPhase};
use crate::reflection::NamespaceMap;
use crate::retry::RetryConfig;
use crate::Error;

/// Default group/version of the configuration object
pub fn default_config_group_version() -> String {
    use kube::Resource;
    format!(
        "{}/{}",
        ClusterConfig::group(&()),
        ClusterConfig::version(&())
    )
}

/// Name of the configuration object watched unless overridden
pub const DEFAULT_CONFIG_NAME: &str = "reflex";

/// Settings for one engine instance (one local cluster, one remote cluster)
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Id of the local cluster, stamped on every mirror
    pub cluster_id: String,
    /// Id of the peered cluster
    pub remote_cluster_id: String,
    /// Kubeconfig for the peered cluster; `None` uses the ambient config
    pub remote_kubeconfig: Option<PathBuf>,
    /// Virtual node name; the pod subsystem runs only when set
    pub node_name: Option<String>,
    /// Group/version of the watched configuration object
    pub config_group_version: String,
    /// Name of the watched configuration object; others are ignored
    pub config_name: String,
    /// Peering phase assumed until the peering collaborator reports one
    pub initial_phase: PeeringPhase,
    /// Workers per reflector
    pub reflector_workers: usize,
    /// Workers per pod controller
    pub pod_workers: usize,
    /// Backoff for failed applies and status writes
    pub retry: RetryConfig,
    /// Source to target namespace mapping
    pub namespace_map: NamespaceMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            remote_cluster_id: String::new(),
            remote_kubeconfig: None,
            node_name: None,
            config_group_version: default_config_group_version(),
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            initial_phase: PeeringPhase::Established,
            reflector_workers: 2,
            pod_workers: 4,
            retry: RetryConfig::default(),
            namespace_map: NamespaceMap::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_id.is_empty() {
            return Err(Error::validation("cluster id cannot be empty"));
        }
        if self.remote_cluster_id.is_empty() {
            return Err(Error::validation("remote cluster id cannot be empty"));
        }
        if self.cluster_id == self.remote_cluster_id {
            return Err(Error::validation(format!(
                "remote cluster id must differ from local cluster id {}",
                self.cluster_id
            )));
        }
        if self.config_name.is_empty() {
            return Err(Error::validation("configuration name cannot be empty"));
        }
        if self.node_name.as_deref() == Some("") {
            return Err(Error::validation("node name cannot be empty when set"));
        }
        if self.reflector_workers == 0 || self.pod_workers == 0 {
            return Err(Error::validation("worker counts must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            cluster_id: "cluster-a".to_string(),
            remote_cluster_id: "cluster-b".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_watch_the_cluster_config_type() {
        let config = EngineConfig::default();
        assert_eq!(config.config_group_version, "config.reflex.dev/v1alpha1");
        assert_eq!(config.config_name, "reflex");
        assert_eq!(config.initial_phase, PeeringPhase::Established);
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let same_cluster = EngineConfig {
            remote_cluster_id: "cluster-a".to_string(),
            ..valid()
        };
        assert!(same_cluster.validate().is_err());

        let no_workers = EngineConfig {
            reflector_workers: 0,
            ..valid()
        };
        assert!(no_workers.validate().is_err());

        let empty_node = EngineConfig {
            node_name: Some(String::new()),
            ..valid()
        };
        assert!(empty_node.validate().is_err());

        let unnamed_config = EngineConfig {
            config_name: String::new(),
            ..valid()
        };
        assert!(unnamed_config.validate().is_err());

        assert!(EngineConfig::default().validate().is_err());
    }
}
