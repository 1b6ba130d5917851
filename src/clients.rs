//! Kubernetes clients for peered clusters
//!
//! Remote clients are expensive to build (kubeconfig parsing, TLS setup), so
//! they are built once per cluster id and shared. The cache is an explicit
//! service owned by the process entry point and passed to whoever needs it.

use std::collections::HashMap;
use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::Error;

/// Per-cluster client cache with explicit initialization
#[derive(Default)]
pub struct ClientCache {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client for `cluster_id`, building it on first use.
    ///
    /// `kubeconfig` is read only when no client is cached yet; `None` falls
    /// back to the ambient configuration (in-cluster or `KUBECONFIG`).
    pub async fn init(&self, cluster_id: &str, kubeconfig: Option<&Path>) -> Result<Client, Error> {
        if let Some(client) = self.clients.read().await.get(cluster_id) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        // Another task may have built it while we waited for the write lock
        if let Some(client) = clients.get(cluster_id) {
            debug!(%cluster_id, "Client initialized concurrently");
            return Ok(client.clone());
        }

        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).map_err(|e| {
                    Error::validation(format!("failed to read kubeconfig {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::validation(format!(
                            "invalid kubeconfig {}: {}",
                            path.display(),
                            e
                        ))
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::validation(format!("failed to infer kube config: {}", e)))?,
        };

        let client = Client::try_from(config)?;
        info!(%cluster_id, "Initialized cluster client");
        clients.insert(cluster_id.to_string(), client.clone());
        Ok(client)
    }

    /// Register an already-built client for `cluster_id`
    pub async fn insert(&self, cluster_id: impl Into<String>, client: Client) {
        self.clients.write().await.insert(cluster_id.into(), client);
    }

    /// Return the cached client for `cluster_id`, if initialized
    pub async fn get(&self, cluster_id: &str) -> Option<Client> {
        self.clients.read().await.get(cluster_id).cloned()
    }

    /// Drop the cached client for `cluster_id` (e.g. after unpeering)
    pub async fn remove(&self, cluster_id: &str) -> bool {
        self.clients.write().await.remove(cluster_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> Client {
        let config = Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn get_before_init_is_none() {
        let cache = ClientCache::new();
        assert!(cache.get("remote-1").await.is_none());
    }

    #[tokio::test]
    async fn init_returns_cached_client_without_reading_kubeconfig() {
        let cache = ClientCache::new();
        cache.insert("remote-1", offline_client()).await;

        // The path does not exist: a cache hit must not touch it
        let missing = Path::new("/nonexistent/kubeconfig");
        assert!(cache.init("remote-1", Some(missing)).await.is_ok());
    }

    #[tokio::test]
    async fn init_with_missing_kubeconfig_fails() {
        let cache = ClientCache::new();
        let missing = Path::new("/nonexistent/kubeconfig");
        let err = cache.init("remote-2", Some(missing)).await.err().expect("init should fail");
        assert!(matches!(err, Error::Validation(_)));
        assert!(cache.get("remote-2").await.is_none());
    }

    #[tokio::test]
    async fn remove_forgets_client() {
        let cache = ClientCache::new();
        cache.insert("remote-1", offline_client()).await;
        assert!(cache.remove("remote-1").await);
        assert!(!cache.remove("remote-1").await);
    }
}
