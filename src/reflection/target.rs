//! Target cluster operations for mirror objects

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::ApiResource;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{origin_label_selector, Error, FIELD_MANAGER};

/// Trait abstracting mirror operations against the target cluster
///
/// This trait allows mocking the remote API server in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MirrorTarget: Send + Sync {
    /// Fetch a mirror, `None` if absent
    async fn get(&self, namespace: Option<String>, name: String)
        -> Result<Option<DynamicObject>, Error>;

    /// Create or update a mirror so it matches `mirror` exactly
    async fn apply(&self, mirror: &DynamicObject) -> Result<(), Error>;

    /// Delete a mirror. An absent mirror is success.
    async fn delete(&self, namespace: Option<String>, name: String) -> Result<(), Error>;

    /// List every mirror of this resource type originating from our cluster
    async fn list_mirrors(&self) -> Result<Vec<DynamicObject>, Error>;
}

/// Real target implementation using server-side apply
pub struct KubeMirrorTarget {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
    origin_cluster_id: String,
}

impl KubeMirrorTarget {
    /// Create a target for `resource` in the cluster behind `client`
    pub fn new(
        client: Client,
        resource: ApiResource,
        namespaced: bool,
        origin_cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            resource,
            namespaced,
            origin_cluster_id: origin_cluster_id.into(),
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &self.resource)
            }
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl MirrorTarget for KubeMirrorTarget {
    async fn get(
        &self,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(namespace.as_deref()).get_opt(&name).await?)
    }

    async fn apply(&self, mirror: &DynamicObject) -> Result<(), Error> {
        let name = mirror
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("mirror has no name"))?;

        self.api(mirror.metadata.namespace.as_deref())
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(mirror),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: Option<String>, name: String) -> Result<(), Error> {
        match self
            .api(namespace.as_deref())
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(%name, "Mirror already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_mirrors(&self) -> Result<Vec<DynamicObject>, Error> {
        let params = ListParams::default().labels(&origin_label_selector(&self.origin_cluster_id));
        let list = self.api(None).list(&params).await?;
        Ok(list.items)
    }
}
