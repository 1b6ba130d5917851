//! Provider backed by a peered Kubernetes cluster
//!
//! Pods are created in the remote cluster as labeled mirrors, and the remote
//! pods' statuses are watched and reported back under their local identity.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::{PodStatusReporter, Provider};
use crate::feed::object_key;
use crate::reflection::NamespaceMap;
use crate::{
    origin_label_selector, reflection_labels, ProviderError, FIELD_MANAGER,
    ORIGIN_CLUSTER_LABEL, SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION,
    SOURCE_UID_ANNOTATION,
};

/// Projected service-account volumes are minted per cluster
const SERVICE_ACCOUNT_VOLUME_PREFIX: &str = "kube-api-access-";

const BACK_REFERENCES: [&str; 3] = [
    SOURCE_NAMESPACE_ANNOTATION,
    SOURCE_NAME_ANNOTATION,
    SOURCE_UID_ANNOTATION,
];

/// Runs the virtual node's pods in a peered cluster
pub struct KubeProvider {
    client: Client,
    origin_cluster_id: String,
    namespaces: NamespaceMap,
    cancel: CancellationToken,
}

impl KubeProvider {
    /// Create a provider for the cluster behind `client`.
    ///
    /// The status watch started by [`Provider::notify_pods`] ends with `cancel`.
    pub fn new(
        client: Client,
        origin_cluster_id: impl Into<String>,
        namespaces: NamespaceMap,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            origin_cluster_id: origin_cluster_id.into(),
            namespaces,
            cancel,
        }
    }

    fn api(&self, local_namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), self.namespaces.target(local_namespace))
    }

    /// Remote form of a local pod
    pub fn to_remote(&self, pod: &Pod) -> Pod {
        let mut labels = pod.labels().clone();
        labels.extend(reflection_labels());
        labels.insert(ORIGIN_CLUSTER_LABEL.to_string(), self.origin_cluster_id.clone());

        let mut annotations = pod.annotations().clone();
        annotations.insert(SOURCE_NAME_ANNOTATION.to_string(), pod.name_any());
        if let Some(ns) = pod.namespace() {
            annotations.insert(SOURCE_NAMESPACE_ANNOTATION.to_string(), ns);
        }
        if let Some(uid) = pod.uid() {
            annotations.insert(SOURCE_UID_ANNOTATION.to_string(), uid);
        }

        let mut spec = pod.spec.clone().unwrap_or_default();
        // The remote scheduler places the pod
        spec.node_name = None;
        if let Some(volumes) = spec.volumes.as_mut() {
            volumes.retain(|v| !v.name.starts_with(SERVICE_ACCOUNT_VOLUME_PREFIX));
        }
        for container in spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten())
        {
            if let Some(mounts) = container.volume_mounts.as_mut() {
                mounts.retain(|m| !m.name.starts_with(SERVICE_ACCOUNT_VOLUME_PREFIX));
            }
        }

        Pod {
            metadata: ObjectMeta {
                name: pod.metadata.name.clone(),
                namespace: pod
                    .namespace()
                    .map(|ns| self.namespaces.target(&ns).to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    /// Local view of a remote pod, `None` if it is not one of our mirrors
    pub fn to_local(&self, remote: &Pod) -> Option<Pod> {
        let labels = remote.labels();
        if labels.get(ORIGIN_CLUSTER_LABEL) != Some(&self.origin_cluster_id) {
            return None;
        }
        let annotations = remote.annotations();
        let name = annotations.get(SOURCE_NAME_ANNOTATION)?.clone();
        let namespace = annotations
            .get(SOURCE_NAMESPACE_ANNOTATION)
            .cloned()
            .or_else(|| {
                remote
                    .namespace()
                    .map(|ns| self.namespaces.source(&ns).to_string())
            });

        let reflection = reflection_labels();
        let labels: BTreeMap<String, String> = labels
            .iter()
            .filter(|(k, _)| !reflection.contains_key(*k) && k.as_str() != ORIGIN_CLUSTER_LABEL)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .filter(|(k, _)| !BACK_REFERENCES.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace,
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: remote.spec.clone(),
            status: remote.status.clone(),
        })
    }
}

fn provider_error(err: kube::Error) -> ProviderError {
    ProviderError::from_kube(&err)
}

#[async_trait]
impl Provider for KubeProvider {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ProviderError> {
        let remote = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(provider_error)?;
        Ok(remote.and_then(|p| self.to_local(&p)))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let remote = self.to_remote(pod);
        self.api(&pod.namespace().unwrap_or_default())
            .create(&PostParams::default(), &remote)
            .await
            .map_err(provider_error)?;
        info!(pod = %object_key(pod.namespace().as_deref(), &pod.name_any()), "Created remote pod");
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let remote = self.to_remote(pod);
        let spec = remote.spec.unwrap_or_default();
        let images = |containers: &[k8s_openapi::api::core::v1::Container]| {
            containers
                .iter()
                .map(|c| serde_json::json!({ "name": c.name, "image": c.image }))
                .collect::<Vec<_>>()
        };

        // Strategic merge: containers merge by name, so only images change
        let patch = serde_json::json!({
            "metadata": {
                "labels": remote.metadata.labels,
                "annotations": remote.metadata.annotations,
            },
            "spec": {
                "containers": images(spec.containers.as_slice()),
                "initContainers": images(spec.init_containers.as_deref().unwrap_or_default()),
                "activeDeadlineSeconds": spec.active_deadline_seconds,
                "tolerations": spec.tolerations,
            }
        });

        self.api(&pod.namespace().unwrap_or_default())
            .patch(
                &pod.name_any(),
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Strategic(&patch),
            )
            .await
            .map_err(provider_error)?;
        debug!(pod = %pod.name_any(), "Updated remote pod");
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        self.api(&pod.namespace().unwrap_or_default())
            .delete(&pod.name_any(), &DeleteParams::default())
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn notify_pods(&self, reporter: PodStatusReporter) {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(&origin_label_selector(&self.origin_cluster_id));
        let translator = KubeProvider {
            client: self.client.clone(),
            origin_cluster_id: self.origin_cluster_id.clone(),
            namespaces: self.namespaces.clone(),
            cancel: self.cancel.clone(),
        };
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let events = watcher::watcher(api, config).default_backoff();
            let mut events = std::pin::pin!(events);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(Event::Apply(remote) | Event::InitApply(remote))) => {
                            if let Some(local) = translator.to_local(&remote) {
                                reporter.report(local);
                            }
                        }
                        Some(Ok(Event::Delete(remote))) => {
                            if let Some(local) = translator.to_local(&remote) {
                                reporter.report_deleted(object_key(local.namespace().as_deref(), &local.name_any()));
                            }
                        }
                        Some(Ok(Event::Init | Event::InitDone)) => {}
                        Some(Err(e)) => warn!(error = %e, "Remote pod watch error, will retry"),
                        None => break,
                    }
                }
            }
            debug!("Remote pod status watch stopped");
        });
    }
}
