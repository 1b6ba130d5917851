//! Pod controller for the virtual node
//!
//! Three kube-runtime controllers share one pod store, fed by the pod watch:
//!
//! - sync: local pod changes, forwarded to the provider
//! - status: provider status reports, written back to the local pods
//! - deletion: pods the provider no longer runs, removed from the local cluster
//!
//! A pod is never reconciled twice at once by the same controller; status
//! writes are not ordered relative to spec sync. Deleted pods reach the sync
//! controller as tombstones (see [`crate::feed`]).

use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::{future, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::env::{populate_environment_variables, EnvSource};
use super::equality::pods_equal;
use super::known::KnownPods;
use super::provider::{PodStatusReporter, Provider};
use super::{
    is_pod_ready, is_pod_running, node_name, pod_key, should_skip_status_update,
    PROVIDER_FAILED_REASON, UNCONDITIONAL_RESOURCE_VERSION,
};
use crate::feed::{
    is_tombstone, log_outcome, shutdown_signal, split_object_key, Feed, Tombstones, Trigger,
};
use crate::retry::{KeyedBackoff, RetryConfig};
use crate::{Error, ProviderError, ProviderErrorKind, FIELD_MANAGER};

/// Local cluster operations on pods bound to the virtual node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalPods: Send + Sync {
    /// Delete a pod. A 404 is returned as an error; callers decide.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Error>;

    /// Replace the status subresource of `pod` with `pod.status`.
    ///
    /// Fields missing from `pod.status` are removed. Without a resource
    /// version, or with the unconditional sentinel, the write cannot conflict.
    async fn update_status(&self, pod: &Pod) -> Result<(), Error>;
}

/// Server-side apply body owning the whole status of `pod`
pub(crate) fn status_apply_patch(pod: &Pod) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "name": pod.name_any(),
        "namespace": pod.namespace(),
    });
    // A real resource version makes the apply conditional
    if let Some(rv) = pod
        .resource_version()
        .filter(|rv| rv != UNCONDITIONAL_RESOURCE_VERSION)
    {
        metadata["resourceVersion"] = rv.into();
    }
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
        "status": pod.status,
    })
}

/// Real implementation writing to the API server
pub struct KubeLocalPods {
    client: Client,
}

impl KubeLocalPods {
    /// Create from a client of the local cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LocalPods for KubeLocalPods {
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn update_status(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let patch = status_apply_patch(pod);
        api.patch_status(
            &pod.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Inputs consumed once by [`PodController::run`]
struct Pipelines {
    feed: Feed<Pod>,
    changes: Trigger<Pod>,
    status_keys: UnboundedReceiver<String>,
    deletion_keys: UnboundedReceiver<String>,
}

/// Forwards pods on the virtual node to a provider and syncs status back
pub struct PodController {
    provider: Arc<dyn Provider>,
    pods: Arc<dyn LocalPods>,
    env: Arc<dyn EnvSource>,
    node_name: String,
    known: KnownPods,
    reporter: PodStatusReporter,
    store: Store<Pod>,
    tombstones: Tombstones<Pod>,
    pipelines: Mutex<Option<Pipelines>>,
    sync_backoff: KeyedBackoff,
    status_backoff: KeyedBackoff,
    deletion_backoff: KeyedBackoff,
    workers: u16,
}

impl PodController {
    /// Create a controller for the virtual node `node_name`
    pub fn new(
        provider: Arc<dyn Provider>,
        pods: Arc<dyn LocalPods>,
        env: Arc<dyn EnvSource>,
        node_name: impl Into<String>,
        backoff: RetryConfig,
    ) -> Self {
        let known = KnownPods::new();
        let (status_tx, status_keys) = mpsc::unbounded();
        let (deletion_tx, deletion_keys) = mpsc::unbounded();
        let (feed, changes) = Feed::new(());

        Self {
            provider,
            pods,
            env,
            node_name: node_name.into(),
            reporter: PodStatusReporter::new(known.clone(), status_tx, deletion_tx),
            known,
            store: feed.store(),
            tombstones: feed.tombstones(),
            pipelines: Mutex::new(Some(Pipelines {
                feed,
                changes,
                status_keys,
                deletion_keys,
            })),
            sync_backoff: KeyedBackoff::new(backoff.clone()),
            status_backoff: KeyedBackoff::new(backoff.clone()),
            deletion_backoff: KeyedBackoff::new(backoff),
            workers: 1,
        }
    }

    /// Pods reconciled concurrently by each controller
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = u16::try_from(workers).unwrap_or(u16::MAX).max(1);
        self
    }

    /// Pods currently tracked
    pub fn known_pods(&self) -> &KnownPods {
        &self.known
    }

    /// Handle for the provider to push statuses back
    pub fn reporter(&self) -> PodStatusReporter {
        self.reporter.clone()
    }

    fn is_on_node(&self, pod: &Pod) -> bool {
        node_name(pod) == Some(self.node_name.as_str())
    }

    /// Create the pod in the provider, or update it if it changed.
    ///
    /// Works on a copy: the caller's pod (usually from the watch cache) is
    /// never mutated.
    #[instrument(skip(self, pod), fields(pod = %pod_key(pod)))]
    pub async fn create_or_update(&self, pod: &Pod) -> Result<(), Error> {
        let mut pod = pod.clone();
        populate_environment_variables(&mut pod, self.env.as_ref()).await?;

        // The provider may hold on to its copy; error handling uses ours
        let for_provider = pod.clone();
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        // Some providers report a missing pod as an error: both mean "create"
        let existing = match self.provider.get_pod(&namespace, &name).await {
            Ok(existing) => existing,
            Err(e) => {
                debug!(error = %e, "Provider lookup failed, creating pod");
                None
            }
        };
        if let Some(existing) = &existing {
            self.adopt_status(&pod, existing);
        }

        let result = match existing {
            Some(existing) if pods_equal(&existing, &for_provider) => {
                debug!("Pod unchanged in provider");
                return Ok(());
            }
            Some(_) => self.provider.update_pod(&for_provider).await,
            None => self.provider.create_pod(&for_provider).await,
        };

        match result {
            Ok(()) => {
                if let Some(entry) = self.known.get(&pod_key(&pod)) {
                    entry.record_spec(for_provider);
                }
                Ok(())
            }
            Err(e) => {
                self.handle_provider_error(&e, &pod).await;
                Err(Error::ProviderOperation(e))
            }
        }
    }

    /// Take over the status of a pod the provider ran before we tracked it.
    ///
    /// Reports sent before the pod was known were dropped; later reports win.
    fn adopt_status(&self, local: &Pod, existing: &Pod) {
        if existing.status.is_none() {
            return;
        }
        let key = pod_key(local);
        let Some(entry) = self.known.get(&key) else {
            return;
        };
        if entry.last_status().is_some() {
            return;
        }

        let mut reported = existing.clone();
        reported.metadata.name = local.metadata.name.clone();
        reported.metadata.namespace = local.metadata.namespace.clone();
        debug!(pod = %key, "Adopting status of pod already running in provider");
        self.reporter.report(reported);
    }

    /// React to a failed provider call for `pod`
    pub async fn handle_provider_error(&self, err: &ProviderError, pod: &Pod) {
        let key = pod_key(pod);
        match err.kind {
            ProviderErrorKind::NotFound => {
                let namespace = pod.namespace().unwrap_or_default();
                if let Err(e) = self.pods.delete(&namespace, &pod.name_any(), None).await {
                    error!(pod = %key, error = %e, "Cannot delete local pod after provider lost it");
                    self.set_provider_failed(err, pod).await;
                } else {
                    info!(pod = %key, "Provider no longer knows the pod, deleted local pod");
                }
            }
            ProviderErrorKind::Transient => {
                debug!(pod = %key, error = %err, "Transient provider error, will retry");
            }
            _ => self.set_provider_failed(err, pod).await,
        }
    }

    /// Mark `pod` as failed by the provider in the local cluster
    async fn set_provider_failed(&self, err: &ProviderError, pod: &Pod) {
        let mut failed = pod.clone();
        // No resource version: the follow-up write must not conflict
        failed.metadata.resource_version = None;

        let restart_never = pod
            .spec
            .as_ref()
            .and_then(|s| s.restart_policy.as_deref())
            == Some("Never");
        let status = failed.status.get_or_insert_with(PodStatus::default);
        status.phase = Some(if restart_never { "Failed" } else { "Pending" }.to_string());
        status.reason = Some(PROVIDER_FAILED_REASON.to_string());
        status.message = Some(err.to_string());

        let key = pod_key(pod);
        match self.pods.update_status(&failed).await {
            Ok(()) => info!(pod = %key, "Marked pod as provider failed"),
            Err(e) => error!(pod = %key, error = %e, "Failed to update pod status"),
        }
    }

    /// Delete `pod` from the provider; a pod it does not know is success
    pub async fn delete_pod(&self, pod: &Pod) -> Result<(), Error> {
        match self.provider.delete_pod(pod).await {
            Ok(()) => {
                info!(pod = %pod_key(pod), "Deleted pod from provider");
                Ok(())
            }
            Err(e) if e.kind == ProviderErrorKind::NotFound => {
                debug!(pod = %pod_key(pod), "Pod already gone from provider");
                Ok(())
            }
            Err(e) => Err(Error::ProviderOperation(e)),
        }
    }

    /// Write the last provider-reported status over `local`.
    ///
    /// The reported status replaces the stored one as a whole.
    pub async fn update_pod_status(&self, local: &Pod) -> Result<(), Error> {
        let key = pod_key(local);
        if should_skip_status_update(local) {
            return Ok(());
        }
        // Only pods on this node are ours to write
        if !self.is_on_node(local) {
            debug!(pod = %key, "Pod not bound to this node, skipping status update");
            return Ok(());
        }

        let Some(entry) = self.known.get(&key) else {
            // Deleted locally in the meantime
            return Ok(());
        };
        let Some(mut reported) = entry.last_status() else {
            return Ok(());
        };
        if reported.status.is_none() {
            return Ok(());
        }

        reported.metadata.resource_version = Some(UNCONDITIONAL_RESOURCE_VERSION.to_string());
        reported.metadata.name = local.metadata.name.clone();
        reported.metadata.namespace = local.metadata.namespace.clone();

        self.pods
            .update_status(&reported)
            .await
            .map_err(|e| Error::status_update(&key, e.to_string()))?;

        debug!(
            pod = %key,
            new_phase = ?reported.status.as_ref().and_then(|s| s.phase.as_deref()),
            old_phase = ?local.status.as_ref().and_then(|s| s.phase.as_deref()),
            ready = is_pod_ready(&reported),
            "Updated pod status"
        );
        Ok(())
    }

    /// Status controller handler
    pub async fn sync_pod_status_handler(&self, pod: &Pod) -> Result<(), Error> {
        if is_tombstone(pod) {
            debug!(pod = %pod_key(pod), "Skipping status update for deleted pod");
            return Ok(());
        }
        self.update_pod_status(pod).await
    }

    /// Deletion controller handler: remove a pod the provider no longer runs
    pub async fn delete_pod_from_kubernetes_handler(&self, pod: &Pod) -> Result<(), Error> {
        let key = pod_key(pod);
        if is_tombstone(pod) {
            self.known.remove(&key);
            return Ok(());
        }
        if is_pod_running(pod) {
            warn!(pod = %key, "Force deleting pod in running state");
        }

        let namespace = pod.namespace().unwrap_or_default();
        match self.pods.delete(&namespace, &pod.name_any(), Some(0)).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => {
                self.known.remove(&key);
                Ok(())
            }
        }
    }

    /// Sync controller handler: bring the provider in line with the local pod
    pub async fn sync_pod_handler(&self, pod: &Pod) -> Result<(), Error> {
        let key = pod_key(pod);

        if is_tombstone(pod) || !self.is_on_node(pod) {
            // Gone from the local cluster: make sure the provider forgets it.
            // The entry stays until the delete succeeded so a retry has the spec.
            if let Some(last) = self.known.get(&key).and_then(|k| k.last_spec()) {
                self.delete_pod(&last).await?;
            }
            self.known.remove(&key);
            return Ok(());
        }

        if pod.metadata.deletion_timestamp.is_some() {
            self.delete_pod(pod).await?;
            self.reporter.report_deleted(key);
            return Ok(());
        }

        self.known.ensure(&key);
        self.create_or_update(pod).await
    }

    /// Run the controllers over `events` until `cancel` fires.
    ///
    /// `events` is the watch of pods bound to the virtual node. A controller
    /// runs once; later calls return immediately.
    pub async fn run<S>(self: Arc<Self>, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send + 'static,
    {
        let Some(pipelines) = self.pipelines.lock().take() else {
            warn!(node = %self.node_name, "Pod controller already ran");
            return;
        };
        let Pipelines {
            feed,
            changes,
            status_keys,
            deletion_keys,
        } = pipelines;

        let shutdown = cancel.child_token();
        let config = || controller::Config::default().concurrency(self.workers);
        let status_trigger = pods_for_keys(status_keys, self.store.clone());
        let deletion_trigger = pods_for_keys(deletion_keys, self.store.clone());

        let sync = Controller::for_stream(changes, self.store.clone())
            .with_config(config())
            .graceful_shutdown_on(shutdown_signal(shutdown.clone()))
            .run(reconcile_pod, pod_error_policy, self.clone())
            .for_each(log_outcome);
        let status = Controller::for_stream(status_trigger, self.store.clone())
            .with_config(config())
            .graceful_shutdown_on(shutdown_signal(shutdown.clone()))
            .run(reconcile_status, status_error_policy, self.clone())
            .for_each(log_outcome);
        let deletion = Controller::for_stream(deletion_trigger, self.store.clone())
            .with_config(config())
            .graceful_shutdown_on(shutdown_signal(shutdown.clone()))
            .run(reconcile_deletion, deletion_error_policy, self.clone())
            .for_each(log_outcome);

        self.provider.notify_pods(self.reporter()).await;
        info!(node = %self.node_name, "Pod controller started");

        let pump = async {
            feed.run(events, &cancel, || {}).await;
            shutdown.cancel();
        };
        tokio::join!(pump, sync, status, deletion);
        info!(node = %self.node_name, "Pod controller stopped");
    }
}

/// Pods named by `keys`, looked up in `store`; keys of absent pods are dropped
fn pods_for_keys(
    keys: UnboundedReceiver<String>,
    store: Store<Pod>,
) -> impl Stream<Item = Result<Pod, watcher::Error>> + Send + 'static {
    keys.filter_map(move |key| {
        let (namespace, name) = split_object_key(&key);
        let mut obj_ref = ObjectRef::new(name);
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        let pod = store.get(&obj_ref);
        if pod.is_none() {
            debug!(pod = %key, "Pod missing locally, skipping");
        }
        future::ready(pod.map(|p| Ok((*p).clone())))
    })
}

async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<PodController>) -> Result<Action, Error> {
    ctx.sync_pod_handler(&pod).await?;
    ctx.sync_backoff.succeeded(&pod_key(&pod));
    if is_tombstone(pod.as_ref()) {
        ctx.tombstones.purge(&pod);
    }
    Ok(Action::await_change())
}

async fn reconcile_status(pod: Arc<Pod>, ctx: Arc<PodController>) -> Result<Action, Error> {
    ctx.sync_pod_status_handler(&pod).await?;
    ctx.status_backoff.succeeded(&pod_key(&pod));
    Ok(Action::await_change())
}

async fn reconcile_deletion(pod: Arc<Pod>, ctx: Arc<PodController>) -> Result<Action, Error> {
    ctx.delete_pod_from_kubernetes_handler(&pod).await?;
    ctx.deletion_backoff.succeeded(&pod_key(&pod));
    Ok(Action::await_change())
}

fn requeue(backoff: &KeyedBackoff, pipeline: &str, pod: &Pod, error: &Error) -> Action {
    let key = pod_key(pod);
    let delay = backoff.failed(&key);
    warn!(
        pipeline,
        pod = %key,
        %error,
        delay_ms = delay.as_millis(),
        "Pod reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

fn pod_error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<PodController>) -> Action {
    requeue(&ctx.sync_backoff, "sync", &pod, error)
}

fn status_error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<PodController>) -> Action {
    requeue(&ctx.status_backoff, "status", &pod, error)
}

fn deletion_error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<PodController>) -> Action {
    requeue(&ctx.deletion_backoff, "deletion", &pod, error)
}
