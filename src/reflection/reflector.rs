//! Reflector controller and its production factory

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::api::{Api, DynamicObject, TypeMeta};
use kube::core::ApiResource;
use kube::discovery::{self, ApiCapabilities, Scope};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::forge::{ForgeContext, ForgeFn, ForgeTable};
use super::target::{KubeMirrorTarget, MirrorTarget};
use super::ReflectorHandle;
use crate::crd::{ReplicatedResource, ResourceId};
use crate::dispatcher::ReflectorFactory;
use crate::feed::{
    is_tombstone, log_outcome, object_key, shutdown_signal, split_object_key, Feed, Tombstones,
};
use crate::retry::{KeyedBackoff, RetryConfig};
use crate::{
    has_reflection_labels, Error, ORIGIN_CLUSTER_LABEL, REFLECTED_LABEL,
    SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION,
};

/// Mirrors one resource type from the source cluster into the target cluster
pub struct Reflector {
    resource: ResourceId,
    api_resource: ApiResource,
    forge: ForgeFn,
    forge_ctx: ForgeContext,
    target: Arc<dyn MirrorTarget>,
    workers: u16,
    backoff: KeyedBackoff,
}

impl Reflector {
    /// Create a reflector; nothing runs until [`Reflector::spawn`]
    pub fn new(
        resource: ResourceId,
        api_resource: ApiResource,
        forge: ForgeFn,
        forge_ctx: ForgeContext,
        target: Arc<dyn MirrorTarget>,
    ) -> Self {
        Self {
            resource,
            api_resource,
            forge,
            forge_ctx,
            target,
            workers: 1,
            backoff: KeyedBackoff::new(RetryConfig::default()),
        }
    }

    /// Number of objects reconciled concurrently
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = u16::try_from(workers).unwrap_or(u16::MAX).max(1);
        self
    }

    /// Backoff for failed applies
    pub fn backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = KeyedBackoff::new(backoff);
        self
    }

    /// Bring the mirror of `key` in line with `source`.
    ///
    /// `None` (or a source being deleted) removes the mirror; an already
    /// absent mirror is success.
    #[instrument(skip(self, source), fields(resource = %self.resource))]
    pub async fn sync_key(&self, key: &str, source: Option<&DynamicObject>) -> Result<(), Error> {
        let source = match source {
            Some(obj) if obj.metadata.deletion_timestamp.is_none() => obj,
            _ => return self.delete_mirror(key).await,
        };

        let mirror = match (self.forge)(source, &self.forge_ctx) {
            Ok(Some(mut mirror)) => {
                mirror.types = Some(TypeMeta {
                    api_version: self.api_resource.api_version.clone(),
                    kind: self.api_resource.kind.clone(),
                });
                mirror
            }
            Ok(None) => {
                debug!(%key, "Object excluded from reflection");
                return self.delete_mirror(key).await;
            }
            Err(e @ Error::Validation(_)) => {
                // Retrying cannot fix the object; wait for the next change
                error!(%key, error = %e, "Cannot forge mirror");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.target
            .apply(&mirror)
            .await
            .map_err(|e| Error::reflection_apply(key, e.to_string()))?;
        debug!(%key, "Mirror applied");
        Ok(())
    }

    async fn delete_mirror(&self, key: &str) -> Result<(), Error> {
        let (namespace, name) = split_object_key(key);
        let namespace = namespace.map(|ns| self.forge_ctx.namespaces.target(ns).to_string());

        let existing = self
            .target
            .get(namespace.clone(), name.to_string())
            .await
            .map_err(|e| Error::reflection_apply(key, e.to_string()))?;
        let Some(existing) = existing else {
            return Ok(());
        };

        // Only touch objects we created: names may collide with unrelated objects
        let labels = existing.metadata.labels.as_ref();
        let ours = has_reflection_labels(labels)
            && labels.and_then(|l| l.get(ORIGIN_CLUSTER_LABEL))
                == Some(&self.forge_ctx.origin_cluster_id);
        if !ours {
            warn!(%key, "Target object is not a mirror of ours, leaving it untouched");
            return Ok(());
        }

        self.target
            .delete(namespace, name.to_string())
            .await
            .map_err(|e| Error::reflection_apply(key, e.to_string()))?;
        info!(%key, "Mirror deleted");
        Ok(())
    }

    /// Bury mirrors whose source no longer exists (deleted while we were down)
    async fn bury_orphans(
        &self,
        store: &Store<DynamicObject>,
        tombstones: &Tombstones<DynamicObject>,
    ) {
        let mirrors = match self.target.list_mirrors().await {
            Ok(mirrors) => mirrors,
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Failed to list mirrors for orphan cleanup");
                return;
            }
        };

        for mirror in mirrors {
            let annotations = mirror.annotations();
            let Some(name) = annotations.get(SOURCE_NAME_ANNOTATION) else {
                continue;
            };
            let namespace = annotations.get(SOURCE_NAMESPACE_ANNOTATION);

            let mut source = DynamicObject::new(name, &self.api_resource);
            let mut obj_ref = ObjectRef::new_with(name, self.api_resource.clone());
            if let Some(ns) = namespace {
                source = source.within(ns);
                obj_ref = obj_ref.within(ns);
            }
            if store.get(&obj_ref).is_none() {
                debug!(
                    resource = %self.resource,
                    key = %object_key(namespace.map(String::as_str), name),
                    "Orphaned mirror found"
                );
                tombstones.bury(source);
            }
        }
    }

    /// Start mirroring the objects delivered by `events`.
    ///
    /// `events` is normally a kube watcher over the source resource type; the
    /// task runs until the returned handle is stopped or the stream ends.
    pub fn spawn<S>(self, events: S) -> ReflectorHandle
    where
        S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>> + Send + 'static,
    {
        let resource = self.resource.clone();
        let api_resource = self.api_resource.clone();
        let workers = self.workers;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let (feed, trigger) = Feed::new(api_resource.clone());
        let ctx = Arc::new(Context {
            store: feed.store(),
            tombstones: feed.tombstones(),
            reflector: self,
        });

        let task = tokio::spawn(async move {
            let shutdown = token.child_token();
            let controller = Controller::for_stream_with(trigger, ctx.store.clone(), api_resource)
                .with_config(controller::Config::default().concurrency(workers))
                .graceful_shutdown_on(shutdown_signal(shutdown.clone()))
                .run(reconcile, error_policy, ctx.clone())
                .for_each(log_outcome);

            let pump = async {
                info!(resource = %ctx.reflector.resource, "Reflector started");
                feed.run(events, &token, || {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        ctx.reflector.bury_orphans(&ctx.store, &ctx.tombstones).await;
                    });
                })
                .await;
                shutdown.cancel();
            };

            tokio::join!(pump, controller);
        });

        ReflectorHandle::new(resource, cancel, task)
    }
}

struct Context {
    reflector: Reflector,
    store: Store<DynamicObject>,
    tombstones: Tombstones<DynamicObject>,
}

async fn reconcile(source: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(source.namespace().as_deref(), &source.name_any());
    ctx.reflector.sync_key(&key, Some(source.as_ref())).await?;
    ctx.reflector.backoff.succeeded(&key);
    if is_tombstone(source.as_ref()) {
        ctx.tombstones.purge(source.as_ref());
    }
    Ok(Action::await_change())
}

fn error_policy(source: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(source.namespace().as_deref(), &source.name_any());
    let delay = ctx.reflector.backoff.failed(&key);
    warn!(
        resource = %ctx.reflector.resource,
        %key,
        %error,
        delay_ms = delay.as_millis(),
        "Reflection failed, requeueing"
    );
    Action::requeue(delay)
}

/// Production factory: resolves the type on both clusters, then watches it
pub struct KubeReflectorFactory {
    source: Client,
    target: Client,
    forge_table: ForgeTable,
    forge_ctx: ForgeContext,
    workers: usize,
    backoff: RetryConfig,
}

impl KubeReflectorFactory {
    /// Create a factory mirroring from `source` into `target`
    pub fn new(source: Client, target: Client, forge_ctx: ForgeContext) -> Self {
        Self {
            source,
            target,
            forge_table: ForgeTable::with_defaults(),
            forge_ctx,
            workers: 1,
            backoff: RetryConfig::default(),
        }
    }

    /// Replace the forge table
    pub fn forge_table(mut self, table: ForgeTable) -> Self {
        self.forge_table = table;
        self
    }

    /// Workers per reflector
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Backoff for failed applies
    pub fn backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Find `id` among the resources served by the cluster behind `client`
async fn resolve(client: &Client, id: &ResourceId) -> Result<(ApiResource, ApiCapabilities), Error> {
    let group = discovery::pinned_group(client, &id.group_version()).await?;
    group
        .versioned_resources(&id.version)
        .into_iter()
        .find(|(ar, _)| ar.plural == id.resource)
        .ok_or_else(|| Error::validation(format!("{id} is not served")))
}

#[async_trait]
impl ReflectorFactory for KubeReflectorFactory {
    async fn start(&self, resource: &ReplicatedResource) -> Result<ReflectorHandle, Error> {
        let id = &resource.id;
        let (api_resource, caps) = resolve(&self.source, id)
            .await
            .map_err(|e| Error::registration(id.to_string(), format!("source cluster: {e}")))?;
        resolve(&self.target, id)
            .await
            .map_err(|e| Error::registration(id.to_string(), format!("target cluster: {e}")))?;

        let target = Arc::new(KubeMirrorTarget::new(
            self.target.clone(),
            api_resource.clone(),
            caps.scope == Scope::Namespaced,
            self.forge_ctx.origin_cluster_id.clone(),
        ));

        // Never reflect mirrors back to where they came from
        let api: Api<DynamicObject> = Api::all_with(self.source.clone(), &api_resource);
        let config = watcher::Config::default().labels(&format!("!{REFLECTED_LABEL}"));
        let events = watcher::watcher(api, config).default_backoff();

        let reflector = Reflector::new(
            id.clone(),
            api_resource,
            self.forge_table.lookup(id),
            self.forge_ctx.clone(),
            target,
        )
        .workers(self.workers)
        .backoff(self.backoff.clone());

        Ok(reflector.spawn(events))
    }
}
