//! Watch feeds for kube-runtime controllers
//!
//! A [`Controller`](kube::runtime::Controller) only reconciles objects found in
//! its store, so with a plain watch a reconciler never sees a deletion. A
//! [`Feed`] applies watch events to the store itself and keeps every deleted
//! object behind as a tombstone: a copy carrying [`TOMBSTONE_ANNOTATION`] and a
//! deletion timestamp. Reconcilers treat it like any terminating object and
//! call [`Tombstones::purge`] once the deletion is handled.
//!
//! Objects returned by a (re)list are triggered only after the list completed.
//! Objects that vanished between two lists become tombstones as well.

use std::collections::HashSet;
use std::hash::Hash;

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In-memory marker of a deleted object kept in a controller store
pub const TOMBSTONE_ANNOTATION: &str = "reflex.dev/tombstone";

/// Key of an object: `namespace/name`, or `name` if cluster-scoped
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Split a key produced by [`object_key`] into namespace and name
pub fn split_object_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// Turn `obj` into a tombstone
pub fn tombstone<K: Resource>(mut obj: K) -> K {
    obj.annotations_mut()
        .insert(TOMBSTONE_ANNOTATION.to_string(), "true".to_string());
    let meta = obj.meta_mut();
    if meta.deletion_timestamp.is_none() {
        meta.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    }
    obj
}

/// Returns true if `obj` stands for an object deleted from the cluster
pub fn is_tombstone<K: Resource>(obj: &K) -> bool {
    obj.annotations().contains_key(TOMBSTONE_ANNOTATION)
}

/// Resolves once `token` is cancelled; fits `Controller::graceful_shutdown_on`
pub async fn shutdown_signal(token: CancellationToken) {
    token.cancelled().await
}

/// Log one controller result, as a `Controller::run(..).for_each` callback
pub async fn log_outcome<K, E>(
    result: Result<(ObjectRef<K>, Action), controller::Error<E, watcher::Error>>,
) where
    K: Resource,
    E: std::error::Error,
{
    match result {
        Ok((obj, action)) => {
            debug!(name = %obj.name, namespace = ?obj.namespace, ?action, "Reconciled");
        }
        // Purged between trigger and reconcile
        Err(controller::Error::ObjectNotFound(obj)) => {
            debug!(name = %obj.name, namespace = ?obj.namespace, "Object gone before reconcile");
        }
        Err(e) => warn!(error = %e, "Reconciliation error"),
    }
}

enum Command<K> {
    Bury(K),
    Purge(K),
}

/// Handle to add or drop tombstones in a running [`Feed`]
pub struct Tombstones<K> {
    commands: mpsc::UnboundedSender<Command<K>>,
}

impl<K> Clone for Tombstones<K> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<K: Clone> Tombstones<K> {
    /// Record `obj` as deleted unless the store holds a live object of that name
    pub fn bury(&self, obj: K) {
        // Fails only once the feed stopped, when nothing reconciles anymore
        let _ = self.commands.unbounded_send(Command::Bury(obj));
    }

    /// Drop the tombstone of `obj` after its deletion was handled
    pub fn purge(&self, obj: &K) {
        let _ = self.commands.unbounded_send(Command::Purge(obj.clone()));
    }
}

/// Objects to reconcile, in the form `Controller::for_stream` takes
pub type Trigger<K> = mpsc::UnboundedReceiver<Result<K, watcher::Error>>;

/// Applies watch events to a controller store and triggers reconciles
pub struct Feed<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    dyntype: K::DynamicType,
    trigger: mpsc::UnboundedSender<Result<K, watcher::Error>>,
    commands: mpsc::UnboundedReceiver<Command<K>>,
    tombstones: Tombstones<K>,
}

impl<K> Feed<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    /// Create a feed and the trigger stream for its controller
    pub fn new(dyntype: K::DynamicType) -> (Self, Trigger<K>) {
        let (trigger, trigger_rx) = mpsc::unbounded();
        let (commands_tx, commands) = mpsc::unbounded();
        let feed = Self {
            writer: Writer::new(dyntype.clone()),
            dyntype,
            trigger,
            commands,
            tombstones: Tombstones {
                commands: commands_tx,
            },
        };
        (feed, trigger_rx)
    }

    /// Store kept up to date by this feed, tombstones included
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Handle to manage tombstones while the feed runs
    pub fn tombstones(&self) -> Tombstones<K> {
        self.tombstones.clone()
    }

    /// Feed `events` into the store until the stream ends or `cancel` fires.
    ///
    /// `on_listed` runs after every completed (re)list. Dropping the trigger on
    /// return ends the controller's input.
    pub async fn run<S, F>(self, events: S, cancel: &CancellationToken, mut on_listed: F)
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>>,
        F: FnMut(),
    {
        let Feed {
            writer,
            dyntype,
            trigger,
            mut commands,
            tombstones: _,
        } = self;
        let mut state = FeedState {
            writer,
            dyntype,
            trigger,
            listed: Vec::new(),
        };
        let mut events = std::pin::pin!(events);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.next() => state.command(command),
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if state.event(event) {
                            on_listed();
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Watch error, will retry"),
                    None => {
                        debug!("Watch stream ended");
                        break;
                    }
                }
            }
        }
    }
}

struct FeedState<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    dyntype: K::DynamicType,
    trigger: mpsc::UnboundedSender<Result<K, watcher::Error>>,
    listed: Vec<K>,
}

impl<K> FeedState<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn object_ref(&self, obj: &K) -> ObjectRef<K> {
        ObjectRef::from_obj_with(obj, self.dyntype.clone())
    }

    fn send(&self, obj: K) {
        // The controller is gone once shut down
        let _ = self.trigger.unbounded_send(Ok(obj));
    }

    fn store_and_send(&mut self, obj: K) {
        self.writer.apply_watcher_event(&Event::Apply(obj.clone()));
        self.send(obj);
    }

    /// Apply one watch event; returns true when a list completed
    fn event(&mut self, event: Event<K>) -> bool {
        match event {
            Event::Init => {
                self.listed.clear();
                self.writer.apply_watcher_event(&Event::Init);
            }
            Event::InitApply(obj) => {
                self.writer.apply_watcher_event(&Event::InitApply(obj.clone()));
                self.listed.push(obj);
            }
            Event::InitDone => {
                let listed: HashSet<ObjectRef<K>> =
                    self.listed.iter().map(|o| self.object_ref(o)).collect();
                // Deleted while the watch was down, or not yet handled
                let vanished: Vec<K> = self
                    .writer
                    .as_reader()
                    .state()
                    .into_iter()
                    .filter(|o| !listed.contains(&self.object_ref(o)))
                    .map(|o| tombstone((*o).clone()))
                    .collect();

                self.writer.apply_watcher_event(&Event::InitDone);
                for obj in std::mem::take(&mut self.listed) {
                    self.send(obj);
                }
                for obj in vanished {
                    self.store_and_send(obj);
                }
                return true;
            }
            Event::Apply(obj) => self.store_and_send(obj),
            Event::Delete(obj) => self.store_and_send(tombstone(obj)),
        }
        false
    }

    fn command(&mut self, command: Command<K>) {
        match command {
            Command::Bury(obj) => {
                if self.writer.as_reader().get(&self.object_ref(&obj)).is_none() {
                    self.store_and_send(tombstone(obj));
                }
            }
            Command::Purge(obj) => {
                let current = self.writer.as_reader().get(&self.object_ref(&obj));
                // A recreated object replaced the tombstone; keep it
                if current.is_some_and(|o| is_tombstone(o.as_ref())) {
                    self.writer.apply_watcher_event(&Event::Delete(obj));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cm_ref(name: &str) -> ObjectRef<ConfigMap> {
        ObjectRef::new(name).within("default")
    }

    fn drain(trigger: &mut Trigger<ConfigMap>) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(Some(Ok(obj))) = trigger.next().now_or_never() {
            let marker = if is_tombstone(&obj) { "-" } else { "+" };
            names.push(format!("{marker}{}", obj.name_any()));
        }
        names
    }

    #[test]
    fn keys_round_trip_namespaced_and_cluster_scoped() {
        assert_eq!(object_key(Some("team-a"), "web"), "team-a/web");
        assert_eq!(split_object_key("team-a/web"), (Some("team-a"), "web"));
        assert_eq!(split_object_key("node-1"), (None, "node-1"));
    }

    #[test]
    fn tombstones_look_like_terminating_objects() {
        let dead = tombstone(cm("web"));
        assert!(is_tombstone(&dead));
        assert!(dead.metadata.deletion_timestamp.is_some());
        assert!(!is_tombstone(&cm("web")));
    }

    /// Story: a deleted object stays visible until its reconciler is done
    ///
    /// The initial list is triggered only once complete; a delete leaves a
    /// tombstone in the store that is purged on request.
    #[tokio::test]
    async fn story_deletions_reach_the_reconciler_as_tombstones() {
        let (feed, mut trigger) = Feed::<ConfigMap>::new(());
        let store = feed.store();
        let tombstones = feed.tombstones();
        let cancel = CancellationToken::new();

        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(cm("web"))),
            Ok(Event::InitApply(cm("db"))),
            Ok(Event::InitDone),
            Ok(Event::Delete(cm("db"))),
        ]);
        let mut lists = 0;
        feed.run(events, &cancel, || lists += 1).await;

        assert_eq!(lists, 1);
        assert_eq!(drain(&mut trigger), vec!["+web", "+db", "-db"]);
        let db = store.get(&cm_ref("db")).unwrap();
        assert!(is_tombstone(db.as_ref()));

        // The feed stopped, so purging is a no-op that must not panic
        tombstones.purge(&cm("db"));
    }

    #[tokio::test]
    async fn purge_removes_the_tombstone_and_bury_skips_live_objects() {
        let (feed, mut trigger) = Feed::<ConfigMap>::new(());
        let store = feed.store();
        let tombstones = feed.tombstones();
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::unbounded();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { feed.run(rx, &cancel, || {}).await }
        });

        tx.unbounded_send(Ok(Event::Apply(cm("web")))).unwrap();
        tx.unbounded_send(Ok(Event::Delete(cm("old")))).unwrap();
        for _ in 0..100 {
            if store.get(&cm_ref("old")).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        tombstones.bury(cm("web"));
        tombstones.bury(cm("orphan"));
        tombstones.purge(&cm("old"));
        for _ in 0..100 {
            if store.get(&cm_ref("old")).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!is_tombstone(store.get(&cm_ref("web")).unwrap().as_ref()));
        assert!(is_tombstone(store.get(&cm_ref("orphan")).unwrap().as_ref()));
        assert!(store.get(&cm_ref("old")).is_none());

        cancel.cancel();
        running.await.unwrap();
        assert_eq!(drain(&mut trigger), vec!["+web", "-old", "-orphan"]);
    }

    /// Story: an object is deleted while the watch is reconnecting
    ///
    /// The relist no longer returns it, so it becomes a tombstone instead of
    /// silently disappearing from the store.
    #[tokio::test]
    async fn story_objects_missing_from_a_relist_become_tombstones() {
        let (feed, mut trigger) = Feed::<ConfigMap>::new(());
        let store = feed.store();

        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(cm("web"))),
            Ok(Event::InitApply(cm("db"))),
            Ok(Event::InitDone),
            Ok(Event::Init),
            Ok(Event::InitApply(cm("web"))),
            Ok(Event::InitDone),
        ]);
        let mut lists = 0;
        feed.run(events, &CancellationToken::new(), || lists += 1)
            .await;

        assert_eq!(lists, 2);
        assert_eq!(drain(&mut trigger), vec!["+web", "+db", "+web", "-db"]);
        assert!(is_tombstone(store.get(&cm_ref("db")).unwrap().as_ref()));
    }
}
