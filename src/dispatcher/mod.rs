//! Dispatcher: keeps the running reflectors equal to configuration and phase
//!
//! The dispatcher owns the registered/unregistered resource sets. Every
//! mutation happens in [`Dispatcher::reconcile`] or
//! [`Dispatcher::reconcile_phase`], both serialized by one lock, so a type is
//! never started twice and the registered set never contains a type whose
//! reflector failed to start.
//!
//! Set comparisons use the `(group, version, resource)` triple only. Raising
//! the required phase of an already registered type does not restart it; the
//! new requirement is enforced the next time the phase itself changes.

mod watch;

pub use watch::{forward_phase_changes, parse_config_group_version};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ClusterConfig, PeeringPhase, ReplicatedResource, ResourceId};
use crate::reflection::ReflectorHandle;
use crate::Error;

/// Starts reflectors for the dispatcher
///
/// The production implementation resolves the type on both clusters and
/// spawns a watch; tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReflectorFactory: Send + Sync {
    /// Start mirroring `resource`.
    ///
    /// An error means the type cannot be reflected right now (for example the
    /// kind is not served by the remote API server).
    async fn start(&self, resource: &ReplicatedResource) -> Result<ReflectorHandle, Error>;
}

struct Registration {
    resource: ReplicatedResource,
    handle: ReflectorHandle,
}

struct DispatcherState {
    registered: BTreeMap<ResourceId, Registration>,
    unregistered: BTreeMap<ResourceId, ReplicatedResource>,
    desired: BTreeMap<ResourceId, ReplicatedResource>,
    phase: PeeringPhase,
}

/// Starts and stops reflectors for one remote cluster
pub struct Dispatcher {
    cluster_id: String,
    factory: Arc<dyn ReflectorFactory>,
    state: Mutex<DispatcherState>,
}

/// Resource types listed in `config`, keyed by identity.
///
/// Duplicate entries collapse; the last one wins. Incomplete entries are
/// dropped. Phase is not consulted.
pub fn desired_resources(config: &ClusterConfig) -> BTreeMap<ResourceId, ReplicatedResource> {
    config
        .spec
        .replicated_resources()
        .map(|r| (r.id.clone(), r))
        .collect()
}

impl Dispatcher {
    /// Create a dispatcher for `cluster_id`, starting at `phase`
    pub fn new(
        cluster_id: impl Into<String>,
        factory: Arc<dyn ReflectorFactory>,
        phase: PeeringPhase,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            factory,
            state: Mutex::new(DispatcherState {
                registered: BTreeMap::new(),
                unregistered: BTreeMap::new(),
                desired: BTreeMap::new(),
                phase,
            }),
        }
    }

    /// Remote cluster this dispatcher replicates to
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Registered types absent from `desired`, compared by identity only
    pub async fn resources_to_unregister(
        &self,
        desired: &BTreeMap<ResourceId, ReplicatedResource>,
    ) -> BTreeSet<ResourceId> {
        let state = self.state.lock().await;
        removed_from(&state.registered, desired)
    }

    /// Apply a new configuration.
    ///
    /// Stops reflectors for types no longer listed, then starts reflectors for
    /// listed types that are eligible in the current phase and not running.
    #[instrument(skip(self, config), fields(cluster_id = %self.cluster_id))]
    pub async fn reconcile(&self, config: &ClusterConfig) {
        if let Err(e) = config.spec.validate() {
            warn!(error = %e, "Ignoring invalid entries in cluster configuration");
        }
        let desired = desired_resources(config);

        let mut state = self.state.lock().await;
        state.unregistered.clear();

        for id in removed_from(&state.registered, &desired) {
            if let Some(registration) = state.registered.remove(&id) {
                registration.handle.stop().await;
                info!(resource = %id, "Resource unregistered");
                state.unregistered.insert(id, registration.resource);
            }
        }

        // Kept types pick up a changed phase requirement without a restart
        for (id, registration) in state.registered.iter_mut() {
            if let Some(wanted) = desired.get(id) {
                registration.resource.peering_phase = wanted.peering_phase;
            }
        }

        state.desired = desired;
        self.start_eligible(&mut state).await;
    }

    /// Re-evaluate registrations after the peering phase changed.
    ///
    /// Types whose required phase is no longer met are stopped; newly
    /// eligible configured types are started.
    #[instrument(skip(self), fields(cluster_id = %self.cluster_id))]
    pub async fn reconcile_phase(&self, phase: PeeringPhase) {
        let mut state = self.state.lock().await;
        state.phase = phase;

        let ineligible: Vec<ResourceId> = state
            .registered
            .iter()
            .filter(|(_, r)| !r.resource.is_eligible(phase))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ineligible {
            if let Some(registration) = state.registered.remove(&id) {
                registration.handle.stop().await;
                info!(resource = %id, %phase, "Resource unregistered, peering phase too low");
            }
        }

        self.start_eligible(&mut state).await;
    }

    async fn start_eligible(&self, state: &mut DispatcherState) {
        let phase = state.phase;
        let pending: Vec<ReplicatedResource> = state
            .desired
            .values()
            .filter(|r| !state.registered.contains_key(&r.id))
            .cloned()
            .collect();

        for resource in pending {
            if !resource.is_eligible(phase) {
                debug!(resource = %resource.id, required = %resource.peering_phase, %phase, "Waiting for peering phase");
                continue;
            }
            match self.factory.start(&resource).await {
                Ok(handle) => {
                    info!(resource = %resource.id, "Resource registered");
                    state
                        .registered
                        .insert(resource.id.clone(), Registration { resource, handle });
                }
                Err(e) => {
                    // Retried on the next configuration or phase change
                    warn!(resource = %resource.id, error = %e, "Failed to register resource");
                }
            }
        }
    }

    /// Types whose reflector is running
    pub async fn registered_resources(&self) -> Vec<ReplicatedResource> {
        let state = self.state.lock().await;
        state
            .registered
            .values()
            .map(|r| r.resource.clone())
            .collect()
    }

    /// Types stopped by the most recent configuration change
    pub async fn unregistered_resources(&self) -> Vec<ReplicatedResource> {
        let state = self.state.lock().await;
        state.unregistered.values().cloned().collect()
    }

    /// Current peering phase as seen by the dispatcher
    pub async fn phase(&self) -> PeeringPhase {
        self.state.lock().await.phase
    }

    /// Stop every running reflector
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let registered = std::mem::take(&mut state.registered);
        for (id, registration) in registered {
            registration.handle.stop().await;
            debug!(resource = %id, "Reflector stopped on shutdown");
        }
        state.desired.clear();
        info!(cluster_id = %self.cluster_id, "Dispatcher shut down");
    }
}

fn removed_from(
    registered: &BTreeMap<ResourceId, Registration>,
    desired: &BTreeMap<ResourceId, ReplicatedResource>,
) -> BTreeSet<ResourceId> {
    registered
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterConfigSpec, DispatcherConfig, Resource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    const NET_GROUP: &str = "net.reflex.dev";

    fn resource(name: &str) -> Resource {
        Resource {
            group: NET_GROUP.to_string(),
            version: "v1alpha1".to_string(),
            resource: name.to_string(),
            peering_phase: PeeringPhase::Established,
        }
    }

    fn config(resources: Vec<Resource>) -> ClusterConfig {
        ClusterConfig::new(
            "reflex",
            ClusterConfigSpec {
                dispatcher_config: DispatcherConfig {
                    resources_to_replicate: resources,
                },
            },
        )
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new(NET_GROUP, "v1alpha1", name)
    }

    fn idle_handle(resource: &ReplicatedResource) -> ReflectorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        ReflectorHandle::new(resource.id.clone(), cancel, task)
    }

    fn accepting_factory() -> MockReflectorFactory {
        let mut factory = MockReflectorFactory::new();
        factory
            .expect_start()
            .returning(|r| Ok(idle_handle(r)));
        factory
    }

    fn ids(resources: Vec<ReplicatedResource>) -> BTreeSet<String> {
        resources.into_iter().map(|r| r.id.resource).collect()
    }

    #[test]
    fn empty_configuration_desires_nothing() {
        assert!(desired_resources(&config(vec![])).is_empty());
    }

    #[test]
    fn two_listed_resources_are_both_desired() {
        let desired = desired_resources(&config(vec![
            resource("tunnelendpoints"),
            resource("networkconfigs"),
        ]));
        assert_eq!(desired.len(), 2);
        assert!(desired.contains_key(&id("networkconfigs")));
        assert!(desired.contains_key(&id("tunnelendpoints")));
    }

    #[tokio::test]
    async fn incomplete_entries_never_reach_the_factory() {
        let mut factory = MockReflectorFactory::new();
        factory
            .expect_start()
            .withf(|r| r.id.resource == "networkconfigs")
            .times(1)
            .returning(|r| Ok(idle_handle(r)));
        let dispatcher = Dispatcher::new("remote-1", Arc::new(factory), PeeringPhase::Established);

        let mut no_version = resource("tunnelendpoints");
        no_version.version = String::new();
        let cfg = config(vec![resource("networkconfigs"), no_version]);
        assert_eq!(desired_resources(&cfg).len(), 1);

        dispatcher.reconcile(&cfg).await;
        assert_eq!(
            ids(dispatcher.registered_resources().await),
            BTreeSet::from(["networkconfigs".to_string()])
        );
    }

    /// Story: unregistration compares identity, never the phase field
    ///
    /// Registered = {networkconfigs, tunnelendpoints}. The same set with a
    /// different phase requirement removes nothing; replacing tunnelendpoints
    /// by tunnelendpoints-wrong removes exactly tunnelendpoints.
    #[tokio::test]
    async fn story_resources_to_unregister_is_set_difference() {
        let dispatcher = Dispatcher::new(
            "remote-1",
            Arc::new(accepting_factory()),
            PeeringPhase::Established,
        );
        dispatcher
            .reconcile(&config(vec![
                resource("networkconfigs"),
                resource("tunnelendpoints"),
            ]))
            .await;

        let mut same = desired_resources(&config(vec![
            resource("networkconfigs"),
            resource("tunnelendpoints"),
        ]));
        for r in same.values_mut() {
            r.peering_phase = PeeringPhase::Authenticated;
        }
        assert!(dispatcher.resources_to_unregister(&same).await.is_empty());

        let changed = desired_resources(&config(vec![
            resource("networkconfigs"),
            resource("tunnelendpoints-wrong"),
        ]));
        let removed = dispatcher.resources_to_unregister(&changed).await;
        assert_eq!(removed, BTreeSet::from([id("tunnelendpoints")]));

        // Pure: nothing was stopped
        assert_eq!(dispatcher.registered_resources().await.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_twice_starts_nothing_new() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut factory = MockReflectorFactory::new();
        let counter = starts.clone();
        factory.expect_start().returning(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(idle_handle(r))
        });
        let dispatcher = Dispatcher::new("remote-1", Arc::new(factory), PeeringPhase::Established);

        let cfg = config(vec![resource("networkconfigs"), resource("tunnelendpoints")]);
        dispatcher.reconcile(&cfg).await;
        let first = ids(dispatcher.registered_resources().await);
        dispatcher.reconcile(&cfg).await;

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(ids(dispatcher.registered_resources().await), first);
        assert!(dispatcher.unregistered_resources().await.is_empty());
    }

    /// Story: a kind the remote cluster does not serve
    ///
    /// The failing type must not appear as registered; the next reconcile
    /// tries it again.
    #[tokio::test]
    async fn story_failed_registration_is_retried_later() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut factory = MockReflectorFactory::new();
        let counter = attempts.clone();
        factory.expect_start().returning(move |r| {
            if r.id.resource == "tunnelendpoints"
                && counter.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(Error::registration(r.id.to_string(), "not served"));
            }
            Ok(idle_handle(r))
        });
        let dispatcher = Dispatcher::new("remote-1", Arc::new(factory), PeeringPhase::Established);

        let cfg = config(vec![resource("networkconfigs"), resource("tunnelendpoints")]);
        dispatcher.reconcile(&cfg).await;
        assert_eq!(
            ids(dispatcher.registered_resources().await),
            BTreeSet::from(["networkconfigs".to_string()])
        );

        dispatcher.reconcile(&cfg).await;
        assert_eq!(dispatcher.registered_resources().await.len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    /// Story: replication waits for the peering to be established
    ///
    /// A type requiring Bidirectional stays idle until the phase reaches it,
    /// and is stopped again when the peering is torn down.
    #[tokio::test]
    async fn story_phase_changes_gate_registration() {
        let dispatcher = Dispatcher::new(
            "remote-1",
            Arc::new(accepting_factory()),
            PeeringPhase::Authenticated,
        );

        let mut bidirectional = resource("tunnelendpoints");
        bidirectional.peering_phase = PeeringPhase::Bidirectional;
        let mut early = resource("networkconfigs");
        early.peering_phase = PeeringPhase::Authenticated;
        dispatcher
            .reconcile(&config(vec![early, bidirectional]))
            .await;
        assert_eq!(
            ids(dispatcher.registered_resources().await),
            BTreeSet::from(["networkconfigs".to_string()])
        );

        dispatcher.reconcile_phase(PeeringPhase::Bidirectional).await;
        assert_eq!(dispatcher.registered_resources().await.len(), 2);

        dispatcher.reconcile_phase(PeeringPhase::None).await;
        assert!(dispatcher.registered_resources().await.is_empty());
        assert_eq!(dispatcher.phase().await, PeeringPhase::None);
    }

    #[tokio::test]
    async fn phase_only_config_change_keeps_reflector_running() {
        let mut factory = MockReflectorFactory::new();
        factory
            .expect_start()
            .times(1)
            .returning(|r| Ok(idle_handle(r)));
        let dispatcher = Dispatcher::new("remote-1", Arc::new(factory), PeeringPhase::Bidirectional);

        dispatcher
            .reconcile(&config(vec![resource("networkconfigs")]))
            .await;

        let mut raised = resource("networkconfigs");
        raised.peering_phase = PeeringPhase::Bidirectional;
        dispatcher.reconcile(&config(vec![raised])).await;

        let registered = dispatcher.registered_resources().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].peering_phase, PeeringPhase::Bidirectional);
        assert!(dispatcher.unregistered_resources().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_every_reflector() {
        let dispatcher = Dispatcher::new(
            "remote-1",
            Arc::new(accepting_factory()),
            PeeringPhase::Established,
        );
        dispatcher
            .reconcile(&config(vec![resource("networkconfigs")]))
            .await;
        dispatcher.shutdown().await;
        assert!(dispatcher.registered_resources().await.is_empty());
    }
}
