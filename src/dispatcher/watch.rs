//! Configuration watch and peering phase trigger

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::{Api, ListParams};
use kube::core::GroupVersion;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Dispatcher;
use crate::crd::{ClusterConfig, ClusterConfigSpec, PeeringPhase};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Attempts to reach the configuration API before giving up
const CONFIG_CONNECT_ATTEMPTS: u32 = 3;

/// Validate a configuration group/version such as `config.reflex.dev/v1alpha1`.
///
/// Only the group/version served by the [`ClusterConfig`] type is accepted.
pub fn parse_config_group_version(group_version: &str) -> Result<GroupVersion, Error> {
    let malformed =
        || Error::configuration_watch(format!("malformed group/version {group_version:?}"));

    let trimmed = group_version.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(malformed());
    }
    let gv: GroupVersion = trimmed.parse().map_err(|_| malformed())?;
    if gv.version.is_empty() || gv.group.contains('/') {
        return Err(malformed());
    }

    let expected = GroupVersion::gv(&ClusterConfig::group(&()), &ClusterConfig::version(&()));
    if gv != expected {
        return Err(Error::configuration_watch(format!(
            "unsupported configuration group/version {gv:?}, expected {}",
            expected.api_version()
        )));
    }
    Ok(gv)
}

fn empty_config(name: &str) -> ClusterConfig {
    ClusterConfig::new(name, ClusterConfigSpec::default())
}

impl Dispatcher {
    /// Watch the cluster configuration named `config_name` and reconcile on
    /// every change.
    ///
    /// Fails before watching if `group_version` is malformed or the API cannot
    /// be reached. Otherwise runs until `cancel` fires.
    pub async fn watch_configuration(
        &self,
        client: Client,
        group_version: &str,
        config_name: &str,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        parse_config_group_version(group_version)?;

        // Other ClusterConfig objects belong to other engines
        let selector = format!("metadata.name={config_name}");
        let api: Api<ClusterConfig> = Api::all(client);
        let retry = RetryConfig::with_max_attempts(CONFIG_CONNECT_ATTEMPTS);
        retry_with_backoff(&retry, "list cluster configuration", || {
            let api = api.clone();
            let params = ListParams::default().fields(&selector).limit(1);
            async move { api.list_metadata(&params).await }
        })
        .await
        .map_err(|e| {
            Error::configuration_watch(format!("cannot reach configuration API: {e}"))
        })?;

        info!(
            cluster_id = %self.cluster_id(),
            %group_version,
            name = %config_name,
            "Watching cluster configuration"
        );
        let events = watcher::watcher(api, watcher::Config::default().fields(&selector))
            .default_backoff();
        self.run_configuration_watch(events, config_name, cancel).await
    }

    /// Drive [`Dispatcher::reconcile`] from a stream of configuration events.
    ///
    /// Only the object named `config_name` counts. Its deletion, or a relist
    /// that does not find it, reconciles to an empty resource set.
    pub async fn run_configuration_watch<S>(
        &self,
        events: S,
        config_name: &str,
        cancel: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Stream<Item = Result<Event<ClusterConfig>, watcher::Error>> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut seen_on_relist = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(cluster_id = %self.cluster_id(), "Configuration watch cancelled");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(Ok(
                        Event::Apply(config) | Event::InitApply(config) | Event::Delete(config),
                    )) if config.name_any() != config_name => {
                        debug!(name = %config.name_any(), "Ignoring foreign cluster configuration");
                    }
                    Some(Ok(Event::Apply(config))) => {
                        debug!(name = %config.name_any(), "Configuration changed");
                        self.reconcile(&config).await;
                    }
                    Some(Ok(Event::InitApply(config))) => {
                        seen_on_relist = true;
                        self.reconcile(&config).await;
                    }
                    Some(Ok(Event::Delete(config))) => {
                        info!(name = %config.name_any(), "Configuration deleted");
                        self.reconcile(&empty_config(&config.name_any())).await;
                    }
                    Some(Ok(Event::Init)) => {
                        seen_on_relist = false;
                    }
                    Some(Ok(Event::InitDone)) => {
                        if !seen_on_relist {
                            debug!("No configuration present");
                            self.reconcile(&empty_config(config_name)).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Configuration watch error, will retry");
                    }
                    None => {
                        return Err(Error::configuration_watch("configuration watch stream ended"));
                    }
                }
            }
        }
    }
}

/// Forward every peering phase change to `dispatcher` until cancelled
pub async fn forward_phase_changes(
    mut phases: watch::Receiver<PeeringPhase>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = phases.changed() => {
                if changed.is_err() {
                    debug!("Peering state dropped, stopping phase trigger");
                    return;
                }
                let phase = *phases.borrow_and_update();
                dispatcher.reconcile_phase(phase).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DispatcherConfig, Resource};
    use crate::dispatcher::MockReflectorFactory;
    use crate::peering::PeeringState;
    use crate::reflection::ReflectorHandle;
    use std::time::Duration;

    fn offline_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn factory() -> Arc<MockReflectorFactory> {
        let mut factory = MockReflectorFactory::new();
        factory.expect_start().returning(|r| {
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let task = tokio::spawn(async move { token.cancelled().await });
            Ok(ReflectorHandle::new(r.id.clone(), cancel, task))
        });
        Arc::new(factory)
    }

    fn config_with(names: &[&str], phase: PeeringPhase) -> ClusterConfig {
        ClusterConfig::new(
            "reflex",
            ClusterConfigSpec {
                dispatcher_config: DispatcherConfig {
                    resources_to_replicate: names
                        .iter()
                        .map(|n| Resource {
                            group: "net.reflex.dev".to_string(),
                            version: "v1alpha1".to_string(),
                            resource: n.to_string(),
                            peering_phase: phase,
                        })
                        .collect(),
                },
            },
        )
    }

    #[test]
    fn accepts_the_cluster_config_group_version() {
        let gv = parse_config_group_version("config.reflex.dev/v1alpha1").unwrap();
        assert_eq!(gv.group, "config.reflex.dev");
        assert_eq!(gv.version, "v1alpha1");
    }

    #[test]
    fn rejects_malformed_or_foreign_group_versions() {
        for gv in ["", "   ", "config reflex/v1", "a/b/c", "config.reflex.dev/", "apps/v1"] {
            assert!(
                matches!(
                    parse_config_group_version(gv),
                    Err(Error::ConfigurationWatch(_))
                ),
                "{gv:?} should be rejected"
            );
        }
    }

    /// Story: the operator passes a typo in the configuration group/version
    ///
    /// The call fails immediately, before any connection attempt is made.
    #[tokio::test]
    async fn story_malformed_group_version_fails_before_watching() {
        let dispatcher = Dispatcher::new("remote-1", factory(), PeeringPhase::Established);
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.watch_configuration(
                offline_client(),
                "config.reflex.dev/v1alpha1/extra",
                "reflex",
                CancellationToken::new(),
            ),
        )
        .await
        .expect("validation must not wait on the network");
        assert!(matches!(result, Err(Error::ConfigurationWatch(_))));
    }

    /// Story: a valid watch keeps reconciling until it is cancelled
    #[tokio::test]
    async fn story_watch_reconciles_until_cancelled() {
        let dispatcher = Arc::new(Dispatcher::new(
            "remote-1",
            factory(),
            PeeringPhase::Established,
        ));
        let cancel = CancellationToken::new();

        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(config_with(&[], PeeringPhase::Established))),
            Ok(Event::InitDone),
            Ok(Event::Apply(config_with(
                &["networkconfigs", "tunnelendpoints"],
                PeeringPhase::Established,
            ))),
        ])
        .chain(futures::stream::pending());

        let watch = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .run_configuration_watch(events, "reflex", cancel)
                    .await
            })
        };

        for _ in 0..100 {
            if dispatcher.registered_resources().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.registered_resources().await.len(), 2);
        assert!(!watch.is_finished(), "watch must stay active");

        cancel.cancel();
        assert!(watch.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn deleted_configuration_unregisters_everything() {
        let dispatcher = Dispatcher::new("remote-1", factory(), PeeringPhase::Established);
        let cfg = config_with(&["networkconfigs"], PeeringPhase::Established);
        let events = futures::stream::iter(vec![
            Ok(Event::Apply(cfg.clone())),
            Ok(Event::Delete(cfg)),
        ]);

        // The finite stream ends the watch with an error
        let result = dispatcher
            .run_configuration_watch(events, "reflex", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ConfigurationWatch(_))));
        assert!(dispatcher.registered_resources().await.is_empty());
        assert_eq!(dispatcher.unregistered_resources().await.len(), 1);
    }

    /// Story: a second ClusterConfig exists in the cluster
    ///
    /// Only the configured object drives the dispatcher; the other one can be
    /// applied and deleted without touching the running reflectors.
    #[tokio::test]
    async fn story_foreign_configuration_is_ignored() {
        let dispatcher = Dispatcher::new("remote-1", factory(), PeeringPhase::Established);
        let mut stray = config_with(&["tunnelendpoints"], PeeringPhase::Established);
        stray.metadata.name = Some("other".to_string());

        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(config_with(&["networkconfigs"], PeeringPhase::Established))),
            Ok(Event::InitApply(stray.clone())),
            Ok(Event::InitDone),
            Ok(Event::Apply(stray.clone())),
            Ok(Event::Delete(stray)),
        ]);
        let _ = dispatcher
            .run_configuration_watch(events, "reflex", CancellationToken::new())
            .await;

        let registered = dispatcher.registered_resources().await;
        assert_eq!(registered.len(), 1);
        assert!(registered.iter().any(|r| r.id.resource == "networkconfigs"));
        assert!(dispatcher.unregistered_resources().await.is_empty());
    }

    #[tokio::test]
    async fn relist_without_the_named_configuration_unregisters_everything() {
        let dispatcher = Dispatcher::new("remote-1", factory(), PeeringPhase::Established);
        let mut stray = config_with(&["tunnelendpoints"], PeeringPhase::Established);
        stray.metadata.name = Some("other".to_string());

        let events = futures::stream::iter(vec![
            Ok(Event::Apply(config_with(&["networkconfigs"], PeeringPhase::Established))),
            Ok(Event::Init),
            Ok(Event::InitApply(stray)),
            Ok(Event::InitDone),
        ]);
        let _ = dispatcher
            .run_configuration_watch(events, "reflex", CancellationToken::new())
            .await;

        assert!(dispatcher.registered_resources().await.is_empty());
    }

    #[tokio::test]
    async fn phase_changes_are_forwarded() {
        let dispatcher = Arc::new(Dispatcher::new("remote-1", factory(), PeeringPhase::None));
        dispatcher
            .reconcile(&config_with(&["networkconfigs"], PeeringPhase::Established))
            .await;
        assert!(dispatcher.registered_resources().await.is_empty());

        let peering = PeeringState::new("remote-1", PeeringPhase::None);
        let cancel = CancellationToken::new();
        let trigger = tokio::spawn(forward_phase_changes(
            peering.subscribe(),
            dispatcher.clone(),
            cancel.clone(),
        ));

        peering.set_phase(PeeringPhase::Established);
        for _ in 0..100 {
            if !dispatcher.registered_resources().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.registered_resources().await.len(), 1);

        cancel.cancel();
        trigger.await.unwrap();
    }
}
