//! Reflex - cross-cluster object reflection for peered Kubernetes clusters

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reflex::clients::ClientCache;
use reflex::config::{default_config_group_version, EngineConfig, DEFAULT_CONFIG_NAME};
use reflex::crd::{ClusterConfig, PeeringPhase};
use reflex::dispatcher::{forward_phase_changes, Dispatcher};
use reflex::peering::PeeringState;
use reflex::pod::{KubeEnvSource, KubeLocalPods, KubeProvider, PodController};
use reflex::reflection::{ForgeContext, KubeReflectorFactory, NamespaceMap};
use reflex::FIELD_MANAGER;

/// Reflex - mirror Kubernetes objects into a peered cluster
#[derive(Parser, Debug)]
#[command(name = "reflex", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reflection engine for one peered cluster
    ///
    /// Watches the ClusterConfig object, mirrors the configured resource
    /// types into the remote cluster and, when a virtual node name is given,
    /// runs the pods bound to that node in the remote cluster.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Id of this cluster, stamped on every mirror
    #[arg(long, env = "REFLEX_CLUSTER_ID")]
    cluster_id: String,

    /// Id of the peered cluster
    #[arg(long, env = "REFLEX_REMOTE_CLUSTER_ID")]
    remote_cluster_id: String,

    /// Kubeconfig of the peered cluster (defaults to the ambient config)
    #[arg(long, env = "REFLEX_REMOTE_KUBECONFIG")]
    remote_kubeconfig: Option<PathBuf>,

    /// Name of the virtual node standing for the peered cluster
    #[arg(long, env = "REFLEX_NODE_NAME")]
    node_name: Option<String>,

    /// Group/version of the ClusterConfig object to watch
    #[arg(long, default_value_t = default_config_group_version())]
    config_group_version: String,

    /// Name of the ClusterConfig object to watch; other objects are ignored
    #[arg(long, env = "REFLEX_CONFIG_NAME", default_value = DEFAULT_CONFIG_NAME)]
    config_name: String,

    /// Peering phase assumed at startup
    #[arg(long, env = "REFLEX_PEERING_PHASE", default_value = "established")]
    peering_phase: PeeringPhase,

    /// Namespace mapping, as `local=remote,local2=remote2`
    #[arg(long, env = "REFLEX_NAMESPACE_MAP")]
    namespace_map: Option<NamespaceMap>,

    /// Workers per reflected resource type
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Pods reconciled concurrently by each pod controller
    #[arg(long, default_value_t = 4)]
    pod_workers: usize,
}

impl ControllerArgs {
    fn into_config(self) -> EngineConfig {
        EngineConfig {
            cluster_id: self.cluster_id,
            remote_cluster_id: self.remote_cluster_id,
            remote_kubeconfig: self.remote_kubeconfig,
            node_name: self.node_name,
            config_group_version: self.config_group_version,
            config_name: self.config_name,
            initial_phase: self.peering_phase,
            reflector_workers: self.workers,
            pod_workers: self.pod_workers,
            namespace_map: self.namespace_map.unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ClusterConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args.into_config()).await,
        None => Err(anyhow::anyhow!("no command given, run with --help")),
    }
}

/// Install or update the ClusterConfig CRD
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = ClusterConfig::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("ClusterConfig CRD has no name"))?;

    tracing::info!(%name, "Installing ClusterConfig CRD...");
    crds.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install ClusterConfig CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: EngineConfig) -> anyhow::Result<()> {
    config.validate()?;
    tracing::info!(
        cluster_id = %config.cluster_id,
        remote_cluster_id = %config.remote_cluster_id,
        "Reflex controller starting..."
    );

    let local = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    ensure_crds_installed(&local).await?;

    let clients = ClientCache::new();
    clients.insert(config.cluster_id.clone(), local.clone()).await;
    let remote = clients
        .init(&config.remote_cluster_id, config.remote_kubeconfig.as_deref())
        .await?;

    let peering = PeeringState::new(config.remote_cluster_id.clone(), config.initial_phase);
    let forge_ctx = ForgeContext::new(config.cluster_id.clone(), config.namespace_map.clone());
    let factory = KubeReflectorFactory::new(local.clone(), remote.clone(), forge_ctx)
        .workers(config.reflector_workers)
        .backoff(config.retry.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        config.remote_cluster_id.clone(),
        Arc::new(factory),
        peering.phase(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let phase_trigger = tokio::spawn(forward_phase_changes(
        peering.subscribe(),
        dispatcher.clone(),
        cancel.clone(),
    ));

    let pod_controller = match &config.node_name {
        Some(node) => {
            tracing::info!(%node, "Starting pod reflection for virtual node");
            let pods: Api<Pod> = Api::all(local.clone());
            let watch_config = watcher::Config::default().fields(&format!("spec.nodeName={node}"));
            let events = watcher::watcher(pods, watch_config).default_backoff();

            let controller = Arc::new(
                PodController::new(
                    Arc::new(KubeProvider::new(
                        remote.clone(),
                        config.cluster_id.clone(),
                        config.namespace_map.clone(),
                        cancel.child_token(),
                    )),
                    Arc::new(KubeLocalPods::new(local.clone())),
                    Arc::new(KubeEnvSource::new(local.clone())),
                    node.clone(),
                    config.retry.clone(),
                )
                .workers(config.pod_workers),
            );
            Some(tokio::spawn(controller.run(events, cancel.clone())))
        }
        None => None,
    };

    let result = dispatcher
        .watch_configuration(
            local,
            &config.config_group_version,
            &config.config_name,
            cancel.clone(),
        )
        .await;

    // The configuration watch only returns on shutdown or fatal error
    cancel.cancel();
    dispatcher.shutdown().await;
    if let Err(e) = phase_trigger.await {
        tracing::warn!(error = %e, "Phase trigger ended abnormally");
    }
    if let Some(task) = pod_controller {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Pod controller ended abnormally");
        }
    }

    result?;
    tracing::info!("Reflex controller stopped");
    Ok(())
}
