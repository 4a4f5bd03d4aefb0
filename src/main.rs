//! crds-controller - reconciles Foo custom resources into Deployments

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Api, Client, Config, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crds_controller::config::{ControllerConfig, DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS};
use crds_controller::controller::{default_scheme, Context, Engine};
use crds_controller::crd::Foo;
use crds_controller::informer::{EventHandler, Informer, Mirrored};
use crds_controller::telemetry::{init_telemetry, TelemetryConfig};
use crds_controller::Error;

/// crds-controller - keeps one Deployment per Foo at the declared replica count
#[derive(Parser, Debug)]
#[command(name = "crds-controller", version, about, long_about = None)]
struct Cli {
    /// Generate the Foo CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file; in-cluster or default config when unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "CRDS_CONTROLLER_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds between full informer resyncs (0 disables resync)
    #[arg(
        long,
        env = "CRDS_CONTROLLER_RESYNC_SECS",
        default_value_t = DEFAULT_RESYNC_PERIOD.as_secs()
    )]
    resync_secs: u64,

    /// Seconds to wait for the caches to sync before starting workers anyway;
    /// waits indefinitely when unset
    #[arg(long, env = "CRDS_CONTROLLER_CACHE_SYNC_TIMEOUT_SECS")]
    cache_sync_timeout_secs: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long, env = "CRDS_CONTROLLER_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .workers(self.workers)
            .resync_period(Duration::from_secs(self.resync_secs))
            .cache_sync_timeout(self.cache_sync_timeout_secs.map(Duration::from_secs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Foo::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    run_controller(cli.kubeconfig.as_deref(), cli.controller_config()).await
}

async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e));
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Invalid kubeconfig {:?}: {}", path, e))?;
    Client::try_from(config).map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Run the informers and the engine until interrupted or a fatal error occurs
async fn run_controller(kubeconfig: Option<&Path>, config: ControllerConfig) -> anyhow::Result<()> {
    let client = build_client(kubeconfig).await?;
    info!(
        workers = config.workers,
        resync_secs = config.resync_period.as_secs(),
        "starting crds-controller"
    );

    let foos = Informer::new(Api::<Foo>::all(client.clone()), watcher::Config::default())
        .with_resync(config.resync_period);
    let deployments =
        Informer::new(Api::<Deployment>::all(client.clone()), watcher::Config::default())
            .with_resync(config.resync_period);

    let ctx = Context::builder(
        client,
        Arc::new(foos.lister()),
        Arc::new(deployments.lister()),
    )
    .scheme(Arc::new(default_scheme()))
    .build();
    let engine = Arc::new(Engine::new(Arc::new(ctx), &config.rate_limit));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "cannot listen for interrupts"),
            }
        });
    }

    let foo_task = tokio::spawn(run_informer(foos, engine.clone(), cancel.clone()));
    let deployment_task = tokio::spawn(run_informer(deployments, engine.clone(), cancel.clone()));
    let engine_task = tokio::spawn(engine.run(
        config.workers,
        config.cache_sync_timeout,
        cancel.clone(),
    ));

    let (foo_result, deployment_result, engine_result) =
        tokio::join!(foo_task, deployment_task, engine_task);
    engine_result?;
    foo_result??;
    deployment_result??;

    info!("crds-controller stopped");
    Ok(())
}

/// Run one informer; whatever ends it ends the whole controller
async fn run_informer<K, H>(
    informer: Informer<K>,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    K: Mirrored,
    H: EventHandler<K> + 'static,
{
    let result = informer.run(handler, cancel.clone()).await;
    match &result {
        Err(e) if e.is_fatal() => error!(error = %e, "fatal error, stopping controller"),
        Err(e) => error!(error = %e, "informer failed, stopping controller"),
        Ok(()) => {}
    }
    cancel.cancel();
    result
}
