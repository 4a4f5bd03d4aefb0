//! Shared setup for cluster tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use crds_controller::config::ControllerConfig;
use crds_controller::controller::{Context, Engine};
use crds_controller::crd::Foo;
use crds_controller::informer::Informer;

/// Namespace the stories run in
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the cluster and make sure the Foo CRD is served
pub async fn ensure_test_cluster() -> Client {
    let client = Client::try_default()
        .await
        .expect("kubeconfig for a test cluster");

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        "foos.sample.dev",
        &PatchParams::apply("crds-controller-tests").force(),
        &Patch::Apply(Foo::crd()),
    )
    .await
    .expect("install Foo CRD");

    let foos: Api<Foo> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    wait_for("Foo CRD to be served", Duration::from_secs(30), || {
        let foos = foos.clone();
        async move { foos.list(&ListParams::default().limit(1)).await.is_ok() }
    })
    .await;

    client
}

/// Poll `check` every 250ms until it returns true, panicking after `timeout`
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// A controller running in the test process; stopped on drop
pub struct RunningController {
    cancel: CancellationToken,
}

impl Drop for RunningController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start informers and workers the same way the binary does
pub fn start_controller(client: Client) -> RunningController {
    let config = ControllerConfig::default().workers(2);
    let cancel = CancellationToken::new();

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
    .build();
    let engine = Arc::new(Engine::new(Arc::new(ctx), &config.rate_limit));

    tokio::spawn(foos.run(engine.clone(), cancel.clone()));
    tokio::spawn(deployments.run(engine.clone(), cancel.clone()));
    tokio::spawn(engine.run(config.workers, config.cache_sync_timeout, cancel.clone()));

    RunningController { cancel }
}
