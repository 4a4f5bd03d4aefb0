//! Stories about how a Foo's Deployment is created, scaled and repaired
//!
//! Each story uses its own Foo name so stories can run side by side.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

use crds_controller::crd::{Foo, FooSpec};
use crds_controller::workload::{controller_of, replicas};

use super::helpers::{ensure_test_cluster, start_controller, wait_for, TEST_NAMESPACE};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(60);

async fn deployment_replicas(client: &Client, name: &str) -> Option<i32> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    deployments
        .get_opt(name)
        .await
        .ok()
        .flatten()
        .and_then(|d| replicas(&d))
}

async fn cleanup(client: &Client, name: &str) {
    let foos: Api<Foo> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = foos.delete(name, &DeleteParams::default()).await;
    let _ = deployments.delete(name, &DeleteParams::default()).await;
}

/// Story: a platform operator creates a Foo and later scales it
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn story_foo_gets_a_deployment_that_follows_its_count() {
    let client = ensure_test_cluster().await;
    let name = "story-scale";
    cleanup(&client, name).await;
    let _controller = start_controller(client.clone());

    let foos: Api<Foo> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let created = foos
        .create(&PostParams::default(), &Foo::new(name, FooSpec::new(Some(2), "hello")))
        .await
        .expect("create Foo");

    wait_for("deployment with 2 replicas", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { deployment_replicas(&client, name).await == Some(2) }
    })
    .await;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let dep = deployments.get(name).await.expect("deployment exists");
    assert_eq!(
        controller_of(&dep.metadata).map(|o| o.uid.clone()),
        created.uid(),
        "deployment is controlled by the Foo"
    );

    foos.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "spec": { "count": 4 } })),
    )
    .await
    .expect("scale Foo");

    wait_for("deployment scaled to 4", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { deployment_replicas(&client, name).await == Some(4) }
    })
    .await;

    cleanup(&client, name).await;
}

/// Story: someone deletes the managed Deployment and the controller puts it back
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn story_deleted_deployment_is_recreated() {
    let client = ensure_test_cluster().await;
    let name = "story-recreate";
    cleanup(&client, name).await;
    let _controller = start_controller(client.clone());

    let foos: Api<Foo> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    foos.create(&PostParams::default(), &Foo::new(name, FooSpec::new(Some(1), "hi")))
        .await
        .expect("create Foo");

    wait_for("initial deployment", CONVERGE_TIMEOUT, || {
        let client = client.clone();
        async move { deployment_replicas(&client, name).await == Some(1) }
    })
    .await;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let original = deployments.get(name).await.expect("deployment exists");
    deployments
        .delete(name, &DeleteParams::default())
        .await
        .expect("delete deployment");

    wait_for("replacement deployment", CONVERGE_TIMEOUT, || {
        let deployments = deployments.clone();
        let original_uid = original.uid();
        async move {
            matches!(
                deployments.get_opt(name).await,
                Ok(Some(dep)) if dep.uid() != original_uid
            )
        }
    })
    .await;

    cleanup(&client, name).await;
}
