//! Desired-state synthesis for Foo-managed Deployments
//!
//! Every function here is pure: the same Foo always yields the same
//! Deployment, which is what makes create/update replays idempotent.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::Foo;
use crate::scheme::Scheme;
use crate::Error;

/// Fixed `app` label value stamped on every managed Deployment
pub const APP_LABEL_VALUE: &str = "nginx";

/// Label carrying the owning Foo's name
pub const CONTROLLER_LABEL: &str = "controller";

const CONTAINER_NAME: &str = "nginx";
const CONTAINER_IMAGE: &str = "nginx:latest";

/// Name of the Deployment managed for `foo`, if it has one
pub fn deployment_name(foo: &Foo) -> Option<String> {
    foo.metadata.name.clone().filter(|name| !name.is_empty())
}

/// Labels shared by the Deployment, its selector and its pod template
pub fn labels(foo: &Foo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL_VALUE.to_string()),
        (CONTROLLER_LABEL.to_string(), foo.name_any()),
    ])
}

/// Pod template running the Foo's message
pub fn pod_template(foo: &Foo) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(foo)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(CONTAINER_IMAGE.to_string()),
                command: Some(vec!["/bin/bash".to_string()]),
                args: Some(vec![
                    "-c".to_string(),
                    format!("echo {} && sleep 3600", foo.spec.message),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

/// Build the Deployment to create for `foo`
///
/// The selector is derived from the Foo's name and is only ever set here;
/// updates go through [`desired_update`], which leaves it untouched.
pub fn new_deployment(foo: &Foo, scheme: &Scheme) -> Result<Deployment, Error> {
    let name = deployment_name(foo)
        .ok_or_else(|| Error::validation(foo.name_any(), "Foo has no name"))?;
    let owner = scheme.controller_ref(foo).ok_or_else(|| {
        Error::validation(
            name.clone(),
            format!(
                "cannot reference {} as owner: kind not registered or object has no UID",
                scheme.owner_kind()
            ),
        )
    })?;

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: foo.namespace(),
            labels: Some(labels(foo)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: foo.spec.count,
            selector: LabelSelector {
                match_labels: Some(labels(foo)),
                ..Default::default()
            },
            template: pod_template(foo),
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the replacement for `existing` that matches `foo`
///
/// Keeps the existing metadata (including `resourceVersion`, so a concurrent
/// writer causes a conflict instead of a lost update) and the immutable
/// selector. Only the replica count and pod template are rewritten.
pub fn desired_update(existing: &Deployment, foo: &Foo) -> Deployment {
    let mut desired = existing.clone();
    desired.metadata.managed_fields = None;
    desired.status = None;

    let spec = desired.spec.get_or_insert_with(Default::default);
    spec.replicas = foo.spec.count;
    spec.template = pod_template(foo);
    desired
}

/// The controller owner reference of an object, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `deployment` is controlled by `foo` (matched by UID)
pub fn is_controlled_by(deployment: &Deployment, foo: &Foo) -> bool {
    match (controller_of(&deployment.metadata), foo.uid()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => false,
    }
}

/// Current replica count of a Deployment
pub fn replicas(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref().and_then(|s| s.replicas)
}
