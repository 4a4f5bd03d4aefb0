//! Foo reconciliation
//!
//! Drives the Deployment named after each Foo towards the Foo's declared
//! replica count. State is always read from the local caches; the only
//! remote calls are the create or update issued through [`DeploymentClient`].

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::client::{DeploymentClient, KubeDeploymentClient};
use crate::crd::Foo;
use crate::informer::Lister;
use crate::scheme::Scheme;
use crate::workload::{desired_update, deployment_name, is_controlled_by, new_deployment, replicas};
use crate::Error;

/// Controller context shared by the event handlers and every worker
pub struct Context {
    /// Cached Foos
    pub foos: Arc<dyn Lister<Foo>>,
    /// Cached Deployments
    pub deployments: Arc<dyn Lister<Deployment>>,
    /// Remote writes for Deployments (trait object for testability)
    pub client: Arc<dyn DeploymentClient>,
    /// Known kinds, including the kind allowed to own Deployments
    pub scheme: Arc<Scheme>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        foos: Arc<dyn Lister<Foo>>,
        deployments: Arc<dyn Lister<Deployment>>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, foos, deployments)
    }

    /// Create a context over explicit caches and writer, using the default scheme
    pub fn new(
        foos: Arc<dyn Lister<Foo>>,
        deployments: Arc<dyn Lister<Deployment>>,
        client: Arc<dyn DeploymentClient>,
    ) -> Self {
        Self {
            foos,
            deployments,
            client,
            scheme: Arc::new(default_scheme()),
        }
    }
}

/// Scheme knowing Foo (as owner) and Deployment
pub fn default_scheme() -> Scheme {
    Scheme::with_owner::<Foo>().register::<Deployment>()
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, foo_lister, deployment_lister).build();
/// ```
pub struct ContextBuilder {
    client: Client,
    foos: Arc<dyn Lister<Foo>>,
    deployments: Arc<dyn Lister<Deployment>>,
    scheme: Option<Arc<Scheme>>,
}

impl ContextBuilder {
    fn new(
        client: Client,
        foos: Arc<dyn Lister<Foo>>,
        deployments: Arc<dyn Lister<Deployment>>,
    ) -> Self {
        Self {
            client,
            foos,
            deployments,
            scheme: None,
        }
    }

    /// Use an explicit scheme
    pub fn scheme(mut self, scheme: Arc<Scheme>) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            foos: self.foos,
            deployments: self.deployments,
            client: Arc::new(KubeDeploymentClient::new(self.client)),
            scheme: self.scheme.unwrap_or_else(|| Arc::new(default_scheme())),
        }
    }
}

/// Queue key for an object: `namespace/name`, or just `name` when cluster-scoped
pub fn key_for<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Split a queue key into `(namespace, name)`
///
/// A key without a slash is cluster-scoped and yields an empty namespace.
pub fn split_meta_namespace_key(key: &str) -> Result<(String, String), Error> {
    let (namespace, name) = match key.split_once('/') {
        None => ("", key),
        Some((_, rest)) if rest.contains('/') => {
            return Err(Error::validation(key, "unexpected key format"));
        }
        Some((ns, name)) => (ns, name),
    };
    if name.is_empty() {
        return Err(Error::validation(key, "key has an empty name"));
    }
    Ok((namespace.to_string(), name.to_string()))
}

/// Reconcile the Foo identified by `key`
///
/// Returns `Ok` when there is nothing (more) to do, including for malformed
/// keys and Foos that no longer exist. Cache and API failures are returned as
/// retryable errors; a Deployment owned by someone else is reported as
/// [`Error::OwnershipConflict`].
#[instrument(skip_all, fields(key = %key))]
pub async fn reconcile(key: &str, ctx: Arc<Context>) -> Result<(), Error> {
    let (namespace, name) = match split_meta_namespace_key(key) {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "dropping invalid key");
            return Ok(());
        }
    };

    let Some(foo) = ctx.foos.get(&namespace, &name)? else {
        debug!("Foo no longer exists");
        return Ok(());
    };

    let Some(dep_name) = deployment_name(&foo) else {
        warn!("Foo has no name to derive a deployment name from");
        return Ok(());
    };
    let foo_ns = foo.namespace().unwrap_or_default();

    let Some(existing) = ctx.deployments.get(&foo_ns, &dep_name)? else {
        let desired = match new_deployment(&foo, &ctx.scheme) {
            Ok(desired) => desired,
            Err(e @ Error::Validation { .. }) => {
                warn!(error = %e, "cannot build deployment for Foo");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(deployment = %dep_name, replicas = ?foo.spec.count, "creating deployment");
        ctx.client.create(&foo_ns, &desired).await?;
        return Ok(());
    };

    if !is_controlled_by(&existing, &foo) {
        return Err(Error::ownership_conflict(foo_ns, dep_name, foo.name_any()));
    }

    if let Some(count) = foo.spec.count {
        let current = replicas(&existing);
        if current != Some(count) {
            info!(
                deployment = %dep_name,
                current = ?current,
                desired = count,
                "scaling deployment"
            );
            ctx.client
                .update(&foo_ns, &desired_update(&existing, &foo))
                .await?;
            return Ok(());
        }
    }

    debug!(deployment = %dep_name, "deployment up to date");
    Ok(())
}
