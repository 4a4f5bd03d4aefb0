//! Remote writes for managed Deployments

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Trait abstracting Deployment writes
///
/// This trait allows mocking the API server in tests while using the real
/// client in production. Reads always go through the local caches.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Create a Deployment and return the object the server stored
    async fn create(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Replace an existing Deployment
    ///
    /// The payload carries the `resourceVersion` it was derived from, so a
    /// concurrent write surfaces as a 409 conflict.
    async fn update(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeDeploymentClient {
    client: Client,
}

impl KubeDeploymentClient {
    /// Create a new KubeDeploymentClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl DeploymentClient for KubeDeploymentClient {
    async fn create(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment, Error> {
        let created = self.api(namespace).create(&post_params(), deployment).await?;
        debug!(
            deployment = %created.name_any(),
            namespace,
            resource_version = ?created.resource_version(),
            "created deployment"
        );
        Ok(created)
    }

    async fn update(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment, Error> {
        let name = deployment.name_any();
        let updated = self
            .api(namespace)
            .replace(&name, &post_params(), deployment)
            .await?;
        debug!(
            deployment = %name,
            namespace,
            resource_version = ?updated.resource_version(),
            "replaced deployment"
        );
        Ok(updated)
    }
}
