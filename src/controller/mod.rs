//! Foo controller
//!
//! Keeps one Deployment per Foo at the Foo's declared replica count. Event
//! handlers feed Foo keys into a work queue; workers reconcile each key
//! against the local caches and write through a [`DeploymentClient`].

mod client;
mod engine;
mod foo;

pub use client::{DeploymentClient, KubeDeploymentClient};
pub use engine::Engine;
pub use foo::{
    default_scheme, key_for, reconcile, split_meta_namespace_key, Context, ContextBuilder,
};
