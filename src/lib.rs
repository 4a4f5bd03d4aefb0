//! crds-controller - keeps a Deployment in step with each Foo custom resource
//!
//! Every `Foo` (`sample.dev/v1alpha1`) declares a replica count and a message.
//! The controller makes sure a Deployment of the same name exists in the same
//! namespace, is controlled by that Foo, and runs the declared number of
//! replicas.
//!
//! # Architecture
//!
//! - Two informers mirror Foos and Deployments into local caches and report
//!   changes to the [`controller::Engine`]
//! - The engine turns changes into Foo keys on a deduplicating, rate-limited
//!   [`queue::WorkQueue`]
//! - Workers pop keys and run [`controller::reconcile`], which compares the
//!   cached state and issues at most one create or update
//!
//! # Modules
//!
//! - [`crd`] - The Foo custom resource
//! - [`controller`] - Event handlers, reconcile logic and worker loop
//! - [`queue`] - Work queue and rate limiters
//! - [`informer`] - Local caches and change notifications
//! - [`workload`] - Desired Deployment synthesis and ownership checks
//! - [`scheme`] - Registry of known kinds
//! - [`config`] - Runtime settings
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod informer;
pub mod queue;
pub mod scheme;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "crds-controller";
