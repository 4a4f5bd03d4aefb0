//! End-to-end integration tests against a real cluster
//!
//! These tests require a Kubernetes cluster (kind works) reachable through the
//! default kubeconfig. They are ignored by default and can be run with:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```
//!
//! The Foo CRD is installed on demand and the controller runs in-process.

mod kind_tests;
