//! Integration tests for the Foo controller
//!
//! # Test Organization
//!
//! - `foo_lifecycle`: Stories about creating, scaling and repairing the
//!   Deployment behind a Foo
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind foo_lifecycle -- --ignored --nocapture
//! ```

mod foo_lifecycle;
mod helpers;
