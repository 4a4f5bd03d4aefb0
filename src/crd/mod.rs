//! Custom Resource Definitions owned by the controller

mod foo;

pub use foo::{Foo, FooSpec};
