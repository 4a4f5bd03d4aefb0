//! Foo Custom Resource Definition
//!
//! A Foo declares how many replicas of a message-echoing workload should run.
//! The controller keeps a Deployment of the same name in sync with it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Foo
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sample.dev",
    version = "v1alpha1",
    kind = "Foo",
    plural = "foos",
    namespaced,
    printcolumn = r#"{"name":"Count","type":"integer","jsonPath":".spec.count"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FooSpec {
    /// Desired replica count; unset leaves the Deployment's count unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    /// Message echoed by the workload container on startup
    #[serde(default)]
    pub message: String,
}

impl FooSpec {
    /// Create a spec with a desired count and message
    pub fn new(count: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            count,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    /// Story: a Foo without a count deserializes with the count left unset
    #[test]
    fn story_count_is_optional() {
        let spec: FooSpec = serde_json::from_value(serde_json::json!({
            "message": "hello"
        }))
        .expect("spec should parse");

        assert_eq!(spec.count, None);
        assert_eq!(spec.message, "hello");

        let value = serde_json::to_value(&spec).expect("spec should serialize");
        assert!(value.get("count").is_none(), "unset count is not serialized");
    }

    #[test]
    fn story_count_round_trips_in_camel_case_manifest() {
        let spec: FooSpec = serde_yaml::from_str("count: 3\nmessage: hi\n").expect("yaml parses");
        assert_eq!(spec, FooSpec::new(Some(3), "hi"));
    }

    /// Story: the generated CRD is namespaced under sample.dev/v1alpha1
    #[test]
    fn story_crd_identity() {
        let crd = Foo::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("foos.sample.dev"));
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(Foo::kind(&()), "Foo");
        assert_eq!(Foo::api_version(&()), "sample.dev/v1alpha1");
    }
}
