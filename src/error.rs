//! Error types for the controller
//!
//! Errors are classified by how the worker loop reacts to them:
//! transient errors are requeued with backoff, ownership conflicts are
//! reported and dropped, and invariant violations stop the process.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Local cache lookup failed
    #[error("cache error for {kind}: {message}")]
    Cache {
        /// Kind of object being looked up
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Malformed input that no retry can fix
    #[error("validation error for {key}: {message}")]
    Validation {
        /// Queue key or object name the error refers to
        key: String,
        /// Description of what's invalid
        message: String,
    },

    /// The managed object exists but is controlled by someone else
    #[error("resource {namespace}/{name} exists but is not controlled by Foo {owner}")]
    OwnershipConflict {
        /// Namespace of the conflicting Deployment
        namespace: String,
        /// Name of the conflicting Deployment
        name: String,
        /// Name of the Foo that expected to own it
        owner: String,
    },

    /// Cache or data-model corruption; the caller must shut down
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant
        message: String,
    },
}

impl Error {
    /// Create a cache error for the given kind
    pub fn cache(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error for the given key
    pub fn validation(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership conflict error
    pub fn ownership_conflict(
        namespace: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            namespace: namespace.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: msg.into(),
        }
    }

    /// Check if this error should requeue the key with backoff
    ///
    /// Every remote or cache failure is retried, including 4xx responses:
    /// a 409 from a concurrent writer or a 404 from a racing delete both
    /// resolve on a later pass against fresh cache state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } | Error::Cache { .. } => true,
            Error::Validation { .. }
            | Error::OwnershipConflict { .. }
            | Error::InvariantViolation { .. } => false,
        }
    }

    /// Check if this error must stop the controller
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: transient failures are the only ones worth retrying
    #[test]
    fn story_only_transient_errors_are_retryable() {
        assert!(Error::cache("Foo", "store unavailable").is_retryable());
        assert!(!Error::validation("a/b/c", "unexpected key format").is_retryable());
        assert!(!Error::ownership_conflict("ns", "foo", "foo").is_retryable());
        assert!(!Error::invariant("owner kind mismatch").is_retryable());
    }

    #[test]
    fn story_api_errors_are_retryable_even_for_conflicts() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("kubernetes error"));
    }

    #[test]
    fn story_invariant_violations_are_fatal() {
        let err = Error::invariant("owner reference kind Bar, expected Foo");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("expected Foo"));
    }

    #[test]
    fn story_ownership_conflict_names_both_sides() {
        let err = Error::ownership_conflict("prod", "web", "web");
        let msg = err.to_string();
        assert!(msg.contains("prod/web"));
        assert!(msg.contains("not controlled by Foo web"));
    }
}
