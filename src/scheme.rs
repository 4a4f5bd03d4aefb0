//! Registry of object kinds known to the controller
//!
//! Built once at startup and shared read-only with the engine. It names the
//! kind that is allowed to own managed Deployments and supplies the
//! group/version used when stamping owner references.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use kube::{Resource, ResourceExt};

/// Kinds registered with the controller, plus the designated owner kind
#[derive(Clone, Debug)]
pub struct Scheme {
    kinds: BTreeMap<String, GroupVersionKind>,
    owner_kind: String,
}

impl Scheme {
    /// Create a scheme whose owner kind is `K`
    ///
    /// `K` is registered as a side effect.
    pub fn with_owner<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            kinds: BTreeMap::new(),
            owner_kind: K::kind(&()).into_owned(),
        }
        .register::<K>()
    }

    /// Register another kind
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        self.kinds.insert(gvk.kind.clone(), gvk);
        self
    }

    /// Kind allowed to control managed objects
    pub fn owner_kind(&self) -> &str {
        &self.owner_kind
    }

    /// Look up a registered kind
    pub fn gvk(&self, kind: &str) -> Option<&GroupVersionKind> {
        self.kinds.get(kind)
    }

    /// Build a controller owner reference pointing at `owner`
    ///
    /// Returns `None` if the owner's kind is not registered or the object
    /// has no UID yet (it was never persisted).
    pub fn controller_ref<K>(&self, owner: &K) -> Option<OwnerReference>
    where
        K: Resource<DynamicType = ()>,
    {
        let gvk = self.gvk(&K::kind(&()))?;
        Some(OwnerReference {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            name: owner.name_any(),
            uid: owner.uid()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}
