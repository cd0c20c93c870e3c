//! Entity keys
//!
//! An [`EntityKey`] names the top-level object a unit of work is about. Keys
//! for cluster-scoped kinds carry no namespace.

use std::fmt;

use kube::{Resource, ResourceExt};

/// Identity of a top-level entity to reconcile
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Namespace, absent for cluster-scoped entities
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl EntityKey {
    /// Key for a cluster-scoped entity
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for a namespaced entity
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an object from its metadata
    ///
    /// Returns `None` when the object has no name (neither `name` nor a
    /// server-assigned one yet), which only happens for malformed events.
    pub fn for_object<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        Some(Self {
            namespace: obj.namespace(),
            name,
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceAccount;
    use kube::core::ObjectMeta;

    #[test]
    fn display_matches_namespaced_name_convention() {
        assert_eq!(EntityKey::cluster_scoped("east-1").to_string(), "east-1");
        assert_eq!(
            EntityKey::namespaced("east-1", "east-1-bootstrap-sa").to_string(),
            "east-1/east-1-bootstrap-sa"
        );
    }

    #[test]
    fn for_object_uses_namespace_when_present() {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some("east-1-bootstrap-sa".to_string()),
                namespace: Some("east-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            EntityKey::for_object(&sa),
            Some(EntityKey::namespaced("east-1", "east-1-bootstrap-sa"))
        );
    }

    #[test]
    fn for_object_without_name_is_none() {
        let sa = ServiceAccount::default();
        assert_eq!(EntityKey::for_object(&sa), None);
    }

    #[test]
    fn scoped_and_unscoped_keys_differ() {
        assert_ne!(
            EntityKey::cluster_scoped("east-1"),
            EntityKey::namespaced("default", "east-1")
        );
    }
}
