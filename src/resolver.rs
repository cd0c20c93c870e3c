//! Owner resolution: mapping an accepted change event to the entity it affects
//!
//! Owned kinds are mapped through their controlling owner reference. Kinds
//! without reliable ownership metadata (the import secret lives in the
//! cluster's namespace and may be recreated out of band) are correlated by a
//! mapping function over the event itself.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::change::ChangeEvent;
use crate::crd::{MANAGED_CLUSTER_GROUP, MANAGED_CLUSTER_KIND};
use crate::key::EntityKey;

/// Suffix of the per-cluster import secret name
pub const IMPORT_SECRET_SUFFIX: &str = "-import";

/// Maps an accepted event to the entity key to reconcile
pub trait OwnerResolver<K>: Send + Sync {
    /// Returns `None` when the event does not belong to any entity
    fn resolve(&self, event: &ChangeEvent<K>) -> Option<EntityKey>;
}

impl<K, F> OwnerResolver<K> for F
where
    F: Fn(&ChangeEvent<K>) -> Option<EntityKey> + Send + Sync,
{
    fn resolve(&self, event: &ChangeEvent<K>) -> Option<EntityKey> {
        self(event)
    }
}

/// Read access to owner metadata that is not embedded in an event
///
/// Watch-backed sources do not need one: their events carry full objects and
/// the previous state holds the last-known owner references. Streams that
/// deliver partial objects inject a lookup through
/// [`ControllerOwner::with_lookup`].
#[cfg_attr(test, automock)]
pub trait OwnerLookup: Send + Sync {
    /// Owner references last seen on the object with the given key
    fn owner_references(&self, key: &EntityKey) -> Option<Vec<OwnerReference>>;
}

/// Resolver for the primary source: the object is the entity
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjectIdentity;

impl<K: Resource> OwnerResolver<K> for ObjectIdentity {
    fn resolve(&self, event: &ChangeEvent<K>) -> Option<EntityKey> {
        EntityKey::for_object(event.current.as_ref())
    }
}

/// Resolver following the controlling owner reference of an owned object
pub struct ControllerOwner {
    group: String,
    kind: String,
    namespaced: bool,
    lookup: Option<Arc<dyn OwnerLookup>>,
}

impl ControllerOwner {
    /// Resolve to an owner of the given API group and kind
    ///
    /// `namespaced` tells whether the owner kind lives in a namespace; if so
    /// the owner shares the owned object's namespace.
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespaced: bool) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespaced,
            lookup: None,
        }
    }

    /// Resolver for objects controlled by a ManagedCluster
    pub fn managed_cluster() -> Self {
        Self::new(MANAGED_CLUSTER_GROUP, MANAGED_CLUSTER_KIND, false)
    }

    /// Consult `lookup` when an event object carries no owner references
    pub fn with_lookup(mut self, lookup: Arc<dyn OwnerLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Pick the controlling reference of the expected kind, if any
    pub fn controlling_owner<'a>(&self, refs: &'a [OwnerReference]) -> Option<&'a OwnerReference> {
        refs.iter().find(|r| {
            r.controller == Some(true) && r.kind == self.kind && api_group(&r.api_version) == self.group
        })
    }

    fn key_for(&self, owner: &OwnerReference, owned_namespace: Option<String>) -> Option<EntityKey> {
        if self.namespaced {
            owned_namespace.map(|ns| EntityKey::namespaced(ns, owner.name.clone()))
        } else {
            Some(EntityKey::cluster_scoped(owner.name.clone()))
        }
    }
}

impl<K: Resource> OwnerResolver<K> for ControllerOwner {
    fn resolve(&self, event: &ChangeEvent<K>) -> Option<EntityKey> {
        let obj = event.current.as_ref();
        let mut embedded = obj.owner_references();
        if embedded.is_empty() {
            if let Some(previous) = event.previous.as_deref() {
                embedded = previous.owner_references();
            }
        }

        let fetched;
        let refs = if embedded.is_empty() {
            let lookup = self.lookup.as_ref()?;
            let key = EntityKey::for_object(obj)?;
            fetched = lookup.owner_references(&key)?;
            fetched.as_slice()
        } else {
            embedded
        };

        let owner = self.controlling_owner(refs);
        if owner.is_none() {
            debug!(
                source = %event.source,
                object = %obj.name_any(),
                expected_kind = %self.kind,
                "No controlling owner of expected kind"
            );
        }
        owner.and_then(|o| self.key_for(o, obj.namespace()))
    }
}

/// Correlates import secrets with their cluster by naming convention
///
/// The import secret of cluster `c` is `c/c-import`. Only metadata is read,
/// so the mapper works on full `Secret`s and on metadata-only watches alike.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportSecretMapper;

impl<K: Resource> OwnerResolver<K> for ImportSecretMapper {
    fn resolve(&self, event: &ChangeEvent<K>) -> Option<EntityKey> {
        import_secret_cluster(event.current.as_ref())
    }
}

/// Cluster key for an import secret, `None` for any other secret
pub fn import_secret_cluster<K: Resource>(secret: &K) -> Option<EntityKey> {
    let namespace = secret.meta().namespace.as_deref()?;
    let name = secret.meta().name.as_deref()?;
    let cluster = name.strip_suffix(IMPORT_SECRET_SUFFIX)?;
    (cluster == namespace && !cluster.is_empty()).then(|| EntityKey::cluster_scoped(cluster))
}

/// API group of an `apiVersion` string ("" for the core group)
fn api_group(api_version: &str) -> &str {
    api_version
        .split_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}
