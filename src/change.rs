//! Change events flowing from watch streams into the pipeline
//!
//! A [`ChangeEvent`] is consumed once by a source's predicate and resolver and
//! never stored.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Resource streams the controller listens to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The reconciled entity itself
    ManagedCluster,
    /// Owned `rbac.authorization.k8s.io/v1` ClusterRole
    ClusterRole,
    /// Owned `rbac.authorization.k8s.io/v1` ClusterRoleBinding
    ClusterRoleBinding,
    /// Owned `v1` ServiceAccount
    ServiceAccount,
    /// Import secrets, correlated by naming convention instead of ownership
    ImportSecret,
}

impl SourceKind {
    /// Stable name used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManagedCluster => "ManagedCluster",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::ServiceAccount => "ServiceAccount",
            Self::ImportSecret => "ImportSecret",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    /// First observation of the object
    Create,
    /// The object changed; `previous` holds the last observed state if known
    Update,
    /// The object is gone; `current` holds its final observed state
    Delete,
    /// Synthetic notification not tied to an API change
    Generic,
}

/// A single observed change to an object of kind `K`
#[derive(Clone, Debug)]
pub struct ChangeEvent<K> {
    /// Stream the event arrived on
    pub source: SourceKind,
    /// Kind of change
    pub change: ChangeType,
    /// State before the change, for updates and deletes
    pub previous: Option<Arc<K>>,
    /// State after the change (final state for deletes)
    pub current: Arc<K>,
    /// When the change was observed locally
    pub observed_at: DateTime<Utc>,
}

impl<K> ChangeEvent<K> {
    fn new(
        source: SourceKind,
        change: ChangeType,
        previous: Option<Arc<K>>,
        current: Arc<K>,
    ) -> Self {
        Self {
            source,
            change,
            previous,
            current,
            observed_at: Utc::now(),
        }
    }

    /// Create event
    pub fn created(source: SourceKind, obj: Arc<K>) -> Self {
        Self::new(source, ChangeType::Create, None, obj)
    }

    /// Update event with an optional previous state
    pub fn updated(source: SourceKind, previous: Option<Arc<K>>, current: Arc<K>) -> Self {
        Self::new(source, ChangeType::Update, previous, current)
    }

    /// Delete event; `last` is the final known state of the object
    pub fn deleted(source: SourceKind, last: Arc<K>) -> Self {
        Self::new(source, ChangeType::Delete, Some(last.clone()), last)
    }

    /// Generic event
    pub fn generic(source: SourceKind, obj: Arc<K>) -> Self {
        Self::new(source, ChangeType::Generic, None, obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceAccount;

    #[test]
    fn source_kind_names_are_stable() {
        assert_eq!(SourceKind::ManagedCluster.to_string(), "ManagedCluster");
        assert_eq!(SourceKind::ImportSecret.as_str(), "ImportSecret");
    }

    #[test]
    fn constructors_set_change_type_and_previous() {
        let sa = Arc::new(ServiceAccount::default());

        let ev = ChangeEvent::created(SourceKind::ServiceAccount, sa.clone());
        assert_eq!(ev.change, ChangeType::Create);
        assert!(ev.previous.is_none());

        let ev = ChangeEvent::updated(SourceKind::ServiceAccount, Some(sa.clone()), sa.clone());
        assert_eq!(ev.change, ChangeType::Update);
        assert!(ev.previous.is_some());

        let ev = ChangeEvent::deleted(SourceKind::ServiceAccount, sa);
        assert_eq!(ev.change, ChangeType::Delete);
        assert!(Arc::ptr_eq(ev.previous.as_ref().unwrap(), &ev.current));
    }
}
