//! Per-source predicates deciding which change events are worth a reconcile
//!
//! The policies mirror what the controller's output actually depends on:
//! - ManagedCluster: creation, and label or annotation changes (image registry
//!   selection is label driven, node placement is annotation driven). Status
//!   and other spec churn is ignored. Deletion is handled by finalizers.
//! - Owned kinds and the import secret: drift and removal. Creation is the
//!   direct result of a reconcile that just finished and is ignored.

use std::collections::BTreeMap;

use kube::Resource;

use crate::change::{ChangeEvent, ChangeType, SourceKind};

/// Gate applied to every event of a source before owner resolution
pub trait EventPredicate<K>: Send + Sync {
    /// Returns true when the event should lead to an enqueue
    fn matches(&self, event: &ChangeEvent<K>) -> bool;
}

impl<K, F> EventPredicate<K> for F
where
    F: Fn(&ChangeEvent<K>) -> bool + Send + Sync,
{
    fn matches(&self, event: &ChangeEvent<K>) -> bool {
        self(event)
    }
}

/// Built-in filtering policies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourcePolicy {
    /// Create, or Update with a label/annotation diff
    MetadataChanged,
    /// Update and Delete only
    DriftOrRemoval,
}

impl SourcePolicy {
    /// Policy used for a given source
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::ManagedCluster => Self::MetadataChanged,
            SourceKind::ClusterRole
            | SourceKind::ClusterRoleBinding
            | SourceKind::ServiceAccount
            | SourceKind::ImportSecret => Self::DriftOrRemoval,
        }
    }

    /// Evaluate the policy on raw event parts
    pub fn evaluate<K: Resource>(
        &self,
        change: ChangeType,
        previous: Option<&K>,
        current: &K,
    ) -> bool {
        match (self, change) {
            (_, ChangeType::Generic) => false,
            (Self::MetadataChanged, ChangeType::Create) => true,
            (Self::MetadataChanged, ChangeType::Update) => match previous {
                Some(old) => metadata_changed(old, current),
                // Without a previous state nothing proves the update irrelevant
                None => true,
            },
            (Self::MetadataChanged, ChangeType::Delete) => false,
            (Self::DriftOrRemoval, ChangeType::Create) => false,
            (Self::DriftOrRemoval, ChangeType::Update | ChangeType::Delete) => true,
        }
    }
}

impl<K: Resource> EventPredicate<K> for SourcePolicy {
    fn matches(&self, event: &ChangeEvent<K>) -> bool {
        self.evaluate(event.change, event.previous.as_deref(), &event.current)
    }
}

/// Decide whether a change on `source` should enqueue work
pub fn should_enqueue<K: Resource>(
    source: SourceKind,
    change: ChangeType,
    previous: Option<&K>,
    current: &K,
) -> bool {
    SourcePolicy::for_source(source).evaluate(change, previous, current)
}

/// True when labels or annotations differ as sets
///
/// An absent map and an empty map are the same set.
pub fn metadata_changed<K: Resource>(old: &K, new: &K) -> bool {
    let (old, new) = (old.meta(), new.meta());
    !same_map(old.labels.as_ref(), new.labels.as_ref())
        || !same_map(old.annotations.as_ref(), new.annotations.as_ref())
}

fn same_map(a: Option<&BTreeMap<String, String>>, b: Option<&BTreeMap<String, String>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
    use kube::core::ObjectMeta;
    use rstest::rstest;

    use crate::crd::{
        Condition, ConditionStatus, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus,
        ManagedClusterVersion,
    };

    fn cluster(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ManagedCluster {
        let to_map = |pairs: &[(&str, &str)]| {
            (!pairs.is_empty()).then(|| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>()
            })
        };
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("east-1".to_string()),
                labels: to_map(labels),
                annotations: to_map(annotations),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                hub_accepts_client: true,
                ..Default::default()
            },
            status: None,
        }
    }

    fn binding() -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("open-cluster-management:managedcluster:east-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn primary_create_enqueues() {
        let ev = ChangeEvent::created(SourceKind::ManagedCluster, Arc::new(cluster(&[], &[])));
        assert!(SourcePolicy::MetadataChanged.matches(&ev));
    }

    #[test]
    fn primary_delete_and_generic_do_not_enqueue() {
        let mc = Arc::new(cluster(&[("cloud", "aws")], &[]));
        let policy = SourcePolicy::for_source(SourceKind::ManagedCluster);
        assert!(!policy.matches(&ChangeEvent::deleted(SourceKind::ManagedCluster, mc.clone())));
        assert!(!policy.matches(&ChangeEvent::generic(SourceKind::ManagedCluster, mc)));
    }

    #[rstest]
    #[case::same_labels(&[("cloud", "aws"), ("vendor", "EKS")], &[("vendor", "EKS"), ("cloud", "aws")], false)]
    #[case::label_added(&[("cloud", "aws")], &[("cloud", "aws"), ("env", "prod")], true)]
    #[case::label_value_changed(&[("cloud", "aws")], &[("cloud", "gcp")], true)]
    #[case::label_removed(&[("cloud", "aws")], &[], true)]
    #[case::both_empty(&[], &[], false)]
    fn primary_update_follows_label_diff(
        #[case] old: &[(&str, &str)],
        #[case] new: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let ev = ChangeEvent::updated(
            SourceKind::ManagedCluster,
            Some(Arc::new(cluster(old, &[]))),
            Arc::new(cluster(new, &[])),
        );
        assert_eq!(SourcePolicy::MetadataChanged.matches(&ev), expected);
    }

    #[test]
    fn primary_update_on_annotation_change_enqueues() {
        let old = cluster(&[], &[("open-cluster-management/nodeSelector", "{}")]);
        let new = cluster(
            &[],
            &[("open-cluster-management/nodeSelector", r#"{"infra":"true"}"#)],
        );
        assert!(should_enqueue(
            SourceKind::ManagedCluster,
            ChangeType::Update,
            Some(&old),
            &new
        ));
    }

    #[test]
    fn primary_status_only_update_does_not_enqueue() {
        let old = cluster(&[("cloud", "aws")], &[("a", "b")]);
        let mut new = old.clone();
        new.status = Some(ManagedClusterStatus {
            conditions: vec![Condition::new(
                "ManagedClusterConditionAvailable",
                ConditionStatus::True,
                "ManagedClusterAvailable",
                "lease renewed",
            )],
            version: ManagedClusterVersion {
                kubernetes: Some("v1.30.2".to_string()),
            },
        });
        new.metadata.resource_version = Some("1002".to_string());
        new.spec.lease_duration_seconds = Some(60);
        assert!(!should_enqueue(
            SourceKind::ManagedCluster,
            ChangeType::Update,
            Some(&old),
            &new
        ));
    }

    #[test]
    fn absent_and_empty_maps_are_equal() {
        let old = cluster(&[], &[]);
        let mut new = old.clone();
        new.metadata.labels = Some(BTreeMap::new());
        new.metadata.annotations = Some(BTreeMap::new());
        assert!(!metadata_changed(&old, &new));
    }

    #[test]
    fn primary_update_without_previous_state_enqueues() {
        let ev = ChangeEvent::updated(SourceKind::ManagedCluster, None, Arc::new(cluster(&[], &[])));
        assert!(SourcePolicy::MetadataChanged.matches(&ev));
    }

    #[rstest]
    #[case::cluster_role(SourceKind::ClusterRole)]
    #[case::cluster_role_binding(SourceKind::ClusterRoleBinding)]
    #[case::service_account(SourceKind::ServiceAccount)]
    #[case::import_secret(SourceKind::ImportSecret)]
    fn owned_sources_ignore_create_and_generic(#[case] kind: SourceKind) {
        let obj = binding();
        assert!(!should_enqueue(kind, ChangeType::Create, None, &obj));
        assert!(!should_enqueue(kind, ChangeType::Generic, None, &obj));
        assert!(should_enqueue(kind, ChangeType::Update, Some(&obj), &obj));
        assert!(should_enqueue(kind, ChangeType::Delete, Some(&obj), &obj));
    }

    #[test]
    fn owned_update_enqueues_even_without_diff() {
        let ev = ChangeEvent::updated(
            SourceKind::ClusterRoleBinding,
            Some(Arc::new(binding())),
            Arc::new(binding()),
        );
        assert!(SourcePolicy::DriftOrRemoval.matches(&ev));
    }

    #[test]
    fn closures_are_predicates() {
        let only_deletes = |ev: &ChangeEvent<ClusterRoleBinding>| ev.change == ChangeType::Delete;
        let obj = Arc::new(binding());
        assert!(only_deletes.matches(&ChangeEvent::deleted(SourceKind::ClusterRoleBinding, obj.clone())));
        assert!(!only_deletes.matches(&ChangeEvent::created(SourceKind::ClusterRoleBinding, obj)));
    }
}
