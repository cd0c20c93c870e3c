//! Custom Resource Definitions used by the import-config controller
//!
//! Only the ManagedCluster kind is defined here. The owned kinds (ClusterRole,
//! ClusterRoleBinding, ServiceAccount, Secret) come from `k8s-openapi`.

mod managed_cluster;
mod types;

pub use managed_cluster::{
    ClientConfig, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus,
    ManagedClusterVersion, MANAGED_CLUSTER_GROUP, MANAGED_CLUSTER_KIND,
};
pub use types::{Condition, ConditionStatus};
