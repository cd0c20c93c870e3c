//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is the hub-side membership record of a cluster joined to
//! the hub. It is the top-level entity the import-config controller
//! reconciles; every other watched kind is routed back to one of these.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// API group of the ManagedCluster kind
pub const MANAGED_CLUSTER_GROUP: &str = "cluster.open-cluster-management.io";

/// Kind name used in owner references
pub const MANAGED_CLUSTER_KIND: &str = "ManagedCluster";

/// Specification for a ManagedCluster
///
/// Example:
/// ```yaml
/// apiVersion: cluster.open-cluster-management.io/v1
/// kind: ManagedCluster
/// metadata:
///   name: east-1
///   labels:
///     cloud: aws
/// spec:
///   hubAcceptsClient: true
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mcl",
    status = "ManagedClusterStatus",
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".spec.hubAcceptsClient"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Whether the hub accepts the klusterlet of this cluster
    #[serde(default)]
    pub hub_accepts_client: bool,

    /// Endpoints the hub uses to reach the managed cluster's API server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_cluster_client_configs: Vec<ClientConfig>,

    /// Lease duration reported by the klusterlet agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

/// API server endpoint of a managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// API server URL
    pub url: String,

    /// Base64 encoded CA bundle for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Status of a ManagedCluster
///
/// Written by other controllers. Changes here never trigger the import-config
/// controller on their own.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Version information reported by the klusterlet
    #[serde(default)]
    pub version: ManagedClusterVersion,
}

/// Version information of a managed cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManagedClusterVersion {
    /// Kubernetes version, e.g. `v1.30.2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<String>,
}
