//! The import-config controller: registrations and a cluster-reading reconciler
//!
//! Five sources feed one queue of ManagedCluster keys:
//!
//! | Source             | Predicate                            | Resolver                     |
//! |--------------------|--------------------------------------|------------------------------|
//! | ManagedCluster     | create, label/annotation change      | the object itself            |
//! | ClusterRole        | update, delete                       | controlling ManagedCluster   |
//! | ClusterRoleBinding | update, delete                       | controlling ManagedCluster   |
//! | ServiceAccount     | update, delete                       | controlling ManagedCluster   |
//! | import Secret      | update, delete                       | `<cluster>/<cluster>-import` |
//!
//! Import secrets are watched metadata-only: routing needs nothing but the
//! name and namespace, and secret payloads never reach the local cache.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::core::PartialObjectMeta;
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::change::SourceKind;
use crate::config::ControllerConfig;
use crate::crd::ManagedCluster;
use crate::events::KubeEventPublisher;
use crate::key::EntityKey;
use crate::predicate::SourcePolicy;
use crate::reconciler::{Action, Reconciler};
use crate::resolver::{
    ControllerOwner, ImportSecretMapper, ObjectIdentity, OwnerResolver, IMPORT_SECRET_SUFFIX,
};
use crate::source::{change_stream, EventSource, ObjectCache, Source};
use crate::{Error, Result};

use super::Controller;

/// Watch parameters shared by every source
fn watcher_config(config: &ControllerConfig) -> watcher::Config {
    let secs = config.watch_timeout.as_secs().min(u64::from(u32::MAX)) as u32;
    watcher::Config::default().timeout(secs)
}

/// Source over a live watch of `api`, filtered by the policy of `kind`
fn watch_source<K, R>(
    kind: SourceKind,
    api: Api<K>,
    config: watcher::Config,
    cache: ObjectCache<K>,
    resolver: R,
) -> Source<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    R: OwnerResolver<K> + 'static,
{
    let raw = watcher(api, config).default_backoff();
    Source::new(
        kind,
        change_stream(kind, raw, cache),
        SourcePolicy::for_source(kind),
        resolver,
    )
}

/// Source of a kind owned by ManagedClusters through controller references
fn owned_source<K>(kind: SourceKind, client: &Client, config: watcher::Config) -> Source<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watch_source(
        kind,
        Api::all(client.clone()),
        config,
        ObjectCache::new(),
        ControllerOwner::managed_cluster(),
    )
}

/// Metadata-only source over import secrets
fn import_secret_source(
    client: &Client,
    config: watcher::Config,
) -> Source<PartialObjectMeta<Secret>> {
    let kind = SourceKind::ImportSecret;
    let raw = metadata_watcher(Api::<Secret>::all(client.clone()), config).default_backoff();
    Source::new(
        kind,
        change_stream(kind, raw, ObjectCache::new()),
        SourcePolicy::for_source(kind),
        ImportSecretMapper,
    )
}

/// Every source of the import-config controller, in registration order
pub fn sources(client: &Client, config: &ControllerConfig) -> Vec<Box<dyn EventSource>> {
    let wc = watcher_config(config);
    let mut secret_wc = wc.clone();
    if let Some(selector) = &config.import_secret_selector {
        secret_wc = secret_wc.labels(selector);
    }

    let mut sources: Vec<Box<dyn EventSource>> = Vec::with_capacity(5);
    sources.push(Box::new(watch_source::<ManagedCluster, _>(
        SourceKind::ManagedCluster,
        Api::all(client.clone()),
        wc.clone(),
        ObjectCache::new(),
        ObjectIdentity,
    )));
    sources.push(Box::new(owned_source::<ClusterRole>(
        SourceKind::ClusterRole,
        client,
        wc.clone(),
    )));
    sources.push(Box::new(owned_source::<ClusterRoleBinding>(
        SourceKind::ClusterRoleBinding,
        client,
        wc.clone(),
    )));
    sources.push(Box::new(owned_source::<ServiceAccount>(
        SourceKind::ServiceAccount,
        client,
        wc,
    )));
    sources.push(Box::new(import_secret_source(client, secret_wc)));
    sources
}

/// Build the import-config controller against a live cluster
pub fn controller(client: Client, config: &ControllerConfig) -> Result<Controller> {
    config.validate()?;
    let mut builder = Controller::builder(config.name.clone())
        .with_config(config)
        .reconciler(Arc::new(ObservingReconciler::new(Arc::new(
            KubeClusterReader::new(client.clone()),
        ))))
        .events(Arc::new(KubeEventPublisher::new(
            client.clone(),
            &config.name,
            config.pod_name.clone(),
        )));
    for source in sources(&client, config) {
        builder = builder.boxed_source(source);
    }
    builder.build()
}

/// Read access to the objects the reconciler looks at
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// The ManagedCluster named `name`, `None` if it does not exist
    async fn get_cluster(&self, name: &str) -> Result<Option<ManagedCluster>>;

    /// Whether the import secret of cluster `name` exists
    async fn import_secret_exists(&self, name: &str) -> Result<bool>;
}

/// [`ClusterReader`] backed by the API server
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    /// Create a reader using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_cluster(&self, name: &str) -> Result<Option<ManagedCluster>> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn import_secret_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), name);
        let secret = api
            .get_opt(&format!("{}{}", name, IMPORT_SECRET_SUFFIX))
            .await?;
        Ok(secret.is_some())
    }
}

/// Reconciler that reads and reports the state of each ManagedCluster
///
/// Rendering import manifests happens elsewhere; this reconciler exercises
/// the pipeline against a live cluster and surfaces what it sees.
pub struct ObservingReconciler {
    reader: Arc<dyn ClusterReader>,
}

impl ObservingReconciler {
    /// Create a reconciler reading through `reader`
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl Reconciler for ObservingReconciler {
    #[instrument(skip(self, key), fields(cluster = %key))]
    async fn reconcile(&self, key: &EntityKey) -> Result<Action> {
        if key.namespace.is_some() {
            return Err(Error::reconcile_terminal(
                key.to_string(),
                "ManagedCluster is cluster scoped, key must not carry a namespace",
            ));
        }

        let Some(cluster) = self.reader.get_cluster(&key.name).await? else {
            debug!("ManagedCluster not found, nothing to do");
            return Ok(Action::await_change());
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            debug!("ManagedCluster is being deleted");
            return Ok(Action::await_change());
        }
        if !cluster.spec.hub_accepts_client {
            debug!("Hub does not accept this cluster yet");
            return Ok(Action::await_change());
        }

        let has_import_secret = self.reader.import_secret_exists(&key.name).await?;
        info!(
            has_import_secret,
            labels = cluster.labels().len(),
            annotations = cluster.annotations().len(),
            "Observed ManagedCluster"
        );
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kube::core::ObjectMeta;

    use crate::crd::ManagedClusterSpec;

    fn cluster(accepted: bool) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("east-1".to_string()),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                hub_accepts_client: accepted,
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn accepted_cluster_checks_import_secret() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_cluster()
            .withf(|name| name == "east-1")
            .returning(|_| Ok(Some(cluster(true))));
        reader
            .expect_import_secret_exists()
            .times(1)
            .returning(|_| Ok(true));

        let reconciler = ObservingReconciler::new(Arc::new(reader));
        let action = reconciler
            .reconcile(&EntityKey::cluster_scoped("east-1"))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn missing_cluster_is_not_an_error() {
        let mut reader = MockClusterReader::new();
        reader.expect_get_cluster().returning(|_| Ok(None));
        reader.expect_import_secret_exists().never();

        let reconciler = ObservingReconciler::new(Arc::new(reader));
        let action = reconciler
            .reconcile(&EntityKey::cluster_scoped("gone"))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unaccepted_cluster_skips_secret_lookup() {
        let mut reader = MockClusterReader::new();
        reader.expect_get_cluster().returning(|_| Ok(Some(cluster(false))));
        reader.expect_import_secret_exists().never();

        let reconciler = ObservingReconciler::new(Arc::new(reader));
        assert!(reconciler
            .reconcile(&EntityKey::cluster_scoped("east-1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn read_failures_are_retryable() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_cluster()
            .returning(|_| Err(Error::internal_with_context("reader", "connection refused")));

        let reconciler = ObservingReconciler::new(Arc::new(reader));
        let err = reconciler
            .reconcile(&EntityKey::cluster_scoped("east-1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn namespaced_key_is_terminal() {
        let mut reader = MockClusterReader::new();
        reader.expect_get_cluster().never();

        let reconciler = ObservingReconciler::new(Arc::new(reader));
        let err = reconciler
            .reconcile(&EntityKey::namespaced("east-1", "east-1"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.key(), Some("east-1/east-1"));
    }

    #[test]
    fn watcher_config_uses_configured_timeout() {
        let config = ControllerConfig {
            watch_timeout: Duration::from_secs(25),
            ..Default::default()
        };
        assert_eq!(watcher_config(&config).timeout, Some(25));
    }
}
