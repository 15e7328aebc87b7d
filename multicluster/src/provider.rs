//! Resolving cluster identifiers into handles that can materialize objects
use crate::{
    config::{ClusterConfig, ConfigError},
    crd::{ClusterId, Payload},
};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams},
    core::{ErrorResponse, GroupVersionKind},
    discovery::{self, ApiCapabilities, ApiResource, Scope},
    Client,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Failures against a single cluster
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No configuration exists for the cluster
    #[error("cluster {0} is not configured")]
    Unknown(ClusterId),

    /// The cluster's client configuration could not be loaded
    #[error("failed to load client configuration for cluster {cluster}: {source}")]
    Kubeconfig {
        /// Offending cluster
        cluster: ClusterId,
        /// Underlying configuration error
        #[source]
        source: ConfigError,
    },

    /// A client could not be built from an otherwise valid configuration
    #[error("failed to connect to cluster {cluster}: {source}")]
    Connect {
        /// Offending cluster
        cluster: ClusterId,
        /// Underlying client error
        #[source]
        source: kube::Error,
    },

    /// The cluster does not serve the payload's kind
    #[error("cluster {cluster} cannot map {kind}: {source}")]
    Discovery {
        /// Offending cluster
        cluster: ClusterId,
        /// Kind that was looked up
        kind: String,
        /// Underlying discovery error
        #[source]
        source: kube::Error,
    },

    /// The apply or delete call failed
    #[error("request to cluster {cluster} failed: {source}")]
    Api {
        /// Offending cluster
        cluster: ClusterId,
        /// Underlying API error
        #[source]
        source: kube::Error,
    },

    /// The pass was cancelled before the call completed
    #[error("operation on cluster {0} was cancelled")]
    Cancelled(ClusterId),
}

impl ClusterError {
    /// Misconfiguration that will not heal by itself
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unknown(_) | Self::Kubeconfig { .. })
    }
}

/// A cluster that objects can be materialized in
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// Create or update the payload, safe to repeat
    async fn apply(&self, payload: &Payload) -> Result<(), ClusterError>;

    /// Delete the payload, succeeding when it is already gone
    async fn delete(&self, payload: &Payload) -> Result<(), ClusterError>;
}

/// Hands out [`RemoteCluster`]s by identifier
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Resolve a cluster, failing when it is unknown or unreachable
    async fn resolve(&self, cluster: &ClusterId) -> Result<Arc<dyn RemoteCluster>, ClusterError>;
}

/// [`ClusterProvider`] building clients from per-cluster kubeconfig settings
///
/// Clients are built on first use and reused by later passes.
pub struct KubeconfigProvider {
    clusters: BTreeMap<ClusterId, ClusterConfig>,
    field_manager: String,
    connected: Mutex<HashMap<ClusterId, Arc<KubeCluster>>>,
}

impl KubeconfigProvider {
    /// Serve the given clusters, applying as `field_manager`
    #[must_use]
    pub fn new(clusters: BTreeMap<ClusterId, ClusterConfig>, field_manager: impl Into<String>) -> Self {
        Self {
            clusters,
            field_manager: field_manager.into(),
            connected: Mutex::default(),
        }
    }
}

#[async_trait]
impl ClusterProvider for KubeconfigProvider {
    async fn resolve(&self, cluster: &ClusterId) -> Result<Arc<dyn RemoteCluster>, ClusterError> {
        if let Some(connected) = self.connected.lock().get(cluster) {
            return Ok(connected.clone());
        }
        let settings = self
            .clusters
            .get(cluster)
            .ok_or_else(|| ClusterError::Unknown(cluster.clone()))?;
        let config = settings
            .client_config()
            .await
            .map_err(|source| ClusterError::Kubeconfig {
                cluster: cluster.clone(),
                source,
            })?;
        let client = Client::try_from(config).map_err(|source| ClusterError::Connect {
            cluster: cluster.clone(),
            source,
        })?;
        debug!(%cluster, "connected");
        // Racing resolvers may both connect, the first one to get here wins
        let connected = self
            .connected
            .lock()
            .entry(cluster.clone())
            .or_insert_with(|| Arc::new(KubeCluster::new(cluster.clone(), client, &self.field_manager)))
            .clone();
        Ok(connected)
    }
}

/// [`RemoteCluster`] speaking to a Kubernetes API server
pub struct KubeCluster {
    id: ClusterId,
    client: Client,
    apply_params: PatchParams,
    kinds: Mutex<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    /// Wrap a client for cluster `id`
    #[must_use]
    pub fn new(id: ClusterId, client: Client, field_manager: &str) -> Self {
        Self {
            id,
            client,
            apply_params: PatchParams::apply(field_manager).force(),
            kinds: Mutex::default(),
        }
    }

    /// REST mapping for `gvk`, discovered once per kind
    async fn resolve_kind(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, ApiCapabilities), kube::Error> {
        if let Some(found) = self.kinds.lock().get(gvk) {
            return Ok(found.clone());
        }
        let found = discovery::pinned_kind(&self.client, gvk).await?;
        self.kinds.lock().insert(gvk.clone(), found.clone());
        Ok(found)
    }

    /// Api handle and the object as it should be addressed in this cluster
    async fn api_for(&self, payload: &Payload) -> Result<(Api<DynamicObject>, DynamicObject), ClusterError> {
        let gvk = payload.gvk();
        let (resource, caps) = self
            .resolve_kind(gvk)
            .await
            .map_err(|source| ClusterError::Discovery {
                cluster: self.id.clone(),
                kind: gvk.kind.clone(),
                source,
            })?;
        Ok(match caps.scope {
            Scope::Namespaced => {
                let namespace = payload.namespace().unwrap_or_else(|| "default".into());
                let object = payload.object_in(Some(&namespace));
                (
                    Api::namespaced_with(self.client.clone(), &namespace, &resource),
                    object,
                )
            }
            Scope::Cluster => (Api::all_with(self.client.clone(), &resource), payload.object_in(None)),
        })
    }

    fn api_error(&self, source: kube::Error) -> ClusterError {
        ClusterError::Api {
            cluster: self.id.clone(),
            source,
        }
    }
}

#[async_trait]
impl RemoteCluster for KubeCluster {
    #[instrument(skip_all, fields(cluster = %self.id, name = %payload.name()))]
    async fn apply(&self, payload: &Payload) -> Result<(), ClusterError> {
        let (api, object) = self.api_for(payload).await?;
        api.patch(&payload.name(), &self.apply_params, &Patch::Apply(&object))
            .await
            .map_err(|err| self.api_error(err))?;
        debug!("applied");
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %self.id, name = %payload.name()))]
    async fn delete(&self, payload: &Payload) -> Result<(), ClusterError> {
        let (api, _) = match self.api_for(payload).await {
            Ok(found) => found,
            // A kind the cluster does not serve cannot have instances left
            Err(ClusterError::Discovery { source, .. }) if kind_not_served(&source) => {
                debug!("kind not served");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        match api.delete(&payload.name(), &DeleteParams::background()).await {
            Ok(_) => debug!("deleted"),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => debug!("already deleted"),
            Err(err) => return Err(self.api_error(err)),
        }
        Ok(())
    }
}

fn kind_not_served(err: &kube::Error) -> bool {
    matches!(
        err,
        kube::Error::Discovery(_) | kube::Error::Api(ErrorResponse { code: 404, .. })
    )
}
