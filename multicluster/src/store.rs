//! Access to declarations in the control-plane cluster
use crate::crd::MultiClusterResource;
use async_trait::async_trait;
use kube::{
    api::{Api, PostParams},
    core::ErrorResponse,
    runtime::reflector::ObjectRef,
    Client, ResourceExt,
};
use thiserror::Error;

/// Failures talking to the declaration store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object changed since it was read, re-fetch before trying again
    #[error("declaration {0} was modified concurrently")]
    Conflict(String),
    /// Any other API failure
    #[error("declaration store request failed: {0}")]
    Api(#[source] kube::Error),
}

/// Where declarations are read from and their ledger written back to
#[async_trait]
pub trait DeclarationStore: Send + Sync {
    /// Fetch a declaration, `None` if it no longer exists
    async fn get(
        &self,
        key: &ObjectRef<MultiClusterResource>,
    ) -> Result<Option<MultiClusterResource>, StoreError>;

    /// Write `obj` back, failing with [`StoreError::Conflict`] if its `resourceVersion` is stale
    async fn replace(&self, obj: &MultiClusterResource) -> Result<MultiClusterResource, StoreError>;
}

/// [`DeclarationStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Read and write declarations through `client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<MultiClusterResource> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl DeclarationStore for KubeStore {
    async fn get(
        &self,
        key: &ObjectRef<MultiClusterResource>,
    ) -> Result<Option<MultiClusterResource>, StoreError> {
        self.api(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(StoreError::Api)
    }

    async fn replace(&self, obj: &MultiClusterResource) -> Result<MultiClusterResource, StoreError> {
        let name = obj.name_any();
        self.api(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|err| match err {
                kube::Error::Api(ErrorResponse { code: 409, .. }) => StoreError::Conflict(name),
                err => StoreError::Api(err),
            })
    }
}
