//! The `MultiClusterResource` custom resource and the payload it materializes
use kube::{
    api::{DynamicObject, ObjectMeta},
    core::{gvk::ParseGroupVersionError, GroupVersionKind},
    CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// API group of the declaration and prefix for everything it stamps on remote objects
pub const API_GROUP: &str = "multicluster.practice.com";

/// Label set on every materialized copy
pub const MANAGED_BY_LABEL: &str = "multicluster.practice.com/managed-by";

/// Annotation pointing a materialized copy back at its declaration
pub const SOURCE_ANNOTATION: &str = "multicluster.practice.com/source";

/// Identifier of a target cluster, as used in `spec.clusters` and the provider configuration
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Wrap a cluster name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw cluster name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ClusterId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Desired state of a declaration: one object, many clusters
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "multicluster.practice.com",
    version = "v1alpha1",
    kind = "MultiClusterResource",
    namespaced,
    shortname = "mcr",
    printcolumn = r#"{"name":"Clusters", "type":"string", "jsonPath":".spec.clusters"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterResourceSpec {
    /// The Kubernetes object to materialize in every target cluster
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: serde_json::Value,

    /// Ordered list of clusters that should hold a copy of `template`
    #[serde(default)]
    pub clusters: Vec<ClusterId>,
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

impl MultiClusterResource {
    /// Target clusters in declaration order, with repeats dropped
    pub fn desired_clusters(&self) -> Vec<ClusterId> {
        let mut clusters: Vec<ClusterId> = Vec::with_capacity(self.spec.clusters.len());
        for cluster in &self.spec.clusters {
            if !clusters.contains(cluster) {
                clusters.push(cluster.clone());
            }
        }
        clusters
    }

    /// Parse `spec.template` into the object materialized remotely
    ///
    /// The name defaults to the declaration's name, and the declaration's namespace is used
    /// for namespaced kinds whose template leaves it out.
    pub fn payload(&self) -> Result<Payload, TemplateError> {
        let mut object: DynamicObject =
            serde_json::from_value(self.spec.template.clone()).map_err(TemplateError::Malformed)?;
        let types = object.types.as_ref().ok_or(TemplateError::MissingTypeMeta)?;
        let gvk = GroupVersionKind::try_from(types).map_err(TemplateError::GroupVersion)?;
        if gvk.kind.is_empty() {
            return Err(TemplateError::MissingTypeMeta);
        }
        // kube splits on the first slash only
        if gvk.version.is_empty() || gvk.version.contains('/') {
            return Err(TemplateError::GroupVersion(ParseGroupVersionError(types.api_version.clone())));
        }

        if object.metadata.name.is_none() {
            object.metadata.name = Some(self.name_any());
        }
        let source = format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any());
        object
            .labels_mut()
            .insert(MANAGED_BY_LABEL.into(), "multicluster-controller".into());
        object.annotations_mut().insert(SOURCE_ANNOTATION.into(), source);

        Ok(Payload {
            gvk,
            default_namespace: self.namespace(),
            object,
        })
    }
}

/// Reasons a template cannot be materialized
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template is not a Kubernetes object
    #[error("template is not a valid object: {0}")]
    Malformed(#[source] serde_json::Error),
    /// `apiVersion` or `kind` is missing
    #[error("template has no apiVersion/kind")]
    MissingTypeMeta,
    /// `apiVersion` does not parse
    #[error("template has an invalid apiVersion: {0}")]
    GroupVersion(#[source] ParseGroupVersionError),
}

/// The object a declaration materializes, ready to be sent to a remote cluster
#[derive(Clone, Debug)]
pub struct Payload {
    gvk: GroupVersionKind,
    default_namespace: Option<String>,
    object: DynamicObject,
}

impl Payload {
    /// Kind of the remote object, used for REST mapping
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Name of the remote object
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Namespace the object lands in when its kind is namespaced
    pub fn namespace(&self) -> Option<String> {
        self.object
            .metadata
            .namespace
            .clone()
            .or_else(|| self.default_namespace.clone())
    }

    /// The object as it should be sent, scoped to `namespace` (`None` for cluster-scoped kinds)
    pub fn object_in(&self, namespace: Option<&str>) -> DynamicObject {
        let mut object = self.object.clone();
        object.metadata = ObjectMeta {
            namespace: namespace.map(String::from),
            ..object.metadata
        };
        object
    }

    /// Labels stamped on the remote object
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.object.labels()
    }
}
