//! Controller configuration, loaded from a YAML file
use crate::crd::ClusterId;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Errors loading the controller configuration or a cluster's client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying io error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`Config`]
    #[error("failed to parse configuration: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A cluster's kubeconfig could not be loaded
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[source] kube::config::KubeconfigError),

    /// In-cluster credentials are unavailable
    #[error("failed to load in-cluster configuration: {0}")]
    InCluster(#[source] kube::config::InClusterError),
}

/// Controller settings
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Seconds to wait before retrying a failed pass
    #[serde(default = "default_requeue_after_secs")]
    pub requeue_after_secs: u64,

    /// Immediate re-fetch attempts when persisting the ledger conflicts
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Upper bound on concurrent cluster calls within one pass, unbounded when unset
    #[serde(default)]
    pub max_concurrent_clusters: Option<usize>,

    /// Declarations reconciled concurrently
    #[serde(default = "default_workers")]
    pub workers: u16,

    /// Field manager used for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Only watch declarations in this namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// Target clusters by identifier
    #[serde(default)]
    pub clusters: BTreeMap<ClusterId, ClusterConfig>,
}

fn default_requeue_after_secs() -> u64 {
    60
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_workers() -> u16 {
    16
}

fn default_field_manager() -> String {
    "multicluster-controller".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            requeue_after_secs: default_requeue_after_secs(),
            conflict_retries: default_conflict_retries(),
            max_concurrent_clusters: None,
            workers: default_workers(),
            field_manager: default_field_manager(),
            namespace: None,
            clusters: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.requeue_after_secs == 0 {
            return Err(ConfigError::Invalid("requeueAfterSecs must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        if self.max_concurrent_clusters == Some(0) {
            return Err(ConfigError::Invalid("maxConcurrentClusters must be positive".into()));
        }
        if self.field_manager.is_empty() {
            return Err(ConfigError::Invalid("fieldManager must not be empty".into()));
        }
        for (id, cluster) in &self.clusters {
            validate_cluster_id(id)?;
            if cluster.in_cluster && (cluster.kubeconfig.is_some() || cluster.context.is_some()) {
                return Err(ConfigError::Invalid(format!(
                    "cluster {id}: inCluster excludes kubeconfig and context"
                )));
            }
        }
        Ok(())
    }

    /// Delay before a failed pass is retried
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }
}

// Cluster ids end up as the name part of a finalizer
fn validate_cluster_id(id: &ClusterId) -> Result<(), ConfigError> {
    let name = id.as_str();
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if name.is_empty() || name.len() > 63 || !valid_chars || !valid_edges {
        return Err(ConfigError::Invalid(format!(
            "cluster id {name:?} must be a lowercase DNS label of at most 63 characters"
        )));
    }
    Ok(())
}

/// How to reach one target cluster
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Kubeconfig file, the default search path (`$KUBECONFIG`, `~/.kube/config`) when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Context to use from the kubeconfig, its current context when unset
    #[serde(default)]
    pub context: Option<String>,

    /// Skip TLS verification of the API server
    #[serde(default)]
    pub insecure: bool,

    /// Use the service account the controller runs as
    #[serde(default)]
    pub in_cluster: bool,
}

impl ClusterConfig {
    /// Build the client configuration for this cluster
    pub async fn client_config(&self) -> Result<kube::Config, ConfigError> {
        let mut config = if self.in_cluster {
            kube::Config::incluster().map_err(ConfigError::InCluster)?
        } else {
            let kubeconfig = match &self.kubeconfig {
                Some(path) => Kubeconfig::read_from(path),
                None => Kubeconfig::read(),
            }
            .map_err(ConfigError::Kubeconfig)?;
            let options = KubeConfigOptions {
                context: self.context.clone(),
                ..KubeConfigOptions::default()
            };
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(ConfigError::Kubeconfig)?
        };
        if self.insecure {
            config.accept_invalid_certs = true;
        }
        Ok(config)
    }
}
