//! Keeps one Kubernetes object materialized across a fleet of clusters.
//!
//! # Overview
//!
//! A [`MultiClusterResource`] living in a control cluster carries a resource template and the
//! list of clusters that should hold a copy of it. The [`Reconciler`] drives every cluster
//! towards that declaration and records which clusters it has materialized the copy in as
//! finalizers on the declaration itself, so the record survives restarts and blocks deletion
//! until every copy is gone.
//!
//! The main modules are:
//!
//! - [`crd`] with the [`MultiClusterResource`] custom resource and the template [`Payload`](crd::Payload)
//! - [`ledger`] for reading and rewriting the per-cluster finalizers
//! - [`executor`] fanning apply and delete calls out over many clusters
//! - [`reconciler`] with the state machine run on every change
//! - [`controller`] wiring the reconciler into a `kube` [`Controller`](kube::runtime::Controller)
//! - [`config`] for the YAML file that names the remote clusters
//!
//! # Running a reconciler
//! ```no_run
//! use kube::Client;
//! use kube_multicluster::{controller, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("multicluster.yaml".as_ref())?;
//!     let client = Client::try_default().await?;
//!     controller::run(client, config, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod provider;
pub mod reconciler;
pub mod store;

#[cfg(test)] mod test_utils;

pub use config::{ClusterConfig, Config, ConfigError};
pub use crd::{ClusterId, MultiClusterResource, MultiClusterResourceSpec};
pub use error::Error;
pub use executor::Executor;
pub use reconciler::{Outcome, Reconciler, Settings};

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
