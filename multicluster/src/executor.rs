//! Fans apply and delete calls out over a list of clusters
use crate::{
    crd::{ClusterId, Payload},
    provider::{ClusterError, ClusterProvider},
};
use futures::{stream, StreamExt};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Operation performed on each cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Create-or-update
    Apply,
    /// Delete-if-exists
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Apply => "apply",
            Operation::Delete => "delete",
        })
    }
}

/// At least one cluster did not reach the desired state
#[derive(Debug, Error)]
#[error("{}", summarize(self))]
pub struct ExecError {
    /// What was attempted
    pub operation: Operation,
    /// Clusters where the operation went through
    pub succeeded: Vec<ClusterId>,
    /// Clusters where it did not, with the reason
    pub failed: Vec<(ClusterId, ClusterError)>,
}

impl ExecError {
    /// Whether any cluster was cut short by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.failed
            .iter()
            .any(|(_, err)| matches!(err, ClusterError::Cancelled(_)))
    }

    /// Whether every failure is a misconfiguration
    pub fn is_fatal(&self) -> bool {
        !self.failed.is_empty() && self.failed.iter().all(|(_, err)| err.is_fatal())
    }
}

fn summarize(err: &ExecError) -> String {
    let reasons: Vec<String> = err.failed.iter().map(|(_, e)| e.to_string()).collect();
    format!(
        "{} failed on {} of {} clusters: {}",
        err.operation,
        err.failed.len(),
        err.failed.len() + err.succeeded.len(),
        reasons.join("; ")
    )
}

/// Runs one operation against many clusters
///
/// Every cluster in the list is attempted even when others fail, so a failed batch reports
/// exactly which clusters still need work.
#[derive(Clone)]
pub struct Executor {
    provider: Arc<dyn ClusterProvider>,
    max_concurrent: Option<usize>,
}

impl Executor {
    /// Resolve clusters through `provider`, running at most `max_concurrent` calls at once
    /// (one per cluster when `None`)
    pub fn new(provider: Arc<dyn ClusterProvider>, max_concurrent: Option<usize>) -> Self {
        Self {
            provider,
            max_concurrent,
        }
    }

    /// Create or update `payload` in every cluster of `clusters`
    pub async fn apply(
        &self,
        payload: &Payload,
        clusters: &[ClusterId],
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        self.run(Operation::Apply, payload, clusters, cancel).await
    }

    /// Delete `payload` from every cluster of `clusters`, absent objects count as deleted
    pub async fn delete(
        &self,
        payload: &Payload,
        clusters: &[ClusterId],
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        self.run(Operation::Delete, payload, clusters, cancel).await
    }

    #[instrument(skip(self, payload, cancel), fields(name = %payload.name()))]
    async fn run(
        &self,
        operation: Operation,
        payload: &Payload,
        clusters: &[ClusterId],
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        if clusters.is_empty() {
            return Ok(());
        }
        let limit = self.max_concurrent.unwrap_or(clusters.len()).max(1);
        let results: Vec<(ClusterId, Result<(), ClusterError>)> = stream::iter(clusters.to_vec())
            .map(|cluster| async move {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ClusterError::Cancelled(cluster.clone())),
                    result = self.run_one(operation, payload, &cluster) => result,
                };
                (cluster, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (cluster, result) in results {
            match result {
                Ok(()) => succeeded.push(cluster),
                Err(err) => {
                    warn!(%cluster, %operation, error = %err, "cluster did not converge");
                    failed.push((cluster, err));
                }
            }
        }
        if failed.is_empty() {
            debug!(clusters = succeeded.len(), "batch converged");
            return Ok(());
        }
        Err(ExecError {
            operation,
            succeeded,
            failed,
        })
    }

    async fn run_one(
        &self,
        operation: Operation,
        payload: &Payload,
        cluster: &ClusterId,
    ) -> Result<(), ClusterError> {
        let target = self.provider.resolve(cluster).await?;
        match operation {
            Operation::Apply => target.apply(payload).await,
            Operation::Delete => target.delete(payload).await,
        }
    }
}
