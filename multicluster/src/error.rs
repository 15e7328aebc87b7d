//! Error handling in [`kube-multicluster`][crate]
use crate::{crd::TemplateError, executor::ExecError, store::StoreError};
use thiserror::Error;

/// Why a reconciliation pass did not settle
#[derive(Debug, Error)]
pub enum Error {
    /// One or more clusters did not reach the desired state
    #[error("{0}")]
    Cluster(#[source] ExecError),

    /// The declaration changed while its ledger was being written
    #[error("declaration {0} was modified concurrently")]
    Conflict(String),

    /// The declaration store failed
    #[error("declaration store request failed: {0}")]
    Store(#[source] kube::Error),

    /// The template cannot be materialized
    #[error("invalid template: {0}")]
    InvalidTemplate(#[source] TemplateError),

    /// The pass was cancelled
    #[error("reconciliation was cancelled")]
    Cancelled,
}

impl Error {
    /// Retry by re-fetching instead of backing off
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// The pass was cut short on purpose
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Missing or invalid configuration that retrying alone will not fix
    pub fn is_fatal_config(&self) -> bool {
        match self {
            Error::Cluster(err) => err.is_fatal(),
            Error::InvalidTemplate(_) => true,
            _ => false,
        }
    }
}

impl From<ExecError> for Error {
    fn from(err: ExecError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Cluster(err)
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(name) => Error::Conflict(name),
            StoreError::Api(err) => Error::Store(err),
        }
    }
}

impl From<TemplateError> for Error {
    fn from(err: TemplateError) -> Self {
        Error::InvalidTemplate(err)
    }
}
