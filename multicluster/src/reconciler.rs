//! The reconciliation state machine for `MultiClusterResource`
//!
//! One pass walks a declaration through these states:
//!
//! - [`Phase::Active`]: clusters dropped from `spec.clusters` are cleaned up first and the
//!   trimmed ledger is persisted, then the payload is applied to every desired cluster and the
//!   clusters that received it are recorded.
//! - [`Phase::Deleting`]: the payload is deleted from every recorded cluster, then the ledger
//!   is cleared so Kubernetes can erase the declaration.
//! - [`Phase::Deleted`]: nothing left to do, the store removes the record.
//!
//! Ledger writes only ever follow confirmed cluster results, so a failed pass can be retried
//! wholesale.
use crate::{
    crd::MultiClusterResource,
    error::Error,
    events::{self, EventSink, Severity},
    executor::Executor,
    ledger,
    provider::ClusterProvider,
    store::DeclarationStore,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{runtime::reflector::ObjectRef, Resource, ResourceExt};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Knobs of the retry policy
#[derive(Clone, Debug)]
pub struct Settings {
    /// Delay before a failed pass is retried
    pub requeue_after: Duration,
    /// Immediate re-fetch attempts after a conflicting ledger write
    pub conflict_retries: u32,
    /// Upper bound on concurrent cluster calls within one pass
    pub max_concurrent_clusters: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(60),
            conflict_retries: 3,
            max_concurrent_clusters: None,
        }
    }
}

impl From<&crate::Config> for Settings {
    fn from(config: &crate::Config) -> Self {
        Self {
            requeue_after: config.requeue_after(),
            conflict_retries: config.conflict_retries,
            max_concurrent_clusters: config.max_concurrent_clusters,
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug)]
pub enum Outcome {
    /// Nothing further to do until the declaration changes
    Settled,
    /// Retry the pass after `after`
    Requeue {
        /// Delay before the retry
        after: Duration,
        /// Why the pass did not settle
        error: Error,
    },
    /// The pass was cancelled, retrying is up to whoever cancelled it
    Aborted(Error),
}

impl Outcome {
    /// Whether the pass settled
    pub fn is_settled(&self) -> bool {
        matches!(self, Outcome::Settled)
    }
}

/// Lifecycle state of a declaration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Materialized copies follow `spec`
    Active,
    /// Deletion requested, some clusters still hold a copy
    Deleting,
    /// Deletion requested, no copies left
    Deleted,
}

impl Phase {
    /// Phase of `obj` as last read from the store
    pub fn of(obj: &MultiClusterResource) -> Self {
        match (obj.meta().deletion_timestamp.is_some(), ledger::clusters(obj).is_empty()) {
            (false, _) => Phase::Active,
            (true, false) => Phase::Deleting,
            (true, true) => Phase::Deleted,
        }
    }
}

/// A pass that did not settle, and the event describing it
struct Failure {
    regarding: ObjectReference,
    severity: Severity,
    reason: &'static str,
    note: String,
    error: Error,
}

impl Failure {
    fn new(
        obj: &MultiClusterResource,
        severity: Severity,
        reason: &'static str,
        note: String,
        error: Error,
    ) -> Self {
        Self {
            regarding: obj.object_ref(&()),
            severity,
            reason,
            note: format!("{note}: {error}"),
            error,
        }
    }

    fn warning(
        obj: &MultiClusterResource,
        reason: &'static str,
        note: String,
        error: impl Into<Error>,
    ) -> Self {
        Self::new(obj, Severity::Warning, reason, note, error.into())
    }

    fn update_failed(obj: &MultiClusterResource, error: impl Into<Error>) -> Self {
        Self::warning(obj, events::UPDATE_FAILED, format!("update {} fail", obj.name_any()), error)
    }
}

/// Drives declarations towards their desired state across clusters
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DeclarationStore>,
    executor: Executor,
    events: Arc<dyn EventSink>,
    settings: Settings,
}

impl Reconciler {
    /// Assemble a reconciler from its collaborators
    pub fn new(
        store: Arc<dyn DeclarationStore>,
        provider: Arc<dyn ClusterProvider>,
        events: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            executor: Executor::new(provider, settings.max_concurrent_clusters),
            events,
            settings,
        }
    }

    /// Run one pass for the declaration identified by `key`
    ///
    /// Every outcome other than [`Outcome::Settled`] records exactly one event.
    #[instrument(skip_all, fields(name = %key.name, namespace = ?key.namespace))]
    pub async fn reconcile(
        &self,
        key: &ObjectRef<MultiClusterResource>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut attempt = 0;
        let failure = loop {
            match self.pass(key, cancel).await {
                Ok(()) => return Outcome::Settled,
                Err(failure) if failure.error.is_conflict() && attempt < self.settings.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, "ledger write conflicted, re-fetching");
                }
                Err(failure) => break failure,
            }
        };

        warn!(reason = failure.reason, error = %failure.error, "reconcile failed");
        self.events
            .record(&failure.regarding, failure.severity, failure.reason, failure.note)
            .await;
        if failure.error.is_cancelled() {
            Outcome::Aborted(failure.error)
        } else {
            Outcome::Requeue {
                after: self.settings.requeue_after,
                error: failure.error,
            }
        }
    }

    async fn pass(
        &self,
        key: &ObjectRef<MultiClusterResource>,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let obj = match self.store.get(key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                debug!("declaration is gone");
                return Ok(());
            }
            Err(err) => {
                return Err(Failure {
                    regarding: reference_for(key),
                    severity: Severity::Warning,
                    reason: events::FETCH_FAILED,
                    note: format!("fetch {} fail: {err}", key.name),
                    error: err.into(),
                })
            }
        };

        match Phase::of(&obj) {
            Phase::Active => self.converge(obj, cancel).await,
            Phase::Deleting => self.finalize(obj, cancel).await,
            Phase::Deleted => {
                debug!("no copies left");
                Ok(())
            }
        }
    }

    /// Remove every copy, then release the declaration
    async fn finalize(
        &self,
        mut obj: MultiClusterResource,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let recorded = ledger::clusters(&obj);
        let delete_failed = |error: Error| {
            let note = format!("delete {} fail", obj.name_any());
            let severity = if error.is_fatal_config() {
                Severity::Warning
            } else {
                Severity::Normal
            };
            Failure::new(&obj, severity, events::DELETE, note, error)
        };
        let payload = obj.payload().map_err(|err| delete_failed(err.into()))?;
        self.executor
            .delete(&payload, &recorded, cancel)
            .await
            .map_err(|err| delete_failed(err.into()))?;

        ledger::set_clusters(&mut obj, &[]);
        self.store
            .replace(&obj)
            .await
            .map_err(|err| Failure::update_failed(&obj, err))?;
        info!(clusters = recorded.len(), "removed all copies");
        Ok(())
    }

    /// Clean up dropped clusters, then materialize the payload everywhere it is desired
    async fn converge(
        &self,
        mut obj: MultiClusterResource,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let name = obj.name_any();
        let payload = obj.payload().map_err(|err| {
            Failure::warning(&obj, events::APPLY_FAILED, format!("resourceApply {name} fail"), err)
        })?;
        let desired = obj.desired_clusters();
        let delta = ledger::compute_delta(&desired, &ledger::clusters(&obj));

        if delta.changed {
            self.executor
                .delete(&payload, &delta.to_delete, cancel)
                .await
                .map_err(|err| {
                    let note = format!("resourceDeleteBySlice {name} fail");
                    Failure::warning(&obj, events::DELETE_FAILED, note, err)
                })?;
            ledger::set_clusters(&mut obj, &delta.retained);
            obj = self
                .store
                .replace(&obj)
                .await
                .map_err(|err| Failure::update_failed(&obj, err))?;
            info!(removed = ?delta.to_delete, "cleaned up dropped clusters");
        }

        let (applied, apply_err) = match self.executor.apply(&payload, &desired, cancel).await {
            Ok(()) => (desired, None),
            Err(err) => (err.succeeded.clone(), Some(err)),
        };
        // Clusters that took the payload hold a copy now, failed or not
        if let Some(grown) = ledger::record_applied(&delta.retained, &applied) {
            ledger::set_clusters(&mut obj, &grown);
            match self.store.replace(&obj).await {
                Ok(updated) => obj = updated,
                Err(err) if apply_err.is_none() || matches!(err, crate::store::StoreError::Conflict(_)) => {
                    return Err(Failure::update_failed(&obj, err));
                }
                Err(err) => warn!(error = %err, "failed to record partially applied clusters"),
            }
        }
        if let Some(err) = apply_err {
            let note = format!("resourceApply {name} fail");
            return Err(Failure::warning(&obj, events::APPLY_FAILED, note, err));
        }
        debug!(clusters = ledger::clusters(&obj).len(), "converged");
        Ok(())
    }
}

fn reference_for(key: &ObjectRef<MultiClusterResource>) -> ObjectReference {
    ObjectReference {
        api_version: Some(MultiClusterResource::api_version(&()).into_owned()),
        kind: Some(MultiClusterResource::kind(&()).into_owned()),
        name: Some(key.name.clone()),
        namespace: key.namespace.clone(),
        ..ObjectReference::default()
    }
}
