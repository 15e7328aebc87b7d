//! Runs the [`Reconciler`] from a `kube` [`Controller`]
use crate::{
    crd::MultiClusterResource,
    error::Error,
    events::KubeEventSink,
    provider::KubeconfigProvider,
    reconciler::{Outcome, Reconciler, Settings},
    store::KubeStore,
    Config,
};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name events are reported under
pub const CONTROLLER_NAME: &str = "multicluster-controller";

/// Failures that keep the controller from starting
#[derive(Debug, ThisError)]
pub enum StartError {
    /// The `MultiClusterResource` CRD is not served by the control cluster
    #[error("MultiClusterResource is not installed (see `multicluster-controller crd`): {0}")]
    CrdMissing(#[source] kube::Error),
}

/// A pass that did not settle, with the delay the reconciler asked for
#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct PassError {
    #[source]
    error: Error,
    /// `None` when the pass was aborted and should wait for the next change
    retry_after: Option<Duration>,
}

impl PassError {
    /// Why the pass did not settle
    pub fn error(&self) -> &Error {
        &self.error
    }
}

/// Shared state handed to every reconcile call
pub struct Context {
    reconciler: Reconciler,
    cancel: CancellationToken,
}

impl Context {
    /// Bundle a reconciler with the token that cancels its passes
    pub fn new(reconciler: Reconciler, cancel: CancellationToken) -> Self {
        Self { reconciler, cancel }
    }
}

/// Translate a pass outcome into what the controller schedules next
fn into_action(outcome: Outcome) -> Result<Action, PassError> {
    match outcome {
        Outcome::Settled => Ok(Action::await_change()),
        Outcome::Requeue { after, error } => Err(PassError {
            error,
            retry_after: Some(after),
        }),
        Outcome::Aborted(error) => Err(PassError {
            error,
            retry_after: None,
        }),
    }
}

async fn reconcile(obj: Arc<MultiClusterResource>, ctx: Arc<Context>) -> Result<Action, PassError> {
    let key = ObjectRef::from_obj(&*obj);
    into_action(ctx.reconciler.reconcile(&key, &ctx.cancel).await)
}

fn error_policy(_obj: Arc<MultiClusterResource>, err: &PassError, _ctx: Arc<Context>) -> Action {
    match err.retry_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

/// Reconcile declarations until a shutdown signal arrives or `cancel` fires
pub async fn run(client: Client, config: Config, cancel: CancellationToken) -> Result<(), StartError> {
    let declarations: Api<MultiClusterResource> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    declarations
        .list(&ListParams::default().limit(1))
        .await
        .map_err(StartError::CrdMissing)?;

    let settings = Settings::from(&config);
    let reconciler = Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeconfigProvider::new(config.clusters.clone(), config.field_manager.clone())),
        Arc::new(KubeEventSink::new(client, CONTROLLER_NAME)),
        settings,
    );
    let ctx = Arc::new(Context::new(reconciler, cancel.clone()));

    info!(clusters = config.clusters.len(), workers = config.workers, "starting controller");
    Controller::new(declarations, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(config.workers))
        .graceful_shutdown_on(async move { cancel.cancelled_owned().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
