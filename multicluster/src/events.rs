//! Operator-visible audit trail
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use std::fmt;
use tracing::warn;

/// Reason recorded when cleaning up a deleted declaration fails
pub const DELETE: &str = "Delete";
/// Reason recorded when persisting the ledger fails
pub const UPDATE_FAILED: &str = "UpdateFailed";
/// Reason recorded when cleaning up clusters dropped from a declaration fails
pub const DELETE_FAILED: &str = "DeleteFailed";
/// Reason recorded when materializing a declaration fails
pub const APPLY_FAILED: &str = "ApplyFailed";
/// Reason recorded when the declaration cannot be read
pub const FETCH_FAILED: &str = "FetchFailed";

/// How alarming an event is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Informational
    Normal,
    /// Something needs a look
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Normal => "Normal",
            Severity::Warning => "Warning",
        })
    }
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// Destination for audit events
///
/// Recording is best-effort: implementations swallow their own failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Attach an event to `regarding`
    async fn record(&self, regarding: &ObjectReference, severity: Severity, reason: &str, note: String);
}

/// [`EventSink`] publishing `events.k8s.io/v1` events
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Publish events as `controller`, tagged with the pod name when `CONTROLLER_POD_NAME` is set
    #[must_use]
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("CONTROLLER_POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn record(&self, regarding: &ObjectReference, severity: Severity, reason: &str, note: String) {
        let event = Event {
            type_: severity.into(),
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, regarding).await {
            warn!(%reason, error = %err, "failed to publish event");
        }
    }
}
