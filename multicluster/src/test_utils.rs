//! In-memory stand-ins for the store, the clusters and the event sink
use crate::{
    crd::{ClusterId, MultiClusterResource, MultiClusterResourceSpec, Payload},
    events::{EventSink, Severity},
    ledger,
    provider::{ClusterError, ClusterProvider, RemoteCluster},
    store::{DeclarationStore, StoreError},
};
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{TimeZone, Utc},
};
use kube::{core::ErrorResponse, runtime::reflector::ObjectRef, ResourceExt};
use parking_lot::Mutex;
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

pub fn ids(names: &[&str]) -> Vec<ClusterId> {
    names.iter().copied().map(ClusterId::from).collect()
}

/// A declaration in namespace `apps` templating a ConfigMap
pub fn declaration(name: &str, clusters: &[&str]) -> MultiClusterResource {
    let mut mcr = MultiClusterResource::new(name, MultiClusterResourceSpec {
        template: json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "data": {"greeting": "hello"}
        }),
        clusters: ids(clusters),
    });
    mcr.metadata.namespace = Some("apps".into());
    mcr
}

pub fn with_ledger(mut mcr: MultiClusterResource, clusters: &[&str]) -> MultiClusterResource {
    ledger::set_clusters(&mut mcr, &ids(clusters));
    mcr
}

pub fn deleting(mut mcr: MultiClusterResource) -> MultiClusterResource {
    mcr.metadata.deletion_timestamp = Some(Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    mcr
}

/// What the API server answers when it is having a bad day
pub fn server_error() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: "etcdserver: request timed out".into(),
        reason: "InternalError".into(),
        code: 500,
    })
}

pub fn configmap_payload() -> Payload {
    declaration("web", &[]).payload().unwrap()
}

// ------------------------------------------------------------------------
// store
// ------------------------------------------------------------------------

type Key = (Option<String>, String);

fn key_of(obj: &MultiClusterResource) -> Key {
    (obj.namespace(), obj.name_any())
}

/// Declaration store that checks `resourceVersion` like the API server does
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<Key, MultiClusterResource>>,
    /// Ledgers written by successful replaces, oldest first
    writes: Mutex<Vec<Vec<ClusterId>>>,
    /// Edits another writer makes right before our next replace lands
    interference: Mutex<Vec<Box<dyn FnOnce(&mut MultiClusterResource) + Send>>>,
    fail_gets: Mutex<usize>,
}

impl MemoryStore {
    pub fn with(objects: impl IntoIterator<Item = MultiClusterResource>) -> Arc<Self> {
        let store = Self::default();
        for mut obj in objects {
            obj.metadata.resource_version = Some("1".into());
            store.objects.lock().insert(key_of(&obj), obj);
        }
        Arc::new(store)
    }

    pub fn get_now(&self, name: &str) -> Option<MultiClusterResource> {
        self.objects
            .lock()
            .get(&(Some("apps".to_string()), name.to_string()))
            .cloned()
    }

    pub fn ledger_of(&self, name: &str) -> Vec<ClusterId> {
        self.get_now(name).map(|obj| ledger::clusters(&obj)).unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<Vec<ClusterId>> {
        self.writes.lock().clone()
    }

    /// Simulate a concurrent writer updating the object just before our next replace
    pub fn interfere(&self, edit: impl FnOnce(&mut MultiClusterResource) + Send + 'static) {
        self.interference.lock().push(Box::new(edit));
    }

    pub fn fail_next_gets(&self, count: usize) {
        *self.fail_gets.lock() = count;
    }

    fn bump(obj: &mut MultiClusterResource) {
        let version: u64 = obj
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        obj.metadata.resource_version = Some((version + 1).to_string());
    }
}

#[async_trait]
impl DeclarationStore for MemoryStore {
    async fn get(
        &self,
        key: &ObjectRef<MultiClusterResource>,
    ) -> Result<Option<MultiClusterResource>, StoreError> {
        {
            let mut fail = self.fail_gets.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(StoreError::Api(server_error()));
            }
        }
        Ok(self
            .objects
            .lock()
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn replace(&self, obj: &MultiClusterResource) -> Result<MultiClusterResource, StoreError> {
        let mut objects = self.objects.lock();
        let stored = objects
            .get_mut(&key_of(obj))
            .ok_or_else(|| StoreError::Conflict(obj.name_any()))?;
        if let Some(edit) = self.interference.lock().pop() {
            edit(stored);
            Self::bump(stored);
        }
        if stored.metadata.resource_version != obj.metadata.resource_version {
            return Err(StoreError::Conflict(obj.name_any()));
        }
        let mut updated = obj.clone();
        Self::bump(&mut updated);
        *stored = updated.clone();
        self.writes.lock().push(ledger::clusters(&updated));
        Ok(updated)
    }
}

// ------------------------------------------------------------------------
// clusters
// ------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Apply,
    Delete,
}

#[derive(Default)]
struct FleetState {
    known: HashSet<String>,
    /// cluster -> names of objects it holds
    objects: HashMap<String, HashSet<String>>,
    failing: HashSet<(String, Op)>,
    hanging: HashSet<String>,
    latency: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
    calls: Vec<(Op, String)>,
}

/// A set of fake clusters with failure injection and a call log
#[derive(Clone, Default)]
pub struct Fleet(Arc<Mutex<FleetState>>);

impl Fleet {
    pub fn new(clusters: &[&str]) -> Self {
        let fleet = Self::default();
        fleet.0.lock().known = clusters.iter().map(|c| c.to_string()).collect();
        fleet
    }

    pub fn provider(&self) -> Arc<dyn ClusterProvider> {
        Arc::new(self.clone())
    }

    pub fn fail_apply(&self, cluster: &str) {
        self.0.lock().failing.insert((cluster.into(), Op::Apply));
    }

    pub fn fail_delete(&self, cluster: &str) {
        self.0.lock().failing.insert((cluster.into(), Op::Delete));
    }

    pub fn heal(&self) {
        self.0.lock().failing.clear();
    }

    pub fn hang(&self, cluster: &str) {
        self.0.lock().hanging.insert(cluster.into());
    }

    /// Make every call take `latency` before it completes
    pub fn slow(&self, latency: Duration) {
        self.0.lock().latency = Some(latency);
    }

    /// Most calls that were ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.0.lock().peak_in_flight
    }

    pub fn seed(&self, cluster: &str, name: &str) {
        self.0
            .lock()
            .objects
            .entry(cluster.into())
            .or_default()
            .insert(name.into());
    }

    pub fn holds(&self, cluster: &str, name: &str) -> bool {
        self.0
            .lock()
            .objects
            .get(cluster)
            .is_some_and(|names| names.contains(name))
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.0.lock().calls.clone()
    }

    /// Clusters that saw `op`, sorted
    pub fn touched(&self, op: Op) -> Vec<String> {
        let mut clusters: Vec<String> = self
            .calls()
            .into_iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, c)| c)
            .collect();
        clusters.sort();
        clusters
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|(o, _)| *o == op).count()
    }
}

#[async_trait]
impl ClusterProvider for Fleet {
    async fn resolve(&self, cluster: &ClusterId) -> Result<Arc<dyn RemoteCluster>, ClusterError> {
        if !self.0.lock().known.contains(cluster.as_str()) {
            return Err(ClusterError::Unknown(cluster.clone()));
        }
        Ok(Arc::new(FakeCluster {
            id: cluster.clone(),
            fleet: self.clone(),
        }))
    }
}

struct FakeCluster {
    id: ClusterId,
    fleet: Fleet,
}

impl FakeCluster {
    async fn call(&self, op: Op, payload: &Payload) -> Result<(), ClusterError> {
        let cluster = self.id.as_str().to_string();
        let (hang, latency) = {
            let mut state = self.fleet.0.lock();
            state.calls.push((op, cluster.clone()));
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            (state.hanging.contains(&cluster), state.latency)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.fleet.0.lock();
        state.in_flight -= 1;
        if state.failing.contains(&(cluster.clone(), op)) {
            return Err(ClusterError::Api {
                cluster: self.id.clone(),
                source: server_error(),
            });
        }
        let objects = state.objects.entry(cluster).or_default();
        match op {
            Op::Apply => objects.insert(payload.name()),
            Op::Delete => objects.remove(&payload.name()),
        };
        Ok(())
    }
}

#[async_trait]
impl RemoteCluster for FakeCluster {
    async fn apply(&self, payload: &Payload) -> Result<(), ClusterError> {
        self.call(Op::Apply, payload).await
    }

    async fn delete(&self, payload: &Payload) -> Result<(), ClusterError> {
        self.call(Op::Delete, payload).await
    }
}

// ------------------------------------------------------------------------
// events
// ------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recorded {
    pub name: Option<String>,
    pub severity: Severity,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<Recorded>>);

impl RecordingSink {
    pub fn events(&self) -> Vec<Recorded> {
        self.0.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn record(&self, regarding: &ObjectReference, severity: Severity, reason: &str, note: String) {
        self.0.lock().push(Recorded {
            name: regarding.name.clone(),
            severity,
            reason: reason.into(),
            note,
        });
    }
}
