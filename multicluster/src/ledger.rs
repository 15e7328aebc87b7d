//! Finalizer ledger: which clusters hold a materialized copy of a declaration
//!
//! Every cluster that received a copy is recorded as a `cluster.multicluster.practice.com/<id>`
//! entry in `metadata.finalizers`. Kubernetes will not erase the declaration while any entry
//! remains, so an entry is only dropped once the copy in that cluster is confirmed gone.
//!
//! Everything here is pure bookkeeping, the reconciler performs the I/O.
use crate::crd::{ClusterId, API_GROUP};
use kube::{Resource, ResourceExt};
use std::collections::HashSet;

/// Prefix (domain part) of ledger finalizers
const FINALIZER_DOMAIN: &str = "cluster";

/// Finalizer entry recording that `cluster` holds a copy
pub fn finalizer_for(cluster: &ClusterId) -> String {
    format!("{FINALIZER_DOMAIN}.{API_GROUP}/{cluster}")
}

fn cluster_of(finalizer: &str) -> Option<ClusterId> {
    finalizer
        .strip_prefix(FINALIZER_DOMAIN)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_prefix(API_GROUP))
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|id| !id.is_empty())
        .map(ClusterId::from)
}

/// Clusters currently recorded on `obj`, in finalizer order
pub fn clusters<K: Resource>(obj: &K) -> Vec<ClusterId> {
    obj.finalizers().iter().filter_map(|f| cluster_of(f)).collect()
}

/// Replace the recorded clusters on `obj`, leaving finalizers of other controllers alone
pub fn set_clusters<K: Resource>(obj: &mut K, clusters: &[ClusterId]) {
    let finalizers = obj.finalizers_mut();
    finalizers.retain(|f| cluster_of(f).is_none());
    finalizers.extend(clusters.iter().map(finalizer_for));
}

/// Cleanup needed to bring a ledger in line with the desired clusters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delta {
    /// Recorded clusters that are no longer desired and must be cleaned up
    pub to_delete: Vec<ClusterId>,
    /// The ledger once `to_delete` has been cleaned up
    pub retained: Vec<ClusterId>,
    /// Whether `to_delete` is non-empty
    pub changed: bool,
}

/// Compare the desired clusters with the recorded ones
///
/// `to_delete` is `current - desired`. Desired clusters missing from `current` are not added
/// to `retained`: a cluster only enters the ledger after a copy was applied there
/// (see [`record_applied`]).
pub fn compute_delta(desired: &[ClusterId], current: &[ClusterId]) -> Delta {
    let desired: HashSet<&ClusterId> = desired.iter().collect();
    let (retained, to_delete): (Vec<ClusterId>, Vec<ClusterId>) =
        current.iter().cloned().partition(|cluster| desired.contains(cluster));
    Delta {
        changed: !to_delete.is_empty(),
        to_delete,
        retained,
    }
}

/// Ledger after successfully applying to `applied`, or `None` if nothing new was recorded
pub fn record_applied(current: &[ClusterId], applied: &[ClusterId]) -> Option<Vec<ClusterId>> {
    let mut ledger = current.to_vec();
    for cluster in applied {
        if !ledger.contains(cluster) {
            ledger.push(cluster.clone());
        }
    }
    (ledger.len() != current.len()).then_some(ledger)
}
