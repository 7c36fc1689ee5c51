//! Quorum core types: keys, watch events, and the managed resource shapes
//! shared by the watch/cache/queue machinery.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Label carried by child objects naming the cluster that owns them.
pub const CLUSTER_LABEL: &str = "quorum.io/cluster";

/// Identifies one remote object within a namespace-scoped collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Serialization domain for reconciliation work: all work for one cluster
/// shares one key regardless of which sub-resource triggered it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    pub cluster_name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), cluster_name: cluster_name.into() }
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.cluster_name)
    }
}

/// Reconciliation phase reported on cluster status. The engine treats this
/// as an opaque value for change-interest filtering; transition rules live
/// with the reconciler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Creating,
    ScalingUp,
    ScalingDown,
    Updating,
    Running,
    Error,
    Decommissioning,
}

/// Typed change event produced by a watch source. Events for one key arrive
/// in remote-assigned order; there is no ordering across keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    /// Seed item from the initial full listing.
    Initial { resource: T, resource_version: String },
    Added { resource: T, resource_version: String },
    Modified { resource: T, resource_version: String },
    Deleted { resource: T, resource_version: String },
    /// Remote-reported failure; the incremental stream can no longer be
    /// trusted and the caller must re-list.
    Error { message: String },
}

impl<T> WatchEvent<T> {
    pub fn resource(&self) -> Option<&T> {
        match self {
            WatchEvent::Initial { resource, .. }
            | WatchEvent::Added { resource, .. }
            | WatchEvent::Modified { resource, .. }
            | WatchEvent::Deleted { resource, .. } => Some(resource),
            WatchEvent::Error { .. } => None,
        }
    }
}

/// Minimal object metadata mirrored from the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: String,
    #[serde(rename = "creationTimestamp", default, with = "ts_rfc3339")]
    pub creation_ts: i64,
    #[serde(default, with = "label_pairs")]
    pub labels: SmallVec<[(String, String); 8]>,
}

impl ObjectMeta {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Labels travel as a JSON object on the wire; locally they are kept as a
/// small sorted vec of pairs (the common case is a handful of entries).
mod label_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use smallvec::SmallVec;
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        labels: &SmallVec<[(String, String); 8]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<&str, &str> =
            labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        map.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<SmallVec<[(String, String); 8]>, D::Error> {
        let map = Option::<BTreeMap<String, String>>::deserialize(d)?.unwrap_or_default();
        Ok(map.into_iter().collect())
    }
}

mod ts_rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &i64, s: S) -> Result<S::Ok, S::Error> {
        match chrono::DateTime::from_timestamp(*ts, 0) {
            Some(dt) => s.serialize_str(&dt.to_rfc3339()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0))
    }
}

/// Implemented by every resource family the engine mirrors locally.
pub trait WatchedResource {
    fn key(&self) -> ResourceKey;
    fn resource_version(&self) -> &str;
    /// The cluster this object belongs to, when the object self-describes it.
    fn owner(&self) -> Option<OwnerKey>;
}

/// Desired state for one managed database cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DbClusterSpec {
    pub nodes: i32,
    pub image: String,
    /// Free-form cluster configuration; fingerprinted as canonical JSON.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DbClusterStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(rename = "readyNodes", default)]
    pub ready_nodes: i32,
}

/// The cluster custom object itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DbCluster {
    #[serde(rename = "metadata")]
    pub meta: ObjectMeta,
    pub spec: DbClusterSpec,
    #[serde(default)]
    pub status: DbClusterStatus,
}

impl WatchedResource for DbCluster {
    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.meta.namespace.clone(), self.meta.name.clone())
    }

    fn resource_version(&self) -> &str {
        &self.meta.resource_version
    }

    fn owner(&self) -> Option<OwnerKey> {
        // A cluster is its own serialization domain.
        Some(OwnerKey::new(self.meta.namespace.clone(), self.meta.name.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkloadStatus {
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,
}

/// Stateful workload rollout object reporting back to its owning cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Workload {
    #[serde(rename = "metadata")]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    /// All replicas current and ready; the rollout has settled.
    pub fn rollout_ready(&self) -> bool {
        self.status.ready_replicas == self.spec.replicas
            && self.status.updated_replicas == self.spec.replicas
    }
}

impl WatchedResource for Workload {
    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.meta.namespace.clone(), self.meta.name.clone())
    }

    fn resource_version(&self) -> &str {
        &self.meta.resource_version
    }

    fn owner(&self) -> Option<OwnerKey> {
        self.meta
            .label(CLUSTER_LABEL)
            .map(|c| OwnerKey::new(self.meta.namespace.clone(), c))
    }
}

/// 64-bit FNV-1a over the canonical JSON encoding of a spec, rendered as
/// fixed-width hex. Stable across processes, cheap enough per event.
pub fn spec_fingerprint<S: Serialize>(spec: &S) -> String {
    let bytes = serde_json::to_vec(spec).unwrap_or_default();
    let mut h: u64 = 0xcbf29ce484222325;
    for b in &bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", h)
}

pub mod prelude {
    pub use super::{
        DbCluster, DbClusterSpec, DbClusterStatus, ObjectMeta, OwnerKey, Phase, ResourceKey,
        WatchEvent, WatchedResource, Workload, WorkloadSpec, WorkloadStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_spec_changes() {
        let a = DbClusterSpec { nodes: 3, image: "db:4.1".into(), config: serde_json::json!({}) };
        let mut b = a.clone();
        assert_eq!(spec_fingerprint(&a), spec_fingerprint(&b));
        b.nodes = 5;
        assert_ne!(spec_fingerprint(&a), spec_fingerprint(&b));
    }

    #[test]
    fn workload_owner_comes_from_label() {
        let mut w = Workload::default();
        w.meta.namespace = "db".into();
        w.meta.name = "dc1-rack1".into();
        assert!(w.owner().is_none());
        w.meta.labels.push((CLUSTER_LABEL.to_string(), "dc1".to_string()));
        assert_eq!(w.owner(), Some(OwnerKey::new("db", "dc1")));
    }

    #[test]
    fn meta_decodes_creation_timestamp() {
        let raw = serde_json::json!({
            "metadata": {
                "name": "dc1",
                "namespace": "db",
                "resourceVersion": "10",
                "creationTimestamp": "2020-01-01T00:00:00Z",
            },
            "spec": { "nodes": 3, "image": "db:4.1" },
        });
        let c: DbCluster = serde_json::from_value(raw).unwrap();
        assert_eq!(c.meta.creation_ts, 1577836800);
        assert_eq!(c.resource_version(), "10");
    }
}
