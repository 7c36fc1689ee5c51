//! Classifies cache notifications into reconciliation work items.

use std::sync::Arc;

use quorum_cache::{Notification, ResourceCache};
use quorum_checkpoint::CheckpointStore;
use quorum_core::{
    spec_fingerprint, DbCluster, DbClusterSpec, OwnerKey, ResourceKey, WatchedResource, Workload,
};
use quorum_queue::{Task, WorkItem};
use tracing::{debug, warn};

use crate::Reconcile;

pub struct EventRouter {
    clusters: Arc<ResourceCache<DbCluster>>,
    workloads: Arc<ResourceCache<Workload>>,
    checkpoints: Arc<CheckpointStore<DbClusterSpec>>,
    reconciler: Arc<dyn Reconcile>,
}

impl EventRouter {
    pub fn new(
        clusters: Arc<ResourceCache<DbCluster>>,
        workloads: Arc<ResourceCache<Workload>>,
        checkpoints: Arc<CheckpointStore<DbClusterSpec>>,
        reconciler: Arc<dyn Reconcile>,
    ) -> Self {
        Self { clusters, workloads, checkpoints, reconciler }
    }

    /// Route a cluster change. Status-only modifications are noise; a
    /// deletion tears down everything the cluster owned instead of
    /// reconciling.
    pub fn route_cluster(&self, notification: &Notification<DbCluster>) -> Option<WorkItem> {
        match notification {
            Notification::Added(cluster) => {
                let owner = cluster.owner()?;
                Some(self.work_item(owner))
            }
            Notification::Modified { old, new } => {
                let spec_changed = spec_fingerprint(&old.spec) != spec_fingerprint(&new.spec);
                let phase_changed = old.status.phase != new.status.phase;
                if !spec_changed && !phase_changed {
                    debug!(key = %new.key(), "status-only change; nothing to do");
                    return None;
                }
                let owner = new.owner()?;
                Some(self.work_item(owner))
            }
            Notification::Deleted(cluster) => {
                if let Some(owner) = cluster.owner() {
                    let purged = self.workloads.purge_owned(&owner);
                    self.checkpoints.remove(&owner);
                    debug!(owner = %owner, purged, "cluster torn down");
                }
                None
            }
        }
    }

    /// Route a workload rollout change back to its owning cluster. Not-ready
    /// rollouts are dropped silently; a later event supersedes them once the
    /// rollout settles.
    pub fn route_workload(&self, notification: &Notification<Workload>) -> Option<WorkItem> {
        let workload = match notification {
            Notification::Added(w) => w,
            Notification::Modified { new, .. } => new,
            Notification::Deleted(_) => {
                // Nothing to converge for a deleted rollout on its own; the
                // owning cluster's own events drive any follow-up.
                return None;
            }
        };
        if !workload.rollout_ready() {
            debug!(key = %workload.key(), "rollout not settled; dropping");
            return None;
        }
        let Some(owner) = workload.owner() else {
            warn!(key = %workload.key(), "workload carries no owner label; dropping");
            return None;
        };
        let owner_key = ResourceKey::new(owner.namespace.clone(), owner.cluster_name.clone());
        if self.clusters.get(&owner_key).is_none() {
            // The owner may have been deleted concurrently.
            warn!(owner = %owner, "owning cluster not in cache; dropping event");
            return None;
        }
        Some(self.work_item(owner))
    }

    /// Build the deferred reconciliation task. It re-reads the freshest
    /// cached state at execution time; the triggering payload may be stale
    /// by the time the lane gets to it.
    fn work_item(&self, owner: OwnerKey) -> WorkItem {
        let clusters = Arc::clone(&self.clusters);
        let checkpoints = Arc::clone(&self.checkpoints);
        let reconciler = Arc::clone(&self.reconciler);
        let task_owner = owner.clone();
        let task: Task = Box::new(move || {
            Box::pin(async move {
                let key =
                    ResourceKey::new(task_owner.namespace.clone(), task_owner.cluster_name.clone());
                let Some(cluster) = clusters.get(&key) else {
                    debug!(owner = %task_owner, "cluster gone before reconcile; skipping");
                    return Ok(());
                };
                let fingerprint = spec_fingerprint(&cluster.spec);
                checkpoints.prepare(&task_owner, cluster.spec.clone(), &fingerprint);
                match reconciler.reconcile(&task_owner).await {
                    Ok(()) => {
                        checkpoints.commit(&task_owner, &fingerprint);
                        Ok(())
                    }
                    Err(e) => {
                        checkpoints.rollback(&task_owner);
                        Err(e)
                    }
                }
            })
        });
        WorkItem { owner, task }
    }
}
