//! Commit/rollback checkpoint of the last successfully applied configuration
//! per cluster.
//!
//! Lifecycle per owner: `prepare` stages a candidate (last writer wins while
//! pending), `commit` promotes it only when the fingerprint still matches
//! what reconciliation actually applied, `rollback` discards the candidate
//! and keeps the last good committed state for repair reconciliations.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use quorum_core::OwnerKey;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CheckPoint<S> {
    pub committed_spec: Option<S>,
    pub committed_fingerprint: Option<String>,
    pub pending_spec: Option<S>,
    pub pending_fingerprint: Option<String>,
}

impl<S> Default for CheckPoint<S> {
    fn default() -> Self {
        Self {
            committed_spec: None,
            committed_fingerprint: None,
            pending_spec: None,
            pending_fingerprint: None,
        }
    }
}

impl<S> CheckPoint<S> {
    pub fn is_pending(&self) -> bool {
        self.pending_fingerprint.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.committed_fingerprint.is_some()
    }
}

pub struct CheckpointStore<S> {
    entries: Mutex<FxHashMap<OwnerKey, CheckPoint<S>>>,
}

impl<S: Clone> Default for CheckpointStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> CheckpointStore<S> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(FxHashMap::default()) }
    }

    /// Stage a candidate configuration. Overwrites any pending candidate: a
    /// newer desired state supersedes an in-flight one.
    pub fn prepare(&self, owner: &OwnerKey, spec: S, fingerprint: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let cp = entries.entry(owner.clone()).or_default();
        cp.pending_spec = Some(spec);
        cp.pending_fingerprint = Some(fingerprint.to_string());
        debug!(owner = %owner, fingerprint, "checkpoint prepared");
    }

    /// Promote pending to committed, but only when the pending fingerprint
    /// still matches what reconciliation applied. A mismatch means a newer
    /// desired state superseded this one mid-flight; committing it would
    /// record stale work, so this is a silent no-op. Returns whether the
    /// promotion happened.
    pub fn commit(&self, owner: &OwnerKey, applied_fingerprint: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cp) = entries.get_mut(owner) else { return false };
        if cp.pending_fingerprint.as_deref() != Some(applied_fingerprint) {
            debug!(owner = %owner, applied_fingerprint, "stale commit ignored");
            return false;
        }
        cp.committed_spec = cp.pending_spec.take();
        cp.committed_fingerprint = cp.pending_fingerprint.take();
        debug!(owner = %owner, applied_fingerprint, "checkpoint committed");
        true
    }

    /// Discard the pending candidate, keeping the last committed state.
    /// Returns whether there was a candidate to discard.
    pub fn rollback(&self, owner: &OwnerKey) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cp) = entries.get_mut(owner) else { return false };
        let had_pending = cp.is_pending();
        cp.pending_spec = None;
        cp.pending_fingerprint = None;
        if had_pending {
            debug!(owner = %owner, "checkpoint rolled back");
        }
        had_pending
    }

    pub fn get(&self, owner: &OwnerKey) -> Option<CheckPoint<S>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(owner).cloned()
    }

    /// Last configuration confirmed to have reconciled successfully.
    pub fn last_committed(&self, owner: &OwnerKey) -> Option<S> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(owner).and_then(|cp| cp.committed_spec.clone())
    }

    /// Cluster teardown; the only path that deletes a checkpoint.
    pub fn remove(&self, owner: &OwnerKey) -> Option<CheckPoint<S>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(owner)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
