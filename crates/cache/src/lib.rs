//! Local key -> object mirror of one remote collection.
//!
//! A single stream-consuming path mutates the cache; reconciliation tasks on
//! worker threads read it concurrently, so the map sits behind an `RwLock`.
//! Mutation never fails, and an absent key is always `None`, never a default.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use metrics::counter;
use quorum_core::{OwnerKey, ResourceKey, WatchEvent, WatchedResource};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Classified change produced by applying a watch event.
///
/// `Modified` carries both values so a consumer can diff, e.g. to detect a
/// rollout completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T> {
    Added(T),
    Modified { old: T, new: T },
    Deleted(T),
}

pub struct ResourceCache<T> {
    entries: RwLock<FxHashMap<ResourceKey, T>>,
}

impl<T> Default for ResourceCache<T>
where
    T: WatchedResource + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceCache<T>
where
    T: WatchedResource + Clone,
{
    pub fn new() -> Self {
        Self { entries: RwLock::new(FxHashMap::default()) }
    }

    /// Wholesale replace from a full listing. Seeds state; no per-item
    /// notifications are emitted.
    pub fn sync(&self, full_list: Vec<T>) {
        let mut map = FxHashMap::default();
        for obj in full_list {
            map.insert(obj.key(), obj);
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        *entries = map;
        debug!(items = entries.len(), "cache synced from full listing");
    }

    /// Insert one item from the initial listing, silently.
    pub fn seed(&self, obj: T) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(obj.key(), obj);
    }

    /// Apply one watch event and classify the change. Duplicate deliveries
    /// (same key, same resource version) produce no notification.
    pub fn apply(&self, event: WatchEvent<T>) -> Option<Notification<T>> {
        match event {
            WatchEvent::Initial { resource, .. } => {
                self.seed(resource);
                None
            }
            WatchEvent::Added { resource, .. } | WatchEvent::Modified { resource, .. } => {
                self.upsert(resource)
            }
            WatchEvent::Deleted { resource, .. } => {
                let key = resource.key();
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                // Notify with the last cached value; the delete payload may
                // be stale or incomplete. An unknown key is a redelivered or
                // never-seen delete, and there is nothing to notify about.
                match entries.remove(&key) {
                    Some(last) => {
                        counter!("cache_deleted_total", 1);
                        Some(Notification::Deleted(last))
                    }
                    None => {
                        debug!(key = %key, "delete for unknown key suppressed");
                        None
                    }
                }
            }
            WatchEvent::Error { .. } => None,
        }
    }

    fn upsert(&self, obj: T) -> Option<Notification<T>> {
        let key = obj.key();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            None => {
                entries.insert(key, obj.clone());
                counter!("cache_added_total", 1);
                Some(Notification::Added(obj))
            }
            Some(existing) if existing.resource_version() == obj.resource_version() => {
                // Duplicate delivery; at-least-once is expected.
                debug!(key = %key, version = obj.resource_version(), "duplicate event suppressed");
                None
            }
            Some(existing) => {
                let old = existing.clone();
                entries.insert(key, obj.clone());
                counter!("cache_modified_total", 1);
                Some(Notification::Modified { old, new: obj })
            }
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    pub fn values(&self) -> Vec<T> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry owned by the given cluster. Bulk scan; deletions
    /// are rare relative to entries, so no owner index is kept.
    pub fn purge_owned(&self, owner: &OwnerKey) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, obj| obj.owner().as_ref() != Some(owner));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(owner = %owner, removed, "purged owned entries");
        }
        removed
    }
}
