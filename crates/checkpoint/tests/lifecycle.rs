#![forbid(unsafe_code)]

use quorum_checkpoint::CheckpointStore;
use quorum_core::{spec_fingerprint, DbClusterSpec, OwnerKey};

fn spec(nodes: i32) -> DbClusterSpec {
    DbClusterSpec { nodes, image: "db:4.1".into(), config: serde_json::Value::Null }
}

fn owner() -> OwnerKey {
    OwnerKey::new("db", "dc1")
}

#[test]
fn prepare_then_commit_round_trips() {
    let store = CheckpointStore::new();
    let s = spec(3);
    let fp = spec_fingerprint(&s);

    store.prepare(&owner(), s.clone(), &fp);
    assert!(store.get(&owner()).unwrap().is_pending());
    assert!(store.commit(&owner(), &fp));

    let cp = store.get(&owner()).unwrap();
    assert!(!cp.is_pending());
    assert_eq!(cp.committed_spec.unwrap(), s);
    assert_eq!(cp.committed_fingerprint.as_deref(), Some(fp.as_str()));
}

#[test]
fn stale_commit_is_a_silent_noop() {
    let store = CheckpointStore::new();
    let old = spec(3);
    let old_fp = spec_fingerprint(&old);
    store.prepare(&owner(), old, &old_fp);

    // A newer desired state supersedes the in-flight one.
    let newer = spec(5);
    let newer_fp = spec_fingerprint(&newer);
    store.prepare(&owner(), newer.clone(), &newer_fp);

    // The old reconciliation finishes and tries to commit its fingerprint.
    assert!(!store.commit(&owner(), &old_fp));
    let cp = store.get(&owner()).unwrap();
    assert!(cp.committed_spec.is_none());
    assert!(cp.is_pending());

    // The newer one commits fine.
    assert!(store.commit(&owner(), &newer_fp));
    assert_eq!(store.last_committed(&owner()).unwrap(), newer);
}

#[test]
fn rollback_keeps_last_committed() {
    let store = CheckpointStore::new();
    let good = spec(3);
    let good_fp = spec_fingerprint(&good);
    store.prepare(&owner(), good.clone(), &good_fp);
    assert!(store.commit(&owner(), &good_fp));

    let bad = spec(9);
    let bad_fp = spec_fingerprint(&bad);
    store.prepare(&owner(), bad, &bad_fp);
    assert!(store.rollback(&owner()));

    // Repair reconciliations fall back to the last known-good config.
    let cp = store.get(&owner()).unwrap();
    assert!(!cp.is_pending());
    assert_eq!(store.last_committed(&owner()).unwrap(), good);

    // Nothing left to roll back.
    assert!(!store.rollback(&owner()));
}

#[test]
fn reprepare_while_pending_is_last_writer_wins() {
    let store = CheckpointStore::new();
    store.prepare(&owner(), spec(3), &spec_fingerprint(&spec(3)));
    store.prepare(&owner(), spec(4), &spec_fingerprint(&spec(4)));
    let cp = store.get(&owner()).unwrap();
    assert_eq!(cp.pending_spec.unwrap().nodes, 4);
}

#[test]
fn unknown_owner_is_inert() {
    let store: CheckpointStore<DbClusterSpec> = CheckpointStore::new();
    assert!(store.get(&owner()).is_none());
    assert!(!store.commit(&owner(), "deadbeef"));
    assert!(!store.rollback(&owner()));
    assert!(store.remove(&owner()).is_none());
}

#[test]
fn remove_on_teardown_drops_the_checkpoint() {
    let store = CheckpointStore::new();
    let s = spec(3);
    let fp = spec_fingerprint(&s);
    store.prepare(&owner(), s, &fp);
    store.commit(&owner(), &fp);

    assert!(store.remove(&owner()).is_some());
    assert!(store.get(&owner()).is_none());
    assert!(store.is_empty());
}
