#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use quorum_core::{DbCluster, WatchEvent};
use quorum_watch::{
    ListPage, RawEvent, RawEventKind, RawEventStream, RemoteCollection, RemoteError,
    WatchEventSource,
};
use serde_json::json;

fn cluster_json(name: &str, rv: &str, nodes: i32) -> serde_json::Value {
    json!({
        "metadata": { "name": name, "namespace": "db", "resourceVersion": rv },
        "spec": { "nodes": nodes, "image": "db:4.1" },
        "status": { "phase": "Running", "readyNodes": nodes },
    })
}

/// Remote collection that replays scripted pages and watch batches.
struct ScriptedRemote {
    pages: Mutex<VecDeque<ListPage>>,
    batches: Mutex<VecDeque<Vec<Result<RawEvent, RemoteError>>>>,
    lists: AtomicUsize,
    watch_from: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    fn new(
        pages: Vec<ListPage>,
        batches: Vec<Vec<Result<RawEvent, RemoteError>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            batches: Mutex::new(batches.into()),
            lists: AtomicUsize::new(0),
            watch_from: Mutex::new(Vec::new()),
        })
    }

    fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn watch_versions(&self) -> Vec<String> {
        self.watch_from.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RemoteCollection for ScriptedRemote {
    async fn list_page(&self, _continuation: Option<&str>) -> Result<ListPage, RemoteError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RemoteError::Transport("no more scripted pages".into()))
    }

    async fn watch(&self, from_version: &str) -> Result<RawEventStream, RemoteError> {
        self.watch_from.lock().unwrap().push(from_version.to_string());
        let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        Ok(futures::stream::iter(batch).boxed())
    }
}

fn raw(kind: RawEventKind, payload: serde_json::Value) -> Result<RawEvent, RemoteError> {
    Ok(RawEvent { kind, payload })
}

#[tokio::test]
async fn initial_listing_drains_continuation_and_buffers_initial_events() {
    let remote = ScriptedRemote::new(
        vec![
            ListPage {
                items: vec![cluster_json("dc1", "3", 3)],
                resource_version: "3".into(),
                continuation: Some("page-2".into()),
            },
            ListPage {
                items: vec![cluster_json("dc2", "9", 5)],
                resource_version: "10".into(),
                continuation: None,
            },
        ],
        vec![vec![]],
    );
    let mut source = WatchEventSource::<DbCluster>::new(remote.clone());
    let mut session = source.open().await.unwrap();
    assert_eq!(session.initial_count(), 2);

    match session.next().await.unwrap() {
        WatchEvent::Initial { resource, .. } => assert_eq!(resource.meta.name, "dc1"),
        other => panic!("expected Initial, got {:?}", other),
    }
    match session.next().await.unwrap() {
        WatchEvent::Initial { resource, .. } => assert_eq!(resource.meta.name, "dc2"),
        other => panic!("expected Initial, got {:?}", other),
    }
    assert!(session.next().await.is_none());
    drop(session);

    // The final page's listing version is the resume point.
    assert_eq!(source.resume_version(), Some("10"));
    assert_eq!(remote.list_calls(), 2);
    assert_eq!(remote.watch_versions(), vec!["10".to_string()]);
}

#[tokio::test]
async fn reopen_resumes_from_last_delivered_version_without_listing() {
    let remote = ScriptedRemote::new(
        vec![ListPage {
            items: vec![cluster_json("dc1", "10", 3)],
            resource_version: "10".into(),
            continuation: None,
        }],
        vec![
            vec![
                raw(RawEventKind::Modified, cluster_json("dc1", "11", 4)),
                Err(RemoteError::Timeout),
            ],
            vec![],
        ],
    );
    let mut source = WatchEventSource::<DbCluster>::new(remote.clone());
    let mut session = source.open().await.unwrap();
    assert!(matches!(session.next().await, Some(WatchEvent::Initial { .. })));
    assert!(matches!(session.next().await, Some(WatchEvent::Modified { .. })));
    // Timeout ends the session silently.
    assert!(session.next().await.is_none());
    drop(session);

    let session = source.open().await.unwrap();
    assert_eq!(session.initial_count(), 0);
    drop(session);
    assert_eq!(remote.list_calls(), 1);
    assert_eq!(remote.watch_versions(), vec!["10".to_string(), "11".to_string()]);
}

#[tokio::test]
async fn remote_error_surfaces_once_and_forces_relist() {
    let remote = ScriptedRemote::new(
        vec![
            ListPage {
                items: vec![cluster_json("dc1", "10", 3)],
                resource_version: "10".into(),
                continuation: None,
            },
            ListPage {
                items: vec![cluster_json("dc1", "21", 3)],
                resource_version: "21".into(),
                continuation: None,
            },
        ],
        vec![
            vec![raw(
                RawEventKind::Error,
                json!({ "message": "too old resource version", "code": 410 }),
            )],
            vec![],
        ],
    );
    let mut source = WatchEventSource::<DbCluster>::new(remote.clone());
    let mut session = source.open().await.unwrap();
    assert!(matches!(session.next().await, Some(WatchEvent::Initial { .. })));
    match session.next().await.unwrap() {
        WatchEvent::Error { message } => assert!(message.contains("too old")),
        other => panic!("expected Error, got {:?}", other),
    }
    assert!(session.next().await.is_none());
    drop(session);
    assert_eq!(source.resume_version(), None);

    // Next open cannot trust incremental resume and lists again.
    let mut session = source.open().await.unwrap();
    assert_eq!(session.initial_count(), 1);
    assert!(matches!(session.next().await, Some(WatchEvent::Initial { .. })));
    drop(session);
    assert_eq!(remote.list_calls(), 2);
    assert_eq!(source.resume_version(), Some("21"));
}

#[tokio::test]
async fn malformed_payload_is_skipped_and_version_advances() {
    let poison = json!({
        "metadata": { "name": "dc1", "namespace": "db", "resourceVersion": "12" },
        "spec": { "nodes": "three", "image": 42 },
    });
    let remote = ScriptedRemote::new(
        vec![ListPage {
            items: vec![cluster_json("dc1", "10", 3)],
            resource_version: "10".into(),
            continuation: None,
        }],
        vec![vec![
            raw(RawEventKind::Modified, poison),
            raw(RawEventKind::Modified, cluster_json("dc1", "13", 4)),
        ]],
    );
    let mut source = WatchEventSource::<DbCluster>::new(remote.clone());
    let mut session = source.open().await.unwrap();
    assert!(matches!(session.next().await, Some(WatchEvent::Initial { .. })));
    // The poison record is skipped; the next good event comes through.
    match session.next().await.unwrap() {
        WatchEvent::Modified { resource, resource_version } => {
            assert_eq!(resource.spec.nodes, 4);
            assert_eq!(resource_version, "13");
        }
        other => panic!("expected Modified, got {:?}", other),
    }
    assert!(session.next().await.is_none());
    drop(session);
    assert_eq!(source.resume_version(), Some("13"));
}

#[tokio::test]
async fn bookmark_advances_version_without_emitting() {
    let remote = ScriptedRemote::new(
        vec![ListPage { items: vec![], resource_version: "5".into(), continuation: None }],
        vec![vec![raw(
            RawEventKind::Bookmark,
            json!({ "metadata": { "resourceVersion": "8" } }),
        )]],
    );
    let mut source = WatchEventSource::<DbCluster>::new(remote.clone());
    let mut session = source.open().await.unwrap();
    assert!(session.next().await.is_none());
    drop(session);
    assert_eq!(source.resume_version(), Some("8"));
}
