//! Resumable watch source for one remote object collection.
//!
//! `WatchEventSource::open` performs a full paginated listing on first use
//! (or after a remote-reported error) and then follows the incremental watch
//! from the remembered resource version. Transport timeouts end the session
//! silently; the caller re-opens and resumes without re-listing.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use metrics::counter;
use quorum_core::{WatchEvent, WatchedResource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub mod kube_remote;
pub use kube_remote::{discover_served, KubeCollection, ServedResource};

/// Failures reaching the remote collection.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Long-poll connection closed by the remote side; a normal resync
    /// trigger, never surfaced to callers as a failure.
    #[error("watch connection timed out")]
    Timeout,
    #[error("transport: {0}")]
    Transport(String),
    #[error("remote api: {0}")]
    Api(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Added,
    Modified,
    Deleted,
    /// Progress marker carrying only a resource version.
    Bookmark,
    /// The server can no longer serve the watch from this version.
    Error,
}

/// Undecoded change notification as delivered by the remote store.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub payload: serde_json::Value,
}

/// One page of a full listing. `continuation` is `Some` until the listing
/// has been fully drained.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<serde_json::Value>,
    pub resource_version: String,
    pub continuation: Option<String>,
}

pub type RawEventStream = BoxStream<'static, Result<RawEvent, RemoteError>>;

/// The two remote operations the source is built on.
#[async_trait::async_trait]
pub trait RemoteCollection: Send + Sync {
    async fn list_page(&self, continuation: Option<&str>) -> Result<ListPage, RemoteError>;
    async fn watch(&self, from_version: &str) -> Result<RawEventStream, RemoteError>;
}

/// Produces an ordered, restartable sequence of typed change events for one
/// remote collection. Holds the resume position across sessions.
pub struct WatchEventSource<T> {
    remote: Arc<dyn RemoteCollection>,
    last_version: Option<String>,
    _resource: PhantomData<fn() -> T>,
}

impl<T> WatchEventSource<T>
where
    T: WatchedResource + DeserializeOwned,
{
    pub fn new(remote: Arc<dyn RemoteCollection>) -> Self {
        Self { remote, last_version: None, _resource: PhantomData }
    }

    /// Resume position, if any. `None` means the next `open` re-lists.
    pub fn resume_version(&self) -> Option<&str> {
        self.last_version.as_deref()
    }

    /// Open a session. Lists (draining all continuation tokens) when there is
    /// no remembered version, then follows the incremental watch. Listing is
    /// complete by the time this returns; `Initial` events are buffered.
    pub async fn open(&mut self) -> Result<WatchSession<'_, T>, RemoteError> {
        let mut pending: VecDeque<WatchEvent<T>> = VecDeque::new();
        if self.last_version.is_none() {
            let mut continuation: Option<String> = None;
            loop {
                let page = self.remote.list_page(continuation.as_deref()).await?;
                for item in &page.items {
                    match serde_json::from_value::<T>(item.clone()) {
                        Ok(resource) => {
                            let resource_version = resource.resource_version().to_string();
                            pending.push_back(WatchEvent::Initial { resource, resource_version });
                        }
                        Err(e) => {
                            counter!("watch_decode_errors_total", 1);
                            warn!(error = %e, "skipping malformed item in listing");
                        }
                    }
                }
                match page.continuation {
                    Some(token) => continuation = Some(token),
                    None => {
                        self.last_version = Some(page.resource_version);
                        break;
                    }
                }
            }
            debug!(items = pending.len(), version = ?self.last_version, "initial listing complete");
        }
        let from = self.last_version.clone().unwrap_or_default();
        let stream = self.remote.watch(&from).await?;
        Ok(WatchSession { last_version: &mut self.last_version, pending, stream: Some(stream) })
    }
}

/// One open watch session. Ends silently on transport timeout (resume) and
/// after a remote `Error` event (re-list on next open).
pub struct WatchSession<'a, T> {
    last_version: &'a mut Option<String>,
    pending: VecDeque<WatchEvent<T>>,
    stream: Option<RawEventStream>,
}

impl<'a, T> WatchSession<'a, T>
where
    T: WatchedResource + DeserializeOwned,
{
    /// Number of buffered `Initial` events from the listing, if one ran.
    pub fn initial_count(&self) -> usize {
        self.pending.len()
    }

    /// Next event, or `None` when the session has ended and the caller
    /// should re-open.
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        loop {
            let stream = self.stream.as_mut()?;
            let raw = match stream.next().await {
                None => {
                    debug!("watch stream ended; session over");
                    self.stream = None;
                    return None;
                }
                Some(Err(RemoteError::Timeout)) => {
                    debug!("watch timed out; session over");
                    self.stream = None;
                    return None;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "watch transport failed; will resync");
                    counter!("watch_transport_failures_total", 1);
                    self.stream = None;
                    return None;
                }
                Some(Ok(raw)) => raw,
            };
            match raw.kind {
                RawEventKind::Bookmark => {
                    if let Some(rv) = raw_resource_version(&raw.payload) {
                        *self.last_version = Some(rv);
                    }
                }
                RawEventKind::Error => {
                    let message = raw
                        .payload
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("remote watch error")
                        .to_string();
                    counter!("watch_remote_errors_total", 1);
                    // Incremental resume is no longer trustworthy.
                    *self.last_version = None;
                    self.stream = None;
                    return Some(WatchEvent::Error { message });
                }
                kind => match serde_json::from_value::<T>(raw.payload.clone()) {
                    Ok(resource) => {
                        let resource_version = resource.resource_version().to_string();
                        *self.last_version = Some(resource_version.clone());
                        counter!("watch_events_total", 1);
                        let ev = match kind {
                            RawEventKind::Added => WatchEvent::Added { resource, resource_version },
                            RawEventKind::Modified => {
                                WatchEvent::Modified { resource, resource_version }
                            }
                            _ => WatchEvent::Deleted { resource, resource_version },
                        };
                        return Some(ev);
                    }
                    Err(e) => {
                        // Advance past the poison record when it still carries
                        // a readable version, so a resume does not replay it.
                        if let Some(rv) = raw_resource_version(&raw.payload) {
                            *self.last_version = Some(rv);
                        }
                        counter!("watch_decode_errors_total", 1);
                        warn!(error = %e, "skipping malformed watch payload");
                    }
                },
            }
        }
    }
}

fn raw_resource_version(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("metadata")?
        .get("resourceVersion")?
        .as_str()
        .map(|s| s.to_string())
}
