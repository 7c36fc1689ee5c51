//! Kube-backed `RemoteCollection` for an arbitrary GVK key.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::json;
use tracing::{debug, info};

use crate::{ListPage, RawEvent, RawEventKind, RawEventStream, RemoteCollection, RemoteError};

/// One namespaced (or cluster-scoped) collection behind the Kubernetes API.
pub struct KubeCollection {
    api: Api<DynamicObject>,
    gvk_key: String,
    page_limit: u32,
    watch_timeout_secs: u32,
}

impl KubeCollection {
    /// Resolve a GVK key (e.g. "quorum.io/v1/DbCluster" or "v1/ConfigMap")
    /// via discovery and bind to the given namespace, or all namespaces.
    pub async fn connect(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
                None => Api::all_with(client.clone(), &ar),
            }
        } else {
            Api::all_with(client.clone(), &ar)
        };
        let page_limit = env_parse("QUORUM_LIST_PAGE", 500);
        let watch_timeout_secs = env_parse("QUORUM_WATCH_TIMEOUT_SECS", 290);
        info!(gvk = %gvk_key, ns = ?namespace, "remote collection bound");
        Ok(Self { api, gvk_key: gvk_key.to_string(), page_limit, watch_timeout_secs })
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }
}

#[async_trait::async_trait]
impl RemoteCollection for KubeCollection {
    async fn list_page(&self, continuation: Option<&str>) -> Result<ListPage, RemoteError> {
        let mut lp = ListParams::default().limit(self.page_limit);
        if let Some(token) = continuation {
            lp = lp.continue_token(token);
        }
        let list = self.api.list(&lp).await.map_err(map_kube_err)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let continuation = list.metadata.continue_.clone().filter(|t| !t.is_empty());
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            let mut v = serde_json::to_value(obj)
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            strip_managed_fields(&mut v);
            items.push(v);
        }
        debug!(gvk = %self.gvk_key, items = items.len(), more = continuation.is_some(), "listed page");
        Ok(ListPage { items, resource_version, continuation })
    }

    async fn watch(&self, from_version: &str) -> Result<RawEventStream, RemoteError> {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.api.watch(&wp, from_version).await.map_err(map_kube_err)?;
        debug!(gvk = %self.gvk_key, from = %from_version, "watch opened");
        let mapped = stream.map(|item| match item {
            Ok(kube::core::WatchEvent::Added(o)) => raw_event(RawEventKind::Added, &o),
            Ok(kube::core::WatchEvent::Modified(o)) => raw_event(RawEventKind::Modified, &o),
            Ok(kube::core::WatchEvent::Deleted(o)) => raw_event(RawEventKind::Deleted, &o),
            Ok(kube::core::WatchEvent::Bookmark(b)) => Ok(RawEvent {
                kind: RawEventKind::Bookmark,
                payload: json!({ "metadata": { "resourceVersion": b.metadata.resource_version } }),
            }),
            Ok(kube::core::WatchEvent::Error(e)) => Ok(RawEvent {
                kind: RawEventKind::Error,
                payload: json!({ "message": e.message, "code": e.code, "reason": e.reason }),
            }),
            Err(e) => Err(map_kube_err(e)),
        });
        Ok(mapped.boxed())
    }
}

fn raw_event(kind: RawEventKind, obj: &DynamicObject) -> Result<RawEvent, RemoteError> {
    let mut payload =
        serde_json::to_value(obj).map_err(|e| RemoteError::Transport(e.to_string()))?;
    strip_managed_fields(&mut payload);
    Ok(RawEvent { kind, payload })
}

fn map_kube_err(e: kube::Error) -> RemoteError {
    match e {
        kube::Error::Api(ae) => RemoteError::Api(ae.message),
        other => {
            let msg = other.to_string();
            if msg.contains("timed out") {
                RemoteError::Timeout
            } else {
                RemoteError::Transport(msg)
            }
        }
    }
}

/// One kind the cluster currently serves, as reported by discovery.
#[derive(Debug, Clone)]
pub struct ServedResource {
    pub gvk_key: String,
    pub namespaced: bool,
}

/// Enumerate every served GVK, sorted by key. Debugging aid for picking the
/// `--cluster-gvk` / `--workload-gvk` values.
pub async fn discover_served() -> Result<Vec<ServedResource>> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(ServedResource {
                gvk_key: gvk_key_of(&ar),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.gvk_key.cmp(&b.gvk_key));
    Ok(out)
}

fn gvk_key_of(ar: &kube::core::ApiResource) -> String {
    if ar.group.is_empty() {
        format!("{}/{}", ar.version, ar.kind)
    } else {
        format!("{}/{}/{}", ar.group, ar.version, ar.kind)
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
