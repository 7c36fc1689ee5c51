//! Controller: owns the caches, queue, and checkpoint store, and drives the
//! two watch loops until shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quorum_cache::{Notification, ResourceCache};
use quorum_checkpoint::CheckpointStore;
use quorum_core::{DbCluster, DbClusterSpec, WatchEvent, WatchedResource, Workload};
use quorum_queue::{WorkItem, WorkQueue};
use quorum_watch::{RemoteCollection, WatchEventSource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{EventRouter, Reconcile};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker pool size shared by all lanes.
    pub workers: usize,
    /// Queued tasks allowed per owner lane before submissions are rejected.
    pub queue_cap: usize,
    /// Cap for the exponential backoff between watch re-opens.
    pub resync_backoff_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self { workers: 4, queue_cap: 1024, resync_backoff_max: Duration::from_secs(30) }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("QUORUM_WORKERS", d.workers),
            queue_cap: env_parse("QUORUM_QUEUE_CAP", d.queue_cap),
            resync_backoff_max: Duration::from_secs(env_parse(
                "QUORUM_RESYNC_BACKOFF_MAX_SECS",
                d.resync_backoff_max.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Stops the watch loops and lets the queue drain.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Flips the ready gate once every source has applied its first listing to
/// its cache.
struct ReadyGate {
    remaining: AtomicUsize,
    tx: watch::Sender<bool>,
}

impl ReadyGate {
    fn source_synced(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            info!("all initial listings applied; engine ready");
            let _ = self.tx.send(true);
        }
    }
}

pub struct Controller {
    clusters: Arc<ResourceCache<DbCluster>>,
    workloads: Arc<ResourceCache<Workload>>,
    checkpoints: Arc<CheckpointStore<DbClusterSpec>>,
    queue: WorkQueue,
    router: Arc<EventRouter>,
    settings: Settings,
    ready_rx: watch::Receiver<bool>,
    ready: Arc<ReadyGate>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconcile>, settings: Settings) -> Self {
        let clusters = Arc::new(ResourceCache::new());
        let workloads = Arc::new(ResourceCache::new());
        let checkpoints = Arc::new(CheckpointStore::new());
        let queue = WorkQueue::with_lane_cap(settings.workers, settings.queue_cap);
        let router = Arc::new(EventRouter::new(
            Arc::clone(&clusters),
            Arc::clone(&workloads),
            Arc::clone(&checkpoints),
            reconciler,
        ));
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready = Arc::new(ReadyGate { remaining: AtomicUsize::new(2), tx: ready_tx });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            clusters,
            workloads,
            checkpoints,
            queue,
            router,
            settings,
            ready_rx,
            ready,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn clusters(&self) -> Arc<ResourceCache<DbCluster>> {
        Arc::clone(&self.clusters)
    }

    pub fn workloads(&self) -> Arc<ResourceCache<Workload>> {
        Arc::clone(&self.workloads)
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore<DbClusterSpec>> {
        Arc::clone(&self.checkpoints)
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Becomes true once both initial listings have completed and watches
    /// are established; gates externally triggered work.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: Arc::clone(&self.shutdown_tx) }
    }

    /// Run both watch loops until shutdown, then drain the queue. In-flight
    /// and already-queued tasks finish; nothing new is accepted.
    pub async fn run(
        &self,
        cluster_remote: Arc<dyn RemoteCollection>,
        workload_remote: Arc<dyn RemoteCollection>,
    ) -> anyhow::Result<()> {
        let router = Arc::clone(&self.router);
        let cluster_loop = tokio::spawn(watch_loop(
            "clusters",
            cluster_remote,
            Arc::clone(&self.clusters),
            self.queue.clone(),
            move |n| router.route_cluster(n),
            Arc::clone(&self.ready),
            // Cluster routing needs no peer cache; never held back.
            None,
            self.shutdown_rx.clone(),
            self.settings.resync_backoff_max,
        ));
        let router = Arc::clone(&self.router);
        let workload_loop = tokio::spawn(watch_loop(
            "workloads",
            workload_remote,
            Arc::clone(&self.workloads),
            self.queue.clone(),
            move |n| router.route_workload(n),
            Arc::clone(&self.ready),
            // Workload routing consults the cluster cache, so it must not
            // run before the cluster listing has been applied.
            Some(self.ready_rx.clone()),
            self.shutdown_rx.clone(),
            self.settings.resync_backoff_max,
        ));

        let mut shutdown = self.shutdown_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("shutdown requested; draining queue");
        let _ = cluster_loop.await;
        let _ = workload_loop.await;
        self.queue.drain().await;
        info!("queue drained; controller stopped");
        Ok(())
    }
}

/// One watch loop: open a session, feed the cache, route notifications into
/// the queue; on session end, back off and re-open (resync).
#[allow(clippy::too_many_arguments)]
async fn watch_loop<T, F>(
    name: &'static str,
    remote: Arc<dyn RemoteCollection>,
    cache: Arc<ResourceCache<T>>,
    queue: WorkQueue,
    route: F,
    ready: Arc<ReadyGate>,
    mut gate: Option<watch::Receiver<bool>>,
    mut shutdown: watch::Receiver<bool>,
    backoff_max: Duration,
) where
    T: WatchedResource + Clone + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&Notification<T>) -> Option<WorkItem> + Send + 'static,
{
    let mut source = WatchEventSource::<T>::new(remote);
    let mut backoff = Duration::from_secs(1);
    let mut synced = false;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match source.open().await {
            Ok(mut session) => {
                backoff = Duration::from_secs(1);
                let initial = session.initial_count();
                info!(source = name, initial, "watch session open");
                // Seed the cache from the buffered listing before declaring
                // this source synced; listing events never route.
                for _ in 0..initial {
                    if let Some(ev) = session.next().await {
                        cache.apply(ev);
                    }
                }
                if !synced {
                    synced = true;
                    ready.source_synced();
                }
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!(source = name, "watch loop stopping");
                                return;
                            }
                        }
                        ev = session.next() => {
                            let Some(ev) = ev else { break };
                            if let WatchEvent::Error { message } = &ev {
                                warn!(source = name, message = %message, "remote error; will re-list");
                                continue;
                            }
                            if let Some(notification) = cache.apply(ev) {
                                if let Some(gate) = gate.as_mut() {
                                    // Routing may consult peer caches; hold
                                    // work back until every source is synced.
                                    // Returns immediately once the gate is
                                    // open.
                                    if gate.wait_for(|r| *r).await.is_err() {
                                        return;
                                    }
                                }
                                if let Some(item) = route(&notification) {
                                    queue.submit_item(item);
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(source = name, error = %e, backoff_secs = backoff.as_secs(), "failed to open watch");
            }
        }
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = (backoff * 2).min(backoff_max);
    }
    info!(source = name, "watch loop stopped");
}
