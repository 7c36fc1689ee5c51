//! Work queue with per-owner serial lanes multiplexed onto a bounded pool.
//!
//! For one owner key, tasks start in submission order and never overlap.
//! Tasks for different owners run concurrently up to the worker limit. A
//! lane with no pending work holds no resources.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, histogram};
use quorum_core::OwnerKey;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Deferred unit of reconciliation work. Built at routing time, run at
/// dequeue time, so it reads the freshest cached state when it executes.
pub type Task = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static>;

pub struct WorkItem {
    pub owner: OwnerKey,
    pub task: Task,
}

struct Lane {
    queued: VecDeque<Task>,
}

struct Inner {
    lanes: Mutex<FxHashMap<OwnerKey, Lane>>,
    permits: Semaphore,
    /// Queued tasks allowed per lane; the running task does not count.
    lane_cap: usize,
    accepting: AtomicBool,
    /// Queued plus running tasks, across all lanes.
    outstanding: AtomicUsize,
    idle: Notify,
}

const DEFAULT_LANE_CAP: usize = 1024;

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(workers: usize) -> Self {
        Self::with_lane_cap(workers, DEFAULT_LANE_CAP)
    }

    pub fn with_lane_cap(workers: usize, lane_cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(FxHashMap::default()),
                permits: Semaphore::new(workers.max(1)),
                lane_cap: lane_cap.max(1),
                accepting: AtomicBool::new(true),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Enqueue and return immediately. Returns false once draining, or when
    /// the owner's lane is at capacity (at-least-once delivery means a later
    /// event re-triggers the owner).
    pub fn submit(&self, owner: OwnerKey, task: Task) -> bool {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            counter!("queue_rejected_total", 1);
            warn!(owner = %owner, "queue draining; submission rejected");
            return false;
        }
        enum Admit {
            New,
            Queued,
            Full,
        }
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let admit = {
            let mut lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
            match lanes.get_mut(&owner) {
                Some(lane) if lane.queued.len() >= self.inner.lane_cap => Admit::Full,
                Some(lane) => {
                    // A driver is already working this lane.
                    lane.queued.push_back(task);
                    Admit::Queued
                }
                None => {
                    let mut lane = Lane { queued: VecDeque::new() };
                    lane.queued.push_back(task);
                    lanes.insert(owner.clone(), lane);
                    Admit::New
                }
            }
        };
        match admit {
            Admit::Full => {
                counter!("queue_rejected_total", 1);
                warn!(owner = %owner, cap = self.inner.lane_cap, "lane full; submission rejected");
                if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.inner.idle.notify_waiters();
                }
                false
            }
            Admit::Queued => {
                counter!("queue_submitted_total", 1);
                true
            }
            Admit::New => {
                counter!("queue_submitted_total", 1);
                self.spawn_driver(owner);
                true
            }
        }
    }

    pub fn submit_item(&self, item: WorkItem) -> bool {
        self.submit(item.owner, item.task)
    }

    /// One driver per lane: pops in FIFO order and runs one task at a time,
    /// bounded by the shared worker pool. Removes the lane when empty.
    fn spawn_driver(&self, owner: OwnerKey) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let task = {
                    let mut lanes = inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
                    match lanes.get_mut(&owner).and_then(|lane| lane.queued.pop_front()) {
                        Some(task) => task,
                        None => {
                            lanes.remove(&owner);
                            break;
                        }
                    }
                };
                // The semaphore is never closed.
                let permit = match inner.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let started = Instant::now();
                match task().await {
                    Ok(()) => counter!("queue_completed_total", 1),
                    Err(e) => {
                        // The lane keeps going; retry is the next event's job.
                        counter!("queue_failed_total", 1);
                        warn!(owner = %owner, error = %e, "task failed");
                    }
                }
                histogram!("queue_task_ms", started.elapsed().as_secs_f64() * 1000.0);
                drop(permit);
                if inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    inner.idle.notify_waiters();
                }
            }
            debug!(owner = %owner, "lane drained");
        });
    }

    /// Stop accepting submissions and wait for queued and running tasks.
    pub async fn drain(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        loop {
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drop queued (not running) tasks. Test/abort path, not the default
    /// operational shutdown.
    pub fn cancel_pending(&self) -> usize {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let mut dropped = 0usize;
        {
            let mut lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
            for lane in lanes.values_mut() {
                dropped += lane.queued.len();
                lane.queued.clear();
            }
        }
        if dropped > 0 && self.inner.outstanding.fetch_sub(dropped, Ordering::SeqCst) == dropped {
            self.inner.idle.notify_waiters();
        }
        dropped
    }

    /// Queued plus running tasks.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Lanes currently holding work (idle lanes are removed).
    pub fn lane_count(&self) -> usize {
        let lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }
}
