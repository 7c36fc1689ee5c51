//! Control-loop engine wiring: watch streams feed the caches, the router
//! classifies changes into reconciliation work, and the queue serializes
//! that work per cluster.
//!
//! All dependencies are constructed and passed explicitly; there is no
//! runtime container.

#![forbid(unsafe_code)]

use quorum_core::OwnerKey;

mod controller;
mod router;

pub use controller::{Controller, Settings, ShutdownHandle};
pub use router::EventRouter;

/// The reconciliation action, supplied by the business-logic layer. The
/// engine only cares that it is triggered correctly and reports success or
/// failure.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, owner: &OwnerKey) -> anyhow::Result<()>;
}
