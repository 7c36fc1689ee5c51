#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quorum_core::{OwnerKey, WatchEvent, WatchedResource};
use quorum_engine::{Controller, Reconcile, Settings};
use quorum_watch::{KubeCollection, WatchEventSource};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "quorumctl", version, about = "Quorum database-cluster operator")]
struct Cli {
    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control loop for DbCluster objects
    Run {
        /// GVK key of the cluster custom resource
        #[arg(long, default_value = "quorum.io/v1/DbCluster")]
        cluster_gvk: String,
        /// GVK key of the workload rollout objects
        #[arg(long, default_value = "apps/v1/StatefulSet")]
        workload_gvk: String,
    },
    /// Watch cluster objects and print events (debugging aid)
    Watch {
        /// GVK key, e.g. "quorum.io/v1/DbCluster"
        #[arg(long, default_value = "quorum.io/v1/DbCluster")]
        gvk: String,
    },
    /// List the GVK keys the cluster serves
    Discover,
}

fn init_tracing() {
    let env = std::env::var("QUORUM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("QUORUM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid QUORUM_METRICS_ADDR; metrics disabled");
        }
    }
}

/// Placeholder reconciler: logs the request and succeeds. The real
/// convergence logic plugs in behind `Reconcile`.
struct LoggingReconciler;

#[async_trait::async_trait]
impl Reconcile for LoggingReconciler {
    async fn reconcile(&self, owner: &OwnerKey) -> Result<()> {
        info!(owner = %owner, "reconcile requested");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { cluster_gvk, workload_gvk } => {
            run(&cluster_gvk, &workload_gvk, cli.namespace.as_deref()).await
        }
        Commands::Watch { gvk } => watch(&gvk, cli.namespace.as_deref()).await,
        Commands::Discover => discover().await,
    }
}

async fn discover() -> Result<()> {
    for served in quorum_watch::discover_served().await? {
        let scope = if served.namespaced { "Namespaced" } else { "Cluster" };
        println!("{}\t{}", served.gvk_key, scope);
    }
    Ok(())
}

async fn run(cluster_gvk: &str, workload_gvk: &str, namespace: Option<&str>) -> Result<()> {
    let cluster_remote = Arc::new(KubeCollection::connect(cluster_gvk, namespace).await?);
    let workload_remote = Arc::new(KubeCollection::connect(workload_gvk, namespace).await?);

    let controller = Arc::new(Controller::new(Arc::new(LoggingReconciler), Settings::from_env()));
    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.trigger();
        }
    });

    let mut ready = controller.ready();
    let readiness = tokio::spawn(async move {
        if ready.wait_for(|r| *r).await.is_ok() {
            info!("engine ready; accepting reconciliation triggers");
        }
    });
    controller.run(cluster_remote, workload_remote).await?;
    readiness.abort();
    Ok(())
}

async fn watch(gvk: &str, namespace: Option<&str>) -> Result<()> {
    let remote = Arc::new(KubeCollection::connect(gvk, namespace).await?);
    let mut source = WatchEventSource::<quorum_core::DbCluster>::new(remote);
    loop {
        let mut session = source.open().await?;
        while let Some(ev) = session.next().await {
            match ev {
                WatchEvent::Initial { resource, resource_version } => {
                    println!("= {} @{}", resource.key(), resource_version)
                }
                WatchEvent::Added { resource, resource_version } => {
                    println!("+ {} @{}", resource.key(), resource_version)
                }
                WatchEvent::Modified { resource, resource_version } => {
                    println!("~ {} @{}", resource.key(), resource_version)
                }
                WatchEvent::Deleted { resource, resource_version } => {
                    println!("- {} @{}", resource.key(), resource_version)
                }
                WatchEvent::Error { message } => {
                    warn!(message = %message, "remote error; re-listing")
                }
            }
        }
    }
}
