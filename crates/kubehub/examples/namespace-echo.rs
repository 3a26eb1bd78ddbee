//! Minimal rudder controller: reconciles a watched kind by logging the
//! current snapshot. Defaults to namespaces; point it at any served GVK.
//!
//! ```sh
//! cargo run --example namespace-echo -- --gvk v1/Pod --ns default
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rudder_controller::{Config, Controller};
use rudder_core::{handler_fn, ClusterObject, Handler, Retriever};
use rudder_kubehub::{KubeLeaseLock, KubeObject, KubeRetriever};
use rudder_leader::{Elector, LockConfig};

#[derive(Parser, Debug)]
#[command(name = "namespace-echo", version, about = "Log-only rudder controller")]
struct Cli {
    /// GVK key to reconcile, e.g. "v1/Namespace" or "apps/v1/Deployment"
    #[arg(long = "gvk", default_value = "v1/Namespace")]
    gvk: String,

    /// Namespace to scope the watch (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,

    #[arg(long = "workers", default_value_t = 3)]
    workers: usize,

    #[arg(long = "resync-secs", default_value_t = 180)]
    resync_secs: u64,

    /// Enable leader election over a Lease in this namespace
    #[arg(long = "lease-ns")]
    lease_namespace: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await?;
    let retriever =
        KubeRetriever::for_gvk(client.clone(), &cli.gvk, cli.namespace.as_deref()).await?;

    let handler = handler_fn(
        |_ctx: CancellationToken, obj: Option<Arc<KubeObject>>| async move {
            match obj {
                Some(o) => info!(key = %o.key(), version = %o.resource_version(), "reconciled"),
                None => info!("reconciled deletion with no cached snapshot"),
            }
            Ok::<_, anyhow::Error>(())
        },
    );

    let mut cfg = Config::new(
        "namespace-echo",
        Arc::new(retriever) as Arc<dyn Retriever<KubeObject>>,
        Arc::new(handler) as Arc<dyn Handler<KubeObject>>,
    );
    cfg.concurrent_workers = cli.workers;
    cfg.resync_interval = Duration::from_secs(cli.resync_secs);
    if let Some(ns) = &cli.lease_namespace {
        let lock = KubeLeaseLock::new(client, ns, "namespace-echo");
        cfg.leader_elector = Some(Arc::new(Elector::new(
            "namespace-echo",
            lock,
            LockConfig::default(),
        )?));
    }
    let controller = Controller::new(cfg)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("signal captured, exiting");
            shutdown.cancel();
        }
    });

    controller.run(shutdown).await;
    Ok(())
}
