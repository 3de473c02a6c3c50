mod annotate;
mod cpuinfo;
mod metrics;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Parser)]
#[command(name = "node-exporter", about = "CPU model/frequency exporter and node annotator")]
struct Args {
    /// Address for the /metrics endpoint.
    #[arg(long, default_value = "0.0.0.0:9100")]
    metrics_addr: String,

    /// Path to a kubeconfig; in-cluster config is used when omitted.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Name of the node object to annotate. Falls back to $NODE_NAME, then
    /// the hostname.
    #[arg(long)]
    node_name: Option<String>,

    /// Annotate the node once and exit without serving metrics.
    #[arg(long)]
    annotate_only: bool,
}

async fn build_client(kubeconfig: Option<&PathBuf>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer cluster config")?,
    };
    kube::Client::try_from(config).context("failed to build cluster client")
}

fn resolve_node_name(flag: Option<String>) -> Result<String> {
    if let Some(name) = flag {
        return Ok(name);
    }
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.trim().is_empty() {
            return Ok(name.trim().to_string());
        }
    }
    let hostname = hostname::get().context("failed to read hostname")?;
    Ok(hostname.to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let node_name = resolve_node_name(args.node_name.clone())?;

    let cpuinfo_path = PathBuf::from(CPUINFO_PATH);
    let sysfs_root = PathBuf::from(SYSFS_CPU_ROOT);
    let mut inventory = cpuinfo::collect(&cpuinfo_path, &sysfs_root)?;
    info!(
        node = %node_name,
        cpus = inventory.cpus.len(),
        model = inventory.model.as_deref().unwrap_or("unknown"),
        "hardware inventory read"
    );

    let client = build_client(args.kubeconfig.as_ref()).await?;
    annotate::annotate_node(client, &node_name, &inventory).await?;

    if args.annotate_only {
        return Ok(());
    }

    metrics::publish(&node_name, &inventory.cpus);

    let cancel = CancellationToken::new();
    let refresh_cancel = cancel.clone();
    let refresh_node = node_name.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    cpuinfo::refresh_current(&sysfs_root, &mut inventory.cpus);
                    metrics::publish(&refresh_node, &inventory.cpus);
                }
            }
        }
    });

    let app = Router::new()
        .route("/metrics", get(|| async { metrics::render() }))
        .route("/healthz", get(|| async { "ok" }));
    let listener = TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    info!(addr = %args.metrics_addr, "metrics listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    cancel.cancel();
    Ok(())
}
