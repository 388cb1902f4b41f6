use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use csi_state::{Snapshot, StateStore};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use volume_watcher::config::WatcherConfig;
use volume_watcher::metrics;
use volume_watcher::rpc::{GrpcClaimRpc, TlsConfig};
use volume_watcher::{StateSource, Watcher};

#[derive(Parser, Debug)]
#[command(name = "volume-watcher")]
#[command(about = "Releases CSI volume claims held by terminated allocations")]
struct Args {
    /// gRPC endpoint serving node and controller detach
    #[arg(long, env = "VOLUME_CLAIMS_ENDPOINT", default_value = "http://127.0.0.1:4647")]
    rpc_endpoint: String,

    /// JSON snapshot of volumes, allocations, nodes and plugins to load
    #[arg(long, env = "STATE_SNAPSHOT_PATH")]
    state_snapshot: Option<PathBuf>,

    /// TLS client certificate file (PEM format)
    #[arg(long, env = "TLS_CERT_PATH")]
    tls_cert: Option<PathBuf>,

    /// TLS client private key file (PEM format)
    #[arg(long, env = "TLS_KEY_PATH")]
    tls_key: Option<PathBuf>,

    /// CA certificate used to verify the server
    #[arg(long, env = "TLS_CA_PATH")]
    tls_ca: Option<PathBuf>,

    /// Expected server name in the server certificate
    #[arg(long, env = "TLS_DOMAIN", default_value = "localhost")]
    tls_domain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(flatten)]
    watcher: WatcherConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    args.watcher.validate()?;

    info!(
        rpc_endpoint = %args.rpc_endpoint,
        query_limit = args.watcher.query_limit_per_sec,
        batch_ms = args.watcher.update_batch_duration.as_millis() as u64,
        "Starting volume watcher"
    );

    let store = Arc::new(StateStore::new());
    if let Some(path) = &args.state_snapshot {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read snapshot {}: {}", path.display(), e))?;
        let snapshot = Snapshot::from_json(&json)?;
        let volumes = snapshot.volumes.len();
        let index = store.restore(snapshot);
        info!(volumes, index, "Loaded state snapshot");
    } else {
        info!("No state snapshot given, starting with an empty store");
    }

    let tls = match (&args.tls_cert, &args.tls_key, &args.tls_ca) {
        (Some(cert), Some(key), Some(ca)) => {
            info!("mTLS enabled for claim RPCs");
            Some(TlsConfig {
                cert_path: cert.clone(),
                key_path: key.clone(),
                ca_path: ca.clone(),
                domain: args.tls_domain.clone(),
            })
        }
        (None, None, None) => {
            info!("TLS disabled - running in plaintext mode");
            None
        }
        _ => return Err("--tls-cert, --tls-key and --tls-ca must be given together".into()),
    };

    let rpc = GrpcClaimRpc::connect_with_tls(&args.rpc_endpoint, tls)
        .await
        .map_err(|e| format!("Failed to set up claim RPC client: {}", e))?;

    // The store loaded here is the one the watchers read, so claim updates
    // are applied to it; only the detach calls go to the endpoint
    let watcher = Watcher::with_local_store(store.clone(), Arc::new(rpc), args.watcher.clone());
    let state: Arc<dyn StateSource> = store;
    watcher.set_enabled(true, state.clone()).await;

    shutdown_signal().await;
    info!("Shutdown signal received, stopping volume watchers...");

    watcher.set_enabled(false, state).await;
    info!("volume-watcher shutdown complete");
    Ok(())
}

fn install(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install {} handler: {}", name, e);
            None
        }
    }
}

async fn recv(sig: &mut Option<Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sighup = install(SignalKind::hangup(), "SIGHUP");

    tokio::select! {
        _ = recv(&mut sigterm) => info!("Received SIGTERM"),
        _ = recv(&mut sigint) => info!("Received SIGINT"),
        _ = recv(&mut sighup) => info!("Received SIGHUP, shutting down"),
    }
}
