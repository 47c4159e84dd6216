use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use backend::{
    router,
    RouterState,
    SyncerRegistry,
    SyncerRegistryConfig,
};
use clap::Parser;
use cvr::CvrStore;
use tracing_subscriber::{
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
    EnvFilter,
};
use transform::{
    Permissions,
    Transformer,
};

/// The view-sync backend daemon.
#[derive(Parser, Debug)]
#[command(name = "syncd", version)]
struct Config {
    /// Path to the replicated SQLite database (read-only).
    #[arg(long, env = "SYNCD_REPLICA")]
    replica: PathBuf,

    /// Path to the CVR store database (created if absent).
    #[arg(long, env = "SYNCD_CVR", default_value = "cvr.db")]
    cvr: PathBuf,

    /// Listen address for the sync and metrics endpoints.
    #[arg(long, env = "SYNCD_LISTEN", default_value = "127.0.0.1:4848")]
    listen: SocketAddr,

    /// Path to a JSON permission policy file. No file means no row-level
    /// permission rewriting.
    #[arg(long, env = "SYNCD_PERMISSIONS")]
    permissions: Option<PathBuf>,

    /// Interval at which the replica version is polled, in milliseconds,
    /// when no replicator signal is wired in.
    #[arg(long, env = "SYNCD_POLL_INTERVAL_MS", default_value_t = 250)]
    poll_interval_ms: u64,

    /// Development mode: bypasses inspector authentication.
    #[arg(long, env = "SYNCD_DEV")]
    dev: bool,
}

fn load_permissions(path: Option<&PathBuf>) -> anyhow::Result<Permissions> {
    let Some(path) = path else {
        return Ok(Permissions::empty());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read permissions from {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid permission policy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    tracing::info!("Starting syncd with {config:?}");

    let permissions = Arc::new(load_permissions(config.permissions.as_ref())?);
    let store = Arc::new(CvrStore::new(&config.cvr)?);
    let transformer = Arc::new(Transformer::new(permissions));
    let version_rx = backend::spawn_version_poller(
        config.replica.clone(),
        Duration::from_millis(config.poll_interval_ms),
    );
    let registry = Arc::new(SyncerRegistry::new(
        SyncerRegistryConfig {
            replica_path: config.replica.clone(),
            build_version: env!("CARGO_PKG_VERSION").to_owned(),
            dev_mode: config.dev,
        },
        store,
        transformer,
        version_rx,
    ));

    let app = router(RouterState {
        registry: registry.clone(),
    });
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    };
    backend::serve(app, config.listen, shutdown).await?;
    registry.shutdown();
    Ok(())
}
