use anyhow::Context;
use clap::Parser;
use ip_network::IpNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use vitals_core::config::{ServerConfig, ServerOverrides};
use vitals_core::{envelope, observability};

mod backup;
mod http;
mod repo;
mod rpc;

use backup::Backup;
use http::AppState;
use repo::Repository;

/// vitals metrics server
#[derive(Parser)]
#[command(name = "vitalsd", version, about = "vitals metrics ingestion server")]
struct Cli {
    /// Address to run the HTTP server on
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// Address of the gRPC mirror (served only when set)
    #[arg(long)]
    rpc_address: Option<String>,

    /// URL for the database connection
    #[arg(short = 'd', long)]
    database_dsn: Option<String>,

    /// Mode of running the server: dev or prod
    #[arg(short = 'm', long)]
    mode: Option<String>,

    /// Key for signing data
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Path to a .pem file with a private key
    #[arg(long = "crypto-key")]
    crypto_key: Option<String>,

    /// Path to the snapshot file
    #[arg(short = 'f', long)]
    store_file: Option<String>,

    /// Interval (in seconds) of writing to the snapshot file
    #[arg(short = 'i', long)]
    store_interval: Option<u64>,

    /// Restore from the snapshot file on startup
    #[arg(short = 'r', long, num_args = 0..=1, default_missing_value = "true")]
    restore: Option<bool>,

    /// CIDR of trusted callers, checked against X-Real-IP
    #[arg(short = 't', long)]
    trusted_subnet: Option<String>,

    /// Path to a JSON config file
    #[arg(short = 'c', long, default_value = "server_config.json")]
    config: PathBuf,
}

impl Cli {
    fn overrides(&self) -> ServerOverrides {
        ServerOverrides {
            address: self.address.clone(),
            rpc_address: self.rpc_address.clone(),
            database_dsn: self.database_dsn.clone(),
            mode: self.mode.clone(),
            key: self.key.clone(),
            crypto_key: self.crypto_key.clone(),
            store_file: self.store_file.clone(),
            store_interval: self.store_interval,
            restore: self.restore,
            trusted_subnet: self.trusted_subnet.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = ServerConfig::load(Some(&cli.config), cli.overrides())?;

    observability::init(&cfg.mode)
        .map_err(|e| anyhow::anyhow!("observability init failed: {e}"))?;
    info!(version = env!("CARGO_PKG_VERSION"), addr = %cfg.address, "vitals server starting");

    let private_key = cfg
        .crypto_key
        .as_ref()
        .map(envelope::read_private_key)
        .transpose()
        .context("reading private key failed")?;

    let trusted_subnet = cfg
        .trusted_subnet
        .as_deref()
        .map(|raw| raw.parse::<IpNetwork>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("bad trusted subnet: {e}"))?;

    let backup = Backup::new(cfg.store_file.clone(), cfg.store_interval, cfg.restore);
    let repo = Arc::new(Repository::init(cfg.database_dsn.as_deref(), backup).await);
    info!(in_memory = repo.is_in_memory(), "repository ready");
    repo.restore().await;

    let shutdown = vitals_core::shutdown::shutdown_channel();

    let state = Arc::new(AppState {
        repo: repo.clone(),
        key: cfg.key.clone(),
        private_key,
        trusted_subnet,
    });

    let mut tasks = JoinSet::new();

    {
        let addr = cfg.address.clone();
        let state = state.clone();
        let rx = shutdown.subscribe();
        tasks.spawn(async move { http::serve(&addr, state, rx).await });
    }

    if let Some(rpc_addr) = cfg.rpc_address.clone() {
        let repo = repo.clone();
        let rx = shutdown.subscribe();
        tasks.spawn(async move { rpc::serve(&rpc_addr, repo, rx).await });
    }

    {
        let repo = repo.clone();
        let rx = shutdown.subscribe();
        tasks.spawn(async move { repo.schedule_backup(rx).await });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_graceful() => info!("exit reason: {e}"),
            Ok(Err(e)) => {
                error!(error = %e, "task failed, shutting down siblings");
                let _ = shutdown.send(());
            }
            Err(e) => {
                error!(error = %e, "task panicked, shutting down siblings");
                let _ = shutdown.send(());
            }
        }
    }

    repo.close().await;
    info!("server stopped");
    Ok(())
}
