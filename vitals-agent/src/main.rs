use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use vitals_core::config::{AgentConfig, AgentOverrides};
use vitals_core::observability;
use vitals_core::store::MemoryStore;

mod collector;
mod delivery;

use collector::Collector;
use delivery::Delivery;

#[global_allocator]
static GLOBAL: collector::alloc_stats::CountingAllocator =
    collector::alloc_stats::CountingAllocator;

/// vitals metrics agent
#[derive(Parser)]
#[command(name = "vitals-agent", version, about = "vitals metrics sampling agent")]
struct Cli {
    /// Address of the server to send metrics to
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// Key for signing data in requests
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Path to a .pem file with a public key
    #[arg(long = "crypto-key")]
    crypto_key: Option<String>,

    /// Maximum concurrent report deliveries
    #[arg(short = 'l', long)]
    rate_limit: Option<u32>,

    /// Interval (in seconds) of sending metrics to the server
    #[arg(short = 'r', long)]
    report_interval: Option<u64>,

    /// Interval (in seconds) of reading metrics from the system
    #[arg(short = 'p', long)]
    poll_interval: Option<u64>,

    /// Delivery protocol: http or grpc
    #[arg(long)]
    protocol: Option<String>,

    /// Path to a JSON config file
    #[arg(short = 'c', long, default_value = "agent_config.json")]
    config: PathBuf,
}

impl Cli {
    fn overrides(&self) -> AgentOverrides {
        AgentOverrides {
            address: self.address.clone(),
            key: self.key.clone(),
            crypto_key: self.crypto_key.clone(),
            rate_limit: self.rate_limit,
            report_interval: self.report_interval,
            poll_interval: self.poll_interval,
            protocol: self.protocol.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = AgentConfig::load(Some(&cli.config), cli.overrides())?;

    observability::init("dev")
        .map_err(|e| anyhow::anyhow!("observability init failed: {e}"))?;
    info!(version = env!("CARGO_PKG_VERSION"), addr = %cfg.address, "vitals agent starting");

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone(), cfg.poll_interval);
    let delivery = Delivery::from_config(&cfg).await?;

    let shutdown = vitals_core::shutdown::shutdown_channel();

    let mut tasks = JoinSet::new();

    {
        let rx = shutdown.subscribe();
        tasks.spawn(async move { collector.run(rx).await });
    }

    {
        let store = store.clone();
        let rx = shutdown.subscribe();
        tasks.spawn(async move { delivery.run(store, rx).await });
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

    info!("agent stopped");
    Ok(())
}
