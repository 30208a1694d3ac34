//! Observability infrastructure: tracing setup and the metrics exporter.
//!
//! Called once at startup by each binary before anything else runs.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `prod` mode emits JSON lines for log shipping; anything else keeps the
/// human console format. `RUST_LOG` refines the default `info` filter.
pub fn init(mode: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let registry = tracing_subscriber::registry().with(filter);

    if mode == "prod" {
        registry.with(tracing_subscriber::fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true).with_level(true)).init();
    }

    // Prometheus scrape endpoint, opt-in via environment.
    if let Ok(addr) = std::env::var("VITALS_METRICS_ADDR") {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "prometheus exporter installed");
    }

    Ok(())
}
