//! # loadcore control plane — HTTP entry point
//!
//! Wires the scheduling, telemetry, and transport cores behind the HTTP
//! surface workers call (spec.md §6). Scenario parsing, report rendering,
//! and persistence are external collaborators layered on top of this
//! binary elsewhere in the system; this binary only hosts the core.

use clap::Parser;
use loadcore::app::{build_router, AppState};
use loadcore::scheduler::{HeartbeatMonitor, HeartbeatMonitorConfig, LeaseManager, Registry};
use loadcore::telemetry::Aggregator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "loadcore", about = "Distributed load-generation harness control plane")]
struct Cli {
    /// Address to bind the control-plane HTTP server to.
    #[arg(long, env = "LOADCORE_BIND", default_value = "0.0.0.0:7878")]
    bind: SocketAddr,

    /// Heartbeat age after which a worker is declared dead.
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    /// How often the heartbeat monitor scans the registry.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Lease TTL; workers must renew before this elapses.
    #[arg(long, default_value_t = 60)]
    lease_ttl_secs: u64,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().json().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let registry = Registry::new();
    let leases = LeaseManager::new(Duration::from_secs(cli.lease_ttl_secs));
    let aggregator = Aggregator::new();

    let monitor = Arc::new(HeartbeatMonitor::new(
        registry.clone(),
        leases.clone(),
        HeartbeatMonitorConfig {
            timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            interval: Duration::from_secs(cli.heartbeat_interval_secs),
        },
    ));
    monitor.start().await;

    let state = Arc::new(AppState {
        registry,
        leases,
        aggregator,
    });

    let app = build_router(state);

    tracing::info!(bind = %cli.bind, "starting loadcore control plane");
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(listener, app).await?;

    monitor.stop().await;
    Ok(())
}
