//! fleetd - runs the health monitor loop as a long-lived service.
//!
//! Probes every stored deployment on an interval and applies the
//! restart -> rotate -> escalate ladder. Ctrl-C stops the loop after
//! the current pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use fleet_core::{
    DeploymentEngine, HealthMonitor, LocalProcessProvider, MonitorConfig, RemediationOps,
};

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet health monitor daemon", long_about = None)]
struct Args {
    /// Fleet home directory (records, agent workdirs, audit log)
    #[arg(long, env = "FLEET_HOME")]
    home: Option<PathBuf>,

    /// Seconds between monitor passes
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Stop after this many passes (run forever when omitted)
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Restarts tried before rotating an agent
    #[arg(long, default_value_t = 3)]
    max_restarts: u32,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fleet_core::init_tracing(args.json, Level::INFO);

    let home = match &args.home {
        Some(home) => home.clone(),
        None => dirs::home_dir()
            .context("could not determine a home directory")?
            .join(".fleet"),
    };

    let provider = LocalProcessProvider::new(&home).context("local provider setup failed")?;
    let engine = Arc::new(DeploymentEngine::new(&home, Some(Arc::new(provider)))?);
    let ops = Arc::new(RemediationOps::new(engine)?);

    let config = MonitorConfig {
        max_restart_attempts: args.max_restarts,
        ..MonitorConfig::default()
    };
    let mut monitor = HealthMonitor::new(ops, config);
    let stop = monitor.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stop.stop();
        }
    });

    info!(home = %home.display(), interval = args.interval, "fleetd started");
    monitor
        .run(Duration::from_secs(args.interval), args.max_iterations)
        .await;
    Ok(())
}
