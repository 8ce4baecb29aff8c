//! Fleet - agent team deployment CLI
//!
//! The `fleet` command deploys blueprint-defined agent teams and keeps
//! them healthy.
//!
//! ## Commands
//!
//! - `deploy`: Bring up a team from a blueprint file
//! - `list` / `status`: Inspect stored deployments
//! - `destroy`: Tear a deployment down
//! - `restart` / `scale` / `rotate`: Manual remediation
//! - `health` / `logs`: Per-agent diagnostics
//! - `monitor`: Run the autonomous remediation loop in the foreground

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use fleet_core::{
    BlueprintManifest, DeploymentEngine, HealthMonitor, LocalProcessProvider, MonitorConfig,
    ProviderBackend, ProviderKind, RemediationOps, TeamDeployment,
};

#[derive(Parser)]
#[command(name = "fleet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent team deployment and self-healing orchestration", long_about = None)]
struct Cli {
    /// Fleet home directory (records, agent workdirs, audit log)
    #[arg(long, global = true, env = "FLEET_HOME")]
    home: Option<PathBuf>,

    /// Plan only: record agents as PENDING without touching a backend
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON command output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a team from a blueprint file
    Deploy {
        /// Path to the blueprint (YAML)
        blueprint: PathBuf,

        /// Override the team name from the blueprint
        #[arg(long)]
        name: Option<String>,

        /// Override the blueprint's default provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// List stored deployments
    List,

    /// Show one deployment's agents and statuses
    Status {
        deployment_id: String,
    },

    /// Destroy a deployment and delete its record
    Destroy {
        deployment_id: String,
    },

    /// Restart one agent, or the whole team
    Restart {
        deployment_id: String,

        /// Restart only this agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Scale an agent spec to an exact instance count
    Scale {
        deployment_id: String,

        /// Spec key from the blueprint (e.g. "worker")
        spec_key: String,

        /// Desired instance count (at least 1)
        count: usize,
    },

    /// Snapshot, destroy, and redeploy one agent
    Rotate {
        deployment_id: String,
        agent: String,
    },

    /// Probe every agent and print a health report
    Health {
        deployment_id: String,
    },

    /// Tail agent logs (audit trail when no process log exists)
    Logs {
        deployment_id: String,

        /// Only this agent
        #[arg(long)]
        agent: Option<String>,

        /// Lines per agent
        #[arg(long, default_value_t = 50)]
        tail: usize,
    },

    /// Run the health monitor loop in the foreground
    Monitor {
        /// Seconds between passes
        #[arg(long, default_value_t = 30)]
        interval: u64,

        /// Stop after this many passes
        #[arg(long)]
        max_iterations: Option<u64>,

        /// Restarts tried before rotating an agent
        #[arg(long, default_value_t = 3)]
        max_restarts: u32,
    },
}

fn fleet_home(cli: &Cli) -> Result<PathBuf> {
    if let Some(home) = &cli.home {
        return Ok(home.clone());
    }
    let base = dirs::home_dir().context("could not determine a home directory")?;
    Ok(base.join(".fleet"))
}

fn build_ops(cli: &Cli) -> Result<Arc<RemediationOps>> {
    let home = fleet_home(cli)?;
    let provider: Option<Arc<dyn ProviderBackend>> = if cli.dry_run {
        None
    } else {
        let local = LocalProcessProvider::new(&home).context("local provider setup failed")?;
        Some(Arc::new(local))
    };
    let engine = Arc::new(DeploymentEngine::new(home, provider)?);
    Ok(Arc::new(RemediationOps::new(engine)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleet_core::init_tracing(cli.json, level);

    let ops = build_ops(&cli)?;
    let json = cli.json;

    match &cli.command {
        Commands::Deploy {
            blueprint,
            name,
            provider,
        } => cmd_deploy(&ops, blueprint, name.as_deref(), provider.as_deref(), json).await,
        Commands::List => cmd_list(&ops, json),
        Commands::Status { deployment_id } => cmd_status(&ops, deployment_id, json),
        Commands::Destroy { deployment_id } => cmd_destroy(&ops, deployment_id).await,
        Commands::Restart {
            deployment_id,
            agent,
        } => cmd_restart(&ops, deployment_id, agent.as_deref(), json).await,
        Commands::Scale {
            deployment_id,
            spec_key,
            count,
        } => cmd_scale(&ops, deployment_id, spec_key, *count, json).await,
        Commands::Rotate {
            deployment_id,
            agent,
        } => cmd_rotate(&ops, deployment_id, agent, json).await,
        Commands::Health { deployment_id } => cmd_health(&ops, deployment_id, json).await,
        Commands::Logs {
            deployment_id,
            agent,
            tail,
        } => cmd_logs(&ops, deployment_id, agent.as_deref(), *tail, json).await,
        Commands::Monitor {
            interval,
            max_iterations,
            max_restarts,
        } => cmd_monitor(ops, *interval, *max_iterations, *max_restarts).await,
    }
}

fn print_deployment(deployment: &TeamDeployment) {
    println!(
        "{}  [{}]  {} ({} agents, provider: {})",
        deployment.deployment_id,
        deployment.status,
        deployment.team_name,
        deployment.agents.len(),
        deployment.provider,
    );
}

async fn cmd_deploy(
    ops: &RemediationOps,
    blueprint: &PathBuf,
    name: Option<&str>,
    provider: Option<&str>,
    json: bool,
) -> Result<()> {
    let manifest = BlueprintManifest::from_yaml_file(blueprint)
        .with_context(|| format!("failed to load blueprint {}", blueprint.display()))?;
    let provider_override = provider
        .map(|p| p.parse::<ProviderKind>())
        .transpose()
        .context("unrecognized provider")?;

    let deployment = ops.engine().deploy(&manifest, name, provider_override).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&deployment)?);
        return Ok(());
    }
    print_deployment(&deployment);
    for agent in deployment.agents.values() {
        let detail = agent
            .error
            .as_deref()
            .map(|e| format!("  ({e})"))
            .unwrap_or_default();
        println!("  {} [{}]{}", agent.name, agent.status, detail);
    }
    Ok(())
}

fn cmd_list(ops: &RemediationOps, json: bool) -> Result<()> {
    let deployments = ops.engine().list_deployments()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&deployments)?);
        return Ok(());
    }
    if deployments.is_empty() {
        println!("no deployments");
        return Ok(());
    }
    for deployment in &deployments {
        print_deployment(deployment);
    }
    Ok(())
}

fn cmd_status(ops: &RemediationOps, deployment_id: &str, json: bool) -> Result<()> {
    let deployment = ops
        .engine()
        .get_deployment(deployment_id)?
        .with_context(|| format!("deployment '{deployment_id}' not found"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&deployment)?);
        return Ok(());
    }
    print_deployment(&deployment);
    for agent in deployment.agents.values() {
        println!(
            "  {} [{}] host={} pid={}",
            agent.name,
            agent.status,
            agent.host.as_deref().unwrap_or("-"),
            agent
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

async fn cmd_destroy(ops: &RemediationOps, deployment_id: &str) -> Result<()> {
    if ops.engine().destroy_deployment(deployment_id).await? {
        println!("destroyed {deployment_id}");
    } else {
        println!("no such deployment: {deployment_id}");
    }
    Ok(())
}

async fn cmd_restart(
    ops: &RemediationOps,
    deployment_id: &str,
    agent: Option<&str>,
    json: bool,
) -> Result<()> {
    let outcomes = ops.restart_agent(deployment_id, agent).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
        return Ok(());
    }
    for (name, outcome) in &outcomes {
        println!("{name}: {outcome}");
    }
    Ok(())
}

async fn cmd_scale(
    ops: &RemediationOps,
    deployment_id: &str,
    spec_key: &str,
    count: usize,
    json: bool,
) -> Result<()> {
    let outcome = ops.scale_agent(deployment_id, spec_key, count).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    println!(
        "now {} instance(s) of '{spec_key}' (+{} / -{})",
        outcome.current_count,
        outcome.added.len(),
        outcome.removed.len(),
    );
    for name in &outcome.added {
        println!("  added   {name}");
    }
    for name in &outcome.removed {
        println!("  removed {name}");
    }
    Ok(())
}

async fn cmd_rotate(
    ops: &RemediationOps,
    deployment_id: &str,
    agent: &str,
    json: bool,
) -> Result<()> {
    let outcome = ops.rotate_agent(deployment_id, agent).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    println!(
        "rotated {agent}: destroyed={} redeployed={}",
        outcome.destroyed, outcome.redeployed,
    );
    println!("snapshot: {}", outcome.snapshot_path.display());
    Ok(())
}

async fn cmd_health(ops: &RemediationOps, deployment_id: &str, json: bool) -> Result<()> {
    let rows = ops.health_report(deployment_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in &rows {
        let mark = if row.healthy { "ok " } else { "DOWN" };
        let error = row
            .error
            .as_deref()
            .map(|e| format!("  ({e})"))
            .unwrap_or_default();
        println!("{mark} {} [{}]{}", row.name, row.status, error);
    }
    Ok(())
}

async fn cmd_logs(
    ops: &RemediationOps,
    deployment_id: &str,
    agent: Option<&str>,
    tail: usize,
    json: bool,
) -> Result<()> {
    let logs = ops.get_logs(deployment_id, agent, tail).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
        return Ok(());
    }
    for (name, lines) in &logs {
        println!("=== {name} ===");
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}

async fn cmd_monitor(
    ops: Arc<RemediationOps>,
    interval: u64,
    max_iterations: Option<u64>,
    max_restarts: u32,
) -> Result<()> {
    let config = MonitorConfig {
        max_restart_attempts: max_restarts,
        ..MonitorConfig::default()
    };
    let mut monitor = HealthMonitor::new(ops, config);
    monitor
        .run(Duration::from_secs(interval), max_iterations)
        .await;
    Ok(())
}
