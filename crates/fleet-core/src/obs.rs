//! Structured observability hooks for deployment lifecycle events.
//!
//! Provides a deployment-scoped span guard plus emission helpers for
//! the events operators alert on: deploys, remediation actions, and
//! monitor passes. Everything goes through `tracing` at `info!` level
//! except escalations, which are warnings.

use tracing::{info, warn};

/// RAII guard that enters a deployment-scoped tracing span.
pub struct DeploymentSpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploymentSpan {
    /// Create and enter a span tagged with the deployment id.
    pub fn enter(deployment_id: &str) -> Self {
        let span = tracing::info_span!("fleet.deployment", deployment_id = %deployment_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: deployment started for a blueprint.
pub fn emit_deploy_started(deployment_id: &str, blueprint: &str, agents: usize, dry_run: bool) {
    info!(
        event = "deploy.started",
        deployment_id = %deployment_id,
        blueprint = %blueprint,
        agents = agents,
        dry_run = dry_run,
    );
}

/// Emit event: deployment finished with its aggregate status.
pub fn emit_deploy_finished(deployment_id: &str, status: &dyn std::fmt::Display, failed: usize) {
    info!(
        event = "deploy.finished",
        deployment_id = %deployment_id,
        status = %status,
        failed_agents = failed,
    );
}

/// Emit event: one agent restarted by remediation.
pub fn emit_agent_restarted(deployment_id: &str, agent_name: &str, ok: bool) {
    info!(
        event = "agent.restarted",
        deployment_id = %deployment_id,
        agent_name = %agent_name,
        ok = ok,
    );
}

/// Emit event: one agent rotated (snapshot, destroy, redeploy).
pub fn emit_agent_rotated(deployment_id: &str, agent_name: &str, snapshot: &str) {
    info!(
        event = "agent.rotated",
        deployment_id = %deployment_id,
        agent_name = %agent_name,
        snapshot = %snapshot,
    );
}

/// Emit event: a monitor pass completed.
pub fn emit_monitor_pass(checked: usize, healthy: usize, degraded: usize, restarts: usize) {
    info!(
        event = "monitor.pass",
        deployments_checked = checked,
        agents_healthy = healthy,
        agents_degraded = degraded,
        restarts_triggered = restarts,
    );
}

/// Emit event: deployment escalated to a human operator (warning level).
pub fn emit_escalation(deployment_id: &str, message: &str) {
    warn!(
        event = "deployment.escalated",
        deployment_id = %deployment_id,
        message = %message,
    );
}
