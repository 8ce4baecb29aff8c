//! Autonomous health monitor with a graduated remediation ladder.
//!
//! Each pass probes every stored deployment and walks unhealthy agents
//! up the ladder: restart while attempts remain, rotate once when
//! restarts are exhausted (the replacement instance starts with a
//! full restart budget), and escalate the whole deployment to a
//! human when too large a fraction of the team is down. Healthy agents
//! decay their incident history, so a recovered agent starts the
//! ladder from the bottom next time.
//!
//! A monitor pass never returns an error: backend and store problems
//! are logged and the pass moves on, because a monitor that dies on
//! the first broken deployment protects nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::deployment::AgentStatus;
use crate::domain::error::Result;
use crate::obs;
use crate::ops::{AgentHealthRow, RemediationOps};

/// Tunables for one monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// A RUNNING agent whose heartbeat is older than this is treated
    /// as unhealthy.
    pub heartbeat_timeout: Duration,
    /// Restarts tried before the ladder moves on to rotation.
    pub max_restart_attempts: u32,
    /// Unhealthy fraction at or above which the deployment escalates.
    pub critical_threshold: f64,
    /// Minimum spacing between escalations for one deployment.
    pub escalation_cooldown: Duration,
    pub auto_restart: bool,
    pub auto_rotate: bool,
    pub auto_escalate: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(120),
            max_restart_attempts: 3,
            critical_threshold: 0.5,
            escalation_cooldown: Duration::from_secs(300),
            auto_restart: true,
            auto_rotate: true,
            auto_escalate: true,
        }
    }
}

/// Remediation history for one agent instance.
#[derive(Debug, Clone, Default)]
struct AgentIncident {
    restart_attempts: u32,
    rotated: bool,
}

/// Aggregate numbers from one monitor pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MonitorReport {
    pub timestamp: Option<DateTime<Utc>>,
    pub deployments_checked: usize,
    pub agents_healthy: usize,
    pub agents_degraded: usize,
    pub restarts_triggered: usize,
    pub rotations_triggered: usize,
    pub escalations_sent: usize,
}

/// Destination for critical-deployment notifications.
///
/// A sink failure falls back to a log warning; the monitor never loses
/// an escalation silently.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn send(&self, deployment_id: &str, message: &str) -> Result<()>;
}

/// Cancels a [`HealthMonitor::run`] loop from another task.
///
/// A stop request is sticky and is honored even when it arrives
/// before the loop starts.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct HealthMonitor {
    ops: Arc<RemediationOps>,
    config: MonitorConfig,
    incidents: HashMap<String, AgentIncident>,
    last_escalation: HashMap<String, Instant>,
    sink: Option<Arc<dyn EscalationSink>>,
    stopped: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(ops: Arc<RemediationOps>, config: MonitorConfig) -> Self {
        Self {
            ops,
            config,
            incidents: HashMap::new(),
            last_escalation: HashMap::new(),
            sink: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stopped))
    }

    fn is_unhealthy(&self, row: &AgentHealthRow) -> bool {
        match row.status {
            AgentStatus::Failed | AgentStatus::Degraded | AgentStatus::Stopped => true,
            AgentStatus::Running => match row.last_heartbeat {
                Some(ts) => {
                    let age = Utc::now().signed_duration_since(ts);
                    // negative age is clock skew, treat as fresh
                    age.to_std().map_or(false, |age| age > self.config.heartbeat_timeout)
                }
                None => true,
            },
            // agents still coming up are left alone
            AgentStatus::Pending | AgentStatus::Provisioning | AgentStatus::Configuring => false,
        }
    }

    /// Probe one deployment and apply the remediation ladder.
    pub async fn check_deployment(&mut self, deployment_id: &str, report: &mut MonitorReport) {
        let rows = match self.ops.health_report(deployment_id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(deployment_id, %err, "health report failed, skipping");
                return;
            }
        };
        report.deployments_checked += 1;
        if rows.is_empty() {
            return;
        }

        let mut unhealthy = 0usize;
        for row in &rows {
            let key = format!("{deployment_id}/{}", row.name);
            if !self.is_unhealthy(row) {
                report.agents_healthy += 1;
                // recovery clears the ladder
                self.incidents.remove(&key);
                continue;
            }
            report.agents_degraded += 1;
            unhealthy += 1;

            let incident = self.incidents.entry(key).or_default();
            if incident.restart_attempts >= self.config.max_restart_attempts {
                if self.config.auto_rotate && !incident.rotated {
                    incident.rotated = true;
                    // the fresh instance gets a full restart budget
                    incident.restart_attempts = 0;
                    report.rotations_triggered += 1;
                    if let Err(err) = self.ops.rotate_agent(deployment_id, &row.name).await {
                        warn!(agent = %row.name, %err, "rotation failed");
                    }
                }
                // restarts exhausted, leave the rest to escalation
                continue;
            }

            if self.config.auto_restart {
                incident.restart_attempts += 1;
                report.restarts_triggered += 1;
                match self.ops.restart_agent(deployment_id, Some(&row.name)).await {
                    Ok(outcomes) => {
                        if outcomes.get(&row.name).map(String::as_str) == Some("restarted") {
                            if let Some(incident) = self.incidents.get_mut(&format!(
                                "{deployment_id}/{}",
                                row.name
                            )) {
                                incident.restart_attempts = 0;
                            }
                        }
                    }
                    Err(err) => warn!(agent = %row.name, %err, "restart failed"),
                }
            }
        }

        let fraction = unhealthy as f64 / rows.len() as f64;
        if self.config.auto_escalate && fraction >= self.config.critical_threshold {
            self.escalate(deployment_id, unhealthy, rows.len(), report)
                .await;
        }
    }

    /// Notify the sink about a critical deployment, respecting the
    /// per-deployment cooldown. The cooldown advances even when the
    /// sink fails, so a broken sink cannot cause an alert storm.
    async fn escalate(
        &mut self,
        deployment_id: &str,
        unhealthy: usize,
        total: usize,
        report: &mut MonitorReport,
    ) {
        if let Some(last) = self.last_escalation.get(deployment_id) {
            if last.elapsed() < self.config.escalation_cooldown {
                debug!(deployment_id, "escalation suppressed by cooldown");
                return;
            }
        }
        self.last_escalation
            .insert(deployment_id.to_string(), Instant::now());

        let message =
            format!("deployment critical: {unhealthy}/{total} agents unhealthy");
        report.escalations_sent += 1;
        match &self.sink {
            Some(sink) => {
                if let Err(err) = sink.send(deployment_id, &message).await {
                    warn!(deployment_id, %err, "escalation sink failed");
                    obs::emit_escalation(deployment_id, &message);
                }
            }
            None => obs::emit_escalation(deployment_id, &message),
        }
    }

    /// One pass over every stored deployment.
    pub async fn check_all(&mut self) -> MonitorReport {
        let mut report = MonitorReport {
            timestamp: Some(Utc::now()),
            ..MonitorReport::default()
        };
        let deployments = match self.ops.engine().list_deployments() {
            Ok(deployments) => deployments,
            Err(err) => {
                warn!(%err, "listing deployments failed, empty pass");
                Vec::new()
            }
        };
        for deployment in deployments {
            self.check_deployment(&deployment.deployment_id, &mut report)
                .await;
        }
        obs::emit_monitor_pass(
            report.deployments_checked,
            report.agents_healthy,
            report.agents_degraded,
            report.restarts_triggered,
        );
        report
    }

    /// Run monitor passes every `interval` until a stop is requested
    /// or `max_iterations` passes have completed.
    pub async fn run(&mut self, interval: Duration, max_iterations: Option<u64>) {
        info!(interval_secs = interval.as_secs(), "monitor loop started");
        let mut iterations = 0u64;
        while !self.stopped.load(Ordering::SeqCst) {
            self.check_all().await;
            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            tokio::time::sleep(interval).await;
        }
        info!(iterations, "monitor loop stopped");
    }
}
