//! Remediation operations against live deployments.
//!
//! Five operator verbs: restart, scale, rotate, health report, and
//! log retrieval. Every mutating operation follows the same shape:
//! take the per-deployment lock, load the record, act through the
//! provider, refresh the aggregate status, persist, audit.
//!
//! Provider failures are absorbed into the affected agent's state;
//! only missing deployments/agents and invalid arguments surface as
//! errors to the caller.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::domain::blueprint::AgentSpec;
use crate::domain::deployment::{AgentStatus, DeployedAgent, TeamDeployment};
use crate::domain::error::{FleetError, Result};
use crate::engine::DeploymentEngine;
use crate::obs;
use crate::provider::with_timeout;
use crate::snapshot::snapshot_agent_context;

/// Result of a scale operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScaleOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub current_count: usize,
}

/// Result of rotating one agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RotateOutcome {
    pub snapshot_path: PathBuf,
    pub destroyed: bool,
    pub redeployed: bool,
}

/// One row of a deployment health report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentHealthRow {
    pub name: String,
    pub status: AgentStatus,
    pub host: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub healthy: bool,
}

pub struct RemediationOps {
    engine: Arc<DeploymentEngine>,
    home: PathBuf,
    audit: AuditLog,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RemediationOps {
    pub fn new(engine: Arc<DeploymentEngine>) -> Result<Self> {
        let home = engine.home().to_path_buf();
        let audit = AuditLog::open(&home)?;
        Ok(Self {
            engine,
            home,
            audit,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &Arc<DeploymentEngine> {
        &self.engine
    }

    /// Serialise operations on one deployment. Different deployments
    /// proceed concurrently.
    async fn lock(&self, deployment_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(deployment_id.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    fn load(&self, deployment_id: &str) -> Result<TeamDeployment> {
        self.engine
            .store()
            .load(deployment_id)?
            .ok_or_else(|| FleetError::DeploymentNotFound(deployment_id.to_string()))
    }

    fn require_agent(deployment: &TeamDeployment, agent_name: &str) -> Result<()> {
        if deployment.agents.contains_key(agent_name) {
            Ok(())
        } else {
            Err(FleetError::AgentNotFound {
                deployment: deployment.deployment_id.clone(),
                agent: agent_name.to_string(),
            })
        }
    }

    /// Restart one agent, or every agent when `agent_name` is `None`.
    ///
    /// Returns one outcome per targeted agent: `"restarted"` or
    /// `"error: <cause>"`. A failing agent never blocks the others.
    pub async fn restart_agent(
        &self,
        deployment_id: &str,
        agent_name: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock(deployment_id).await;
        let mut deployment = self.load(deployment_id)?;
        if let Some(name) = agent_name {
            Self::require_agent(&deployment, name)?;
        }

        let targets: Vec<String> = match agent_name {
            Some(name) => vec![name.to_string()],
            None => deployment.agents.keys().cloned().collect(),
        };

        let mut outcomes = BTreeMap::new();
        for name in &targets {
            let Some(agent) = deployment.agents.get_mut(name) else {
                continue;
            };
            let outcome = match self.engine.provider() {
                Some(provider) => {
                    let limit = self.engine.provider_timeout();
                    let handle = agent.handle();
                    let result = async {
                        with_timeout(limit, provider.stop(name, &handle)).await?;
                        with_timeout(limit, provider.start(name, &handle)).await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            agent.mark_running();
                            "restarted".to_string()
                        }
                        Err(err) => {
                            agent.mark_failed(err.to_string());
                            format!("error: {err}")
                        }
                    }
                }
                None => {
                    // a planned agent stays planned in dry runs
                    if agent.status != AgentStatus::Pending {
                        agent.mark_running();
                    }
                    "restarted".to_string()
                }
            };
            obs::emit_agent_restarted(deployment_id, name, outcome == "restarted");
            outcomes.insert(name.clone(), outcome);
        }

        deployment.refresh_status();
        self.engine.store().save(&deployment)?;
        self.audit.write(
            "restart",
            deployment_id,
            json!({
                "agent_name": agent_name.unwrap_or("ALL"),
                "results": &outcomes,
            }),
        )?;
        Ok(outcomes)
    }

    /// Scale one agent spec to exactly `count` instances.
    ///
    /// Scale-down stops and destroys the lexicographically highest
    /// instance names; scale-up provisions fresh instances numbered
    /// after the current count.
    pub async fn scale_agent(
        &self,
        deployment_id: &str,
        spec_key: &str,
        count: usize,
    ) -> Result<ScaleOutcome> {
        if count < 1 {
            return Err(FleetError::Validation(
                "count must be at least 1; use destroy to remove a deployment".to_string(),
            ));
        }
        let _guard = self.lock(deployment_id).await;
        let mut deployment = self.load(deployment_id)?;

        let mut current = deployment.instances_of(spec_key);
        if current.is_empty() {
            return Err(FleetError::Validation(format!(
                "deployment '{deployment_id}' has no agents of spec '{spec_key}'"
            )));
        }
        current.sort();

        let mut added = Vec::new();
        let mut removed = Vec::new();

        if count < current.len() {
            for name in current.split_off(count) {
                if let Some(agent) = deployment.agents.get(&name) {
                    self.teardown_instance(agent).await;
                }
                deployment.agents.shift_remove(&name);
                removed.push(name);
            }
        } else if count > current.len() {
            let spec = AgentSpec::placeholder();
            let slug = deployment.blueprint_slug.clone();
            let team_name = deployment.team_name.clone();
            for n in current.len() + 1..=count {
                let name = format!("{slug}-{spec_key}-{n}");
                let mut agent = DeployedAgent::new(
                    name.clone(),
                    deployment_id,
                    spec_key,
                    deployment.provider,
                );
                if self.engine.is_dry_run() {
                    agent.host = Some("localhost".to_string());
                } else {
                    self.engine
                        .provision_instance(&mut agent, &spec, &team_name)
                        .await;
                }
                deployment.insert_agent(agent);
                added.push(name);
            }
        }

        let current_count = deployment.instances_of(spec_key).len();
        deployment.refresh_status();
        self.engine.store().save(&deployment)?;
        self.audit.write(
            "scale",
            deployment_id,
            json!({
                "spec_key": spec_key,
                "added": &added,
                "removed": &removed,
                "current_count": current_count,
            }),
        )?;
        info!(spec_key, added = added.len(), removed = removed.len(), "scale applied");
        Ok(ScaleOutcome {
            added,
            removed,
            current_count,
        })
    }

    /// Replace one agent with a fresh instance of the same name.
    ///
    /// The old instance's working directory is snapshotted first so
    /// its accumulated context survives the swap.
    pub async fn rotate_agent(
        &self,
        deployment_id: &str,
        agent_name: &str,
    ) -> Result<RotateOutcome> {
        let _guard = self.lock(deployment_id).await;
        let mut deployment = self.load(deployment_id)?;
        Self::require_agent(&deployment, agent_name)?;

        let snapshot_path = snapshot_agent_context(&self.home, agent_name)?;

        let mut destroyed = true;
        if let Some(provider) = self.engine.provider() {
            let handle = deployment.agents[agent_name].handle();
            if let Err(err) = with_timeout(
                self.engine.provider_timeout(),
                provider.destroy(agent_name, &handle),
            )
            .await
            {
                warn!(agent = agent_name, %err, "destroy during rotation failed");
                destroyed = false;
            }
        }

        let spec_key = deployment.agents[agent_name].agent_spec_key.clone();
        let team_name = deployment.team_name.clone();
        let mut replacement =
            DeployedAgent::new(agent_name, deployment_id, spec_key, deployment.provider);
        if self.engine.is_dry_run() {
            replacement.host = Some("localhost".to_string());
            replacement.mark_running();
        } else {
            self.engine
                .provision_instance(&mut replacement, &AgentSpec::placeholder(), &team_name)
                .await;
        }
        let redeployed = replacement.status == AgentStatus::Running;
        deployment.insert_agent(replacement);

        deployment.refresh_status();
        self.engine.store().save(&deployment)?;
        self.audit.write(
            "rotate",
            deployment_id,
            json!({
                "agent_name": agent_name,
                "snapshot": snapshot_path.display().to_string(),
                "destroyed": destroyed,
                "redeployed": redeployed,
            }),
        )?;
        obs::emit_agent_rotated(
            deployment_id,
            agent_name,
            &snapshot_path.display().to_string(),
        );
        Ok(RotateOutcome {
            snapshot_path,
            destroyed,
            redeployed,
        })
    }

    /// Probe every agent and report per-agent health.
    ///
    /// Backend check failures mark the agent DEGRADED with the cause;
    /// the report itself never fails once the deployment is found.
    /// Fresh heartbeats are recorded for agents confirmed RUNNING.
    pub async fn health_report(&self, deployment_id: &str) -> Result<Vec<AgentHealthRow>> {
        let _guard = self.lock(deployment_id).await;
        let mut deployment = self.load(deployment_id)?;

        if let Some(provider) = self.engine.provider() {
            let limit = self.engine.provider_timeout();
            for agent in deployment.agents.values_mut() {
                let name = agent.name.clone();
                let handle = agent.handle();
                let check = with_timeout(limit, provider.health_check(&name, &handle)).await;
                match check {
                    Ok(status) => {
                        agent.status = status;
                        if status == AgentStatus::Running {
                            agent.last_heartbeat = Some(Utc::now());
                            agent.error = None;
                        }
                    }
                    Err(err) => {
                        agent.status = AgentStatus::Degraded;
                        agent.error = Some(err.to_string());
                    }
                }
            }
        }

        let rows = deployment
            .agents
            .values()
            .map(|agent| AgentHealthRow {
                name: agent.name.clone(),
                status: agent.status,
                host: agent.host.clone(),
                last_heartbeat: agent.last_heartbeat,
                error: agent.error.clone(),
                healthy: agent.status == AgentStatus::Running,
            })
            .collect();

        deployment.refresh_status();
        self.engine.store().save(&deployment)?;
        Ok(rows)
    }

    /// Tail each agent's process log, falling back to its audit trail
    /// when no log file exists (dry runs, remote providers).
    pub async fn get_logs(
        &self,
        deployment_id: &str,
        agent_name: Option<&str>,
        tail: usize,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let deployment = self.load(deployment_id)?;
        if let Some(name) = agent_name {
            Self::require_agent(&deployment, name)?;
        }

        let targets: Vec<String> = match agent_name {
            Some(name) => vec![name.to_string()],
            None => deployment.agents.keys().cloned().collect(),
        };

        let mut logs = BTreeMap::new();
        for name in targets {
            let log_path = self
                .home
                .join("agents")
                .join("local")
                .join(&name)
                .join("agent.log");
            let lines = if log_path.is_file() {
                let text = fs::read_to_string(&log_path)?;
                let all: Vec<&str> = text.lines().collect();
                let skip = all.len().saturating_sub(tail);
                all[skip..].iter().map(|s| s.to_string()).collect()
            } else {
                self.audit.lines_for_agent(deployment_id, &name, tail)?
            };
            logs.insert(name, lines);
        }
        Ok(logs)
    }

    /// Stop and destroy one instance, logging failures.
    async fn teardown_instance(&self, agent: &DeployedAgent) {
        let Some(provider) = self.engine.provider() else {
            return;
        };
        let limit = self.engine.provider_timeout();
        let handle = agent.handle();
        if let Err(err) = with_timeout(limit, provider.stop(&agent.name, &handle)).await {
            warn!(agent = %agent.name, %err, "stop during scale-down failed");
        }
        if let Err(err) = with_timeout(limit, provider.destroy(&agent.name, &handle)).await {
            warn!(agent = %agent.name, %err, "destroy during scale-down failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::blueprint::BlueprintManifest;
    use crate::provider::fakes::FakeProvider;
    use crate::provider::ProviderBackend;

    const TEAM_YAML: &str = r#"
name: Crew
slug: crew
agents:
  lead:
    role: manager
  worker:
    count: 3
    depends_on: [lead]
"#;

    async fn deployed(
        provider: Option<Arc<dyn ProviderBackend>>,
    ) -> (tempfile::TempDir, Arc<RemediationOps>, String) {
        let home = tempfile::tempdir().unwrap();
        let engine = Arc::new(DeploymentEngine::new(home.path(), provider).unwrap());
        let manifest = BlueprintManifest::from_yaml(TEAM_YAML).unwrap();
        let d = engine.deploy(&manifest, None, None).await.unwrap();
        let ops = Arc::new(RemediationOps::new(engine).unwrap());
        (home, ops, d.deployment_id)
    }

    #[tokio::test]
    async fn test_restart_unknown_deployment() {
        let (_home, ops, _) = deployed(None).await;
        let err = ops.restart_agent("nope", None).await.unwrap_err();
        assert!(matches!(err, FleetError::DeploymentNotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_all_returns_entry_per_agent() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_on("start", "crew-worker-2");
        let (_home, ops, id) = deployed(Some(fake)).await;

        let outcomes = ops.restart_agent(&id, None).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes["crew-lead"], "restarted");
        assert!(outcomes["crew-worker-2"].starts_with("error: "));

        let d = ops.engine().get_deployment(&id).unwrap().unwrap();
        assert_eq!(d.agents["crew-worker-2"].status, AgentStatus::Failed);
        assert_eq!(d.agents["crew-worker-1"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_dry_run_restart_leaves_pending_agents_pending() {
        let (_home, ops, id) = deployed(None).await;

        let outcomes = ops.restart_agent(&id, None).await.unwrap();
        assert!(outcomes.values().all(|o| o == "restarted"));

        let d = ops.engine().get_deployment(&id).unwrap().unwrap();
        assert!(d
            .agents
            .values()
            .all(|a| a.status == AgentStatus::Pending && a.last_heartbeat.is_none()));
    }

    #[tokio::test]
    async fn test_restart_unknown_agent() {
        let (_home, ops, id) = deployed(None).await;
        let err = ops.restart_agent(&id, Some("crew-ghost")).await.unwrap_err();
        assert!(matches!(err, FleetError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_scale_down_removes_highest_names() {
        let fake = Arc::new(FakeProvider::new());
        let (_home, ops, id) = deployed(Some(fake.clone())).await;

        let outcome = ops.scale_agent(&id, "worker", 1).await.unwrap();
        assert_eq!(outcome.removed, vec!["crew-worker-2", "crew-worker-3"]);
        assert!(outcome.added.is_empty());
        assert_eq!(outcome.current_count, 1);

        let d = ops.engine().get_deployment(&id).unwrap().unwrap();
        assert!(d.agents.contains_key("crew-worker-1"));
        assert!(!d.agents.contains_key("crew-worker-3"));
        assert_eq!(fake.call_count("destroy"), 2);
    }

    #[tokio::test]
    async fn test_scale_up_numbers_contiguously() {
        let fake = Arc::new(FakeProvider::new());
        let (_home, ops, id) = deployed(Some(fake)).await;

        let outcome = ops.scale_agent(&id, "worker", 5).await.unwrap();
        assert_eq!(outcome.added, vec!["crew-worker-4", "crew-worker-5"]);
        assert_eq!(outcome.current_count, 5);

        let d = ops.engine().get_deployment(&id).unwrap().unwrap();
        assert_eq!(d.agents["crew-worker-5"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_scale_rejects_zero_and_unknown_spec() {
        let (_home, ops, id) = deployed(None).await;
        assert!(matches!(
            ops.scale_agent(&id, "worker", 0).await.unwrap_err(),
            FleetError::Validation(_)
        ));
        assert!(matches!(
            ops.scale_agent(&id, "ghost", 2).await.unwrap_err(),
            FleetError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_rotate_snapshots_and_replaces() {
        let fake = Arc::new(FakeProvider::new());
        let (home, ops, id) = deployed(Some(fake.clone())).await;

        // leave something behind for the snapshot
        let work = home
            .path()
            .join("agents")
            .join("local")
            .join("crew-worker-1");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("agent.log"), "old context\n").unwrap();

        let outcome = ops.rotate_agent(&id, "crew-worker-1").await.unwrap();
        assert!(outcome.destroyed);
        assert!(outcome.redeployed);
        assert!(outcome.snapshot_path.join("agent.log").is_file());
        assert_eq!(fake.call_count("destroy"), 1);

        let d = ops.engine().get_deployment(&id).unwrap().unwrap();
        assert_eq!(d.agents["crew-worker-1"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn test_health_report_never_aborts_on_failing_checks() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_on("health_check", "*");
        let (_home, ops, id) = deployed(Some(fake)).await;

        let rows = ops.health_report(&id).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows
            .iter()
            .all(|row| row.status == AgentStatus::Degraded && !row.healthy));
        assert!(rows.iter().all(|row| row.error.is_some()));
    }

    #[tokio::test]
    async fn test_health_report_records_heartbeats() {
        let fake = Arc::new(FakeProvider::new());
        let (_home, ops, id) = deployed(Some(fake)).await;

        let rows = ops.health_report(&id).await.unwrap();
        assert!(rows.iter().all(|row| row.healthy && row.last_heartbeat.is_some()));
    }

    #[tokio::test]
    async fn test_logs_fall_back_to_audit_trail() {
        let (_home, ops, id) = deployed(None).await;
        ops.restart_agent(&id, Some("crew-lead")).await.unwrap();

        let logs = ops.get_logs(&id, Some("crew-lead"), 10).await.unwrap();
        let lines = &logs["crew-lead"];
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("restart"));
    }

    #[tokio::test]
    async fn test_logs_read_agent_log_when_present() {
        let (home, ops, id) = deployed(None).await;
        let work = home.path().join("agents").join("local").join("crew-lead");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("agent.log"), "a\nb\nc\n").unwrap();

        let logs = ops.get_logs(&id, Some("crew-lead"), 2).await.unwrap();
        assert_eq!(logs["crew-lead"], vec!["b", "c"]);
    }
}
