//! Deployment runtime state: deployed agents and team deployments.
//!
//! A [`TeamDeployment`] is the single persisted source of truth for one
//! rollout of a blueprint. Its `agents` map is exclusively owned by the
//! deployment; insertion order reflects wave order, and every key equals
//! that agent's `name`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::blueprint::ProviderKind;
use crate::provider::ProvisionHandle;

/// Runtime status of one deployed agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Provisioning,
    Configuring,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Provisioning => "provisioning",
            AgentStatus::Configuring => "configuring",
            AgentStatus::Running => "running",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Aggregate status of a whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Deploying,
    Running,
    Degraded,
    Empty,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Degraded => "degraded",
            DeploymentStatus::Empty => "empty",
        };
        write!(f, "{s}")
    }
}

/// Runtime state of a single deployed agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedAgent {
    /// Unique within the deployment; equals its key in the agents map.
    pub name: String,
    /// Globally unique: `{deployment_id}/{name}`.
    pub instance_id: String,
    /// Spec key in the blueprint this instance was expanded from.
    pub agent_spec_key: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub provider: ProviderKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeployedAgent {
    pub fn new(
        name: impl Into<String>,
        deployment_id: &str,
        agent_spec_key: impl Into<String>,
        provider: ProviderKind,
    ) -> Self {
        let name = name.into();
        Self {
            instance_id: format!("{deployment_id}/{name}"),
            name,
            agent_spec_key: agent_spec_key.into(),
            status: AgentStatus::Pending,
            provider,
            host: None,
            port: None,
            pid: None,
            container_id: None,
            started_at: None,
            last_heartbeat: None,
            error: None,
        }
    }

    /// Copy backend handle fields out of a provision result.
    pub fn apply_handle(&mut self, handle: &ProvisionHandle) {
        self.host = handle.host.clone();
        self.port = handle.port;
        self.pid = handle.pid;
        self.container_id = handle.container_id.clone();
    }

    /// Rebuild a provider handle from the persisted agent record, for
    /// lifecycle calls made after the original provision result is gone.
    pub fn handle(&self) -> ProvisionHandle {
        ProvisionHandle {
            host: self.host.clone(),
            port: self.port,
            pid: self.pid,
            container_id: self.container_id.clone(),
            ..ProvisionHandle::default()
        }
    }

    /// Mark the agent running now, clearing any stale error.
    pub fn mark_running(&mut self) {
        self.status = AgentStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.last_heartbeat = Some(Utc::now());
        self.error = None;
    }

    /// Mark the agent failed with a captured error string.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Failed;
        self.error = Some(error.into());
    }
}

/// Full persisted state of a deployed team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamDeployment {
    pub deployment_id: String,
    pub blueprint_slug: String,
    pub team_name: String,
    pub provider: ProviderKind,
    /// name -> agent; insertion order reflects wave order.
    #[serde(default)]
    pub agents: IndexMap<String, DeployedAgent>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl TeamDeployment {
    pub fn new(
        deployment_id: impl Into<String>,
        blueprint_slug: impl Into<String>,
        team_name: impl Into<String>,
        provider: ProviderKind,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            blueprint_slug: blueprint_slug.into(),
            team_name: team_name.into(),
            provider,
            agents: IndexMap::new(),
            created_at: Utc::now(),
            status: DeploymentStatus::Deploying,
        }
    }

    /// Insert an agent, keyed by its name (map-key invariant).
    pub fn insert_agent(&mut self, agent: DeployedAgent) {
        self.agents.insert(agent.name.clone(), agent);
    }

    /// Recompute the aggregate status from agent states: `running` iff
    /// every agent is RUNNING or PENDING (dry-run), `empty` with no
    /// agents, otherwise `degraded`.
    pub fn refresh_status(&mut self) {
        self.status = if self.agents.is_empty() {
            DeploymentStatus::Empty
        } else if self
            .agents
            .values()
            .all(|a| matches!(a.status, AgentStatus::Running | AgentStatus::Pending))
        {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Degraded
        };
    }

    /// Instance names belonging to one spec key, in map order.
    pub fn instances_of(&self, spec_key: &str) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.agent_spec_key == spec_key)
            .map(|a| a.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, status: AgentStatus) -> DeployedAgent {
        let mut a = DeployedAgent::new(name, "team-1", "worker", ProviderKind::Local);
        a.status = status;
        a
    }

    fn deployment_with(statuses: &[(&str, AgentStatus)]) -> TeamDeployment {
        let mut d = TeamDeployment::new("team-1", "team", "Team", ProviderKind::Local);
        for (name, status) in statuses {
            d.insert_agent(agent(name, *status));
        }
        d
    }

    #[test]
    fn test_refresh_status_all_running() {
        let mut d = deployment_with(&[
            ("a", AgentStatus::Running),
            ("b", AgentStatus::Pending),
        ]);
        d.refresh_status();
        assert_eq!(d.status, DeploymentStatus::Running);
    }

    #[test]
    fn test_refresh_status_any_failure_degrades() {
        let mut d = deployment_with(&[
            ("a", AgentStatus::Running),
            ("b", AgentStatus::Failed),
        ]);
        d.refresh_status();
        assert_eq!(d.status, DeploymentStatus::Degraded);
    }

    #[test]
    fn test_refresh_status_empty() {
        let mut d = deployment_with(&[]);
        d.refresh_status();
        assert_eq!(d.status, DeploymentStatus::Empty);
    }

    #[test]
    fn test_agents_map_key_matches_name() {
        let d = deployment_with(&[("a", AgentStatus::Running)]);
        for (key, agent) in &d.agents {
            assert_eq!(key, &agent.name);
        }
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let mut d = deployment_with(&[
            ("z-last", AgentStatus::Running),
            ("a-first", AgentStatus::Running),
        ]);
        d.refresh_status();
        let json = serde_json::to_string(&d).expect("serialize");
        let back: TeamDeployment = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, d);
        // Insertion order survives the round trip.
        let keys: Vec<_> = back.agents.keys().cloned().collect();
        assert_eq!(keys, vec!["z-last", "a-first"]);
    }

    #[test]
    fn test_handle_round_trip() {
        let mut a = agent("a", AgentStatus::Running);
        a.host = Some("localhost".to_string());
        a.pid = Some(4242);
        let h = a.handle();
        assert_eq!(h.host.as_deref(), Some("localhost"));
        assert_eq!(h.pid, Some(4242));
        assert_eq!(h.container_id, None);
    }
}
