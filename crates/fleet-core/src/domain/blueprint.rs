//! Blueprint manifest model — the declarative input to the engine.
//!
//! A [`BlueprintManifest`] defines a complete deployable team of agents:
//! roles, model tiers, resources, dependency edges, and coordination
//! settings. Provider-agnostic by design; the same blueprint deploys to
//! local processes, containers, or cloud VMs.
//!
//! The engine treats blueprints as read-only templates. Loading and
//! validation live here; callers hand a validated manifest to the
//! engine and never see it mutated.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::error::{FleetError, Result};

/// Model selection tiers for agent workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Fast,
    Code,
    Reason,
    Nuance,
    Local,
    Custom,
}

/// Infrastructure providers an agent team can be deployed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Local,
    Docker,
    Proxmox,
    Hetzner,
    Aws,
    Gcp,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::Local => "local",
            ProviderKind::Docker => "docker",
            ProviderKind::Proxmox => "proxmox",
            ProviderKind::Hetzner => "hetzner",
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ProviderKind::Local),
            "docker" => Ok(ProviderKind::Docker),
            "proxmox" => Ok(ProviderKind::Proxmox),
            "hetzner" => Ok(ProviderKind::Hetzner),
            "aws" => Ok(ProviderKind::Aws),
            "gcp" => Ok(ProviderKind::Gcp),
            other => Err(FleetError::Validation(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

/// Functional role of an agent within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    #[default]
    Worker,
    Researcher,
    Coder,
    Reviewer,
    Documentarian,
    Security,
    Ops,
    Custom,
}

/// Compute resources requested for one agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    /// RAM allocation, e.g. "2g" or "512m".
    pub memory: String,
    /// CPU cores.
    pub cores: u32,
    /// Disk allocation, e.g. "10g".
    pub disk: String,
    /// GPU type if needed.
    pub gpu: Option<String>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cores: 1,
            disk: "10g".to_string(),
            gpu: None,
        }
    }
}

/// Specification for one named agent inside a blueprint.
///
/// Read-only template; the engine never mutates a spec. `count` expands
/// into that many deployed instances at rollout time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub role: AgentRole,
    pub model: ModelTier,
    /// Specific model override, e.g. "kimi-k2.5".
    pub model_name: Option<String>,
    pub resources: ResourceSpec,
    pub skills: Vec<String>,
    /// Other agents (spec keys in the same blueprint) that must be
    /// running before this one deploys. Names that do not resolve to a
    /// spec key in this blueprint are ignored.
    pub depends_on: Vec<String>,
    /// Extra environment variables for the agent process.
    pub env: HashMap<String, String>,
    pub description: Option<String>,
    /// Number of instances to spawn (>= 1).
    pub count: u32,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            role: AgentRole::Worker,
            model: ModelTier::Fast,
            model_name: None,
            resources: ResourceSpec::default(),
            skills: Vec::new(),
            depends_on: Vec::new(),
            env: HashMap::new(),
            description: None,
            count: 1,
        }
    }
}

impl AgentSpec {
    /// Minimal worker spec used when an agent must be re-provisioned and
    /// the original spec is no longer available (rotation).
    pub fn placeholder() -> Self {
        Self::default()
    }
}

/// How the team coordinates internally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Spec key of the coordinating agent, if any.
    pub coordinator: Option<String>,
    /// Who to escalate critical issues to.
    pub escalation: Option<String>,
}

/// Complete definition of a deployable agent team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintManifest {
    /// Human-readable team name.
    pub name: String,
    /// Filesystem/URL-safe identifier.
    pub slug: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,

    /// Named agents in this team (key = spec key). Iteration order is
    /// the manifest's declaration order.
    pub agents: IndexMap<String, AgentSpec>,

    #[serde(default)]
    pub default_provider: ProviderKind,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl BlueprintManifest {
    /// Parse and validate a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let manifest: BlueprintManifest = serde_yaml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Validate manifest invariants: clean slug, at least one agent,
    /// instance counts >= 1.
    pub fn validate(&self) -> Result<()> {
        if !Self::slug_is_clean(&self.slug) {
            return Err(FleetError::InvalidBlueprint(format!(
                "slug must be lowercase alphanumeric with hyphens: got '{}'",
                self.slug
            )));
        }
        if self.agents.is_empty() {
            return Err(FleetError::InvalidBlueprint(
                "blueprint defines no agents".to_string(),
            ));
        }
        for (key, spec) in &self.agents {
            if spec.count < 1 {
                return Err(FleetError::InvalidBlueprint(format!(
                    "agent '{key}' has count {}, must be >= 1",
                    spec.count
                )));
            }
        }
        Ok(())
    }

    fn slug_is_clean(slug: &str) -> bool {
        let bytes = slug.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
            return false;
        }
        bytes
            .iter()
            .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    }

    /// Total number of agent instances this blueprint expands to.
    pub fn agent_count(&self) -> u32 {
        self.agents.values().map(|s| s.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
name: Research Team
slug: research-team
description: A leader/worker research pair
agents:
  leader:
    role: manager
    model: reason
  scout:
    role: researcher
    depends_on: [leader]
    count: 2
coordination:
  coordinator: leader
"#;

    #[test]
    fn test_parse_minimal_manifest() {
        let bp = BlueprintManifest::from_yaml(MINIMAL_YAML).expect("parse");
        assert_eq!(bp.slug, "research-team");
        assert_eq!(bp.agents.len(), 2);
        assert_eq!(bp.agent_count(), 3);
        assert_eq!(bp.agents["scout"].depends_on, vec!["leader"]);
        assert_eq!(bp.coordination.coordinator.as_deref(), Some("leader"));
        assert_eq!(bp.default_provider, ProviderKind::Local);
    }

    #[test]
    fn test_agents_preserve_declaration_order() {
        let bp = BlueprintManifest::from_yaml(MINIMAL_YAML).expect("parse");
        let keys: Vec<_> = bp.agents.keys().cloned().collect();
        assert_eq!(keys, vec!["leader", "scout"]);
    }

    #[test]
    fn test_dirty_slug_rejected() {
        let yaml = MINIMAL_YAML.replace("slug: research-team", "slug: Research_Team");
        let err = BlueprintManifest::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("slug"));
    }

    #[test]
    fn test_empty_agents_rejected() {
        let yaml = "name: X\nslug: x\nagents: {}\n";
        let err = BlueprintManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("no agents"));
    }

    #[test]
    fn test_zero_count_rejected() {
        let yaml = "name: X\nslug: x\nagents:\n  a:\n    count: 0\n";
        let err = BlueprintManifest::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_provider_round_trip() {
        for kind in [
            ProviderKind::Local,
            ProviderKind::Docker,
            ProviderKind::Proxmox,
            ProviderKind::Hetzner,
            ProviderKind::Aws,
            ProviderKind::Gcp,
        ] {
            let parsed: ProviderKind = kind.to_string().parse().expect("parse");
            assert_eq!(parsed, kind);
        }
        assert!("orbital".parse::<ProviderKind>().is_err());
    }
}
