//! Domain model for fleet orchestration.

pub mod blueprint;
pub mod deployment;
pub mod error;

pub use blueprint::{
    AgentRole, AgentSpec, BlueprintManifest, CoordinationConfig, ModelTier, ProviderKind,
    ResourceSpec,
};
pub use deployment::{AgentStatus, DeployedAgent, DeploymentStatus, TeamDeployment};
pub use error::{FleetError, Result};
