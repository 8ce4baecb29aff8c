//! Fleet Core Library
//!
//! Re-exports the deployment engine, remediation operations, and health
//! monitor for programmatic access to fleet functionality.

pub mod audit;
pub mod comms;
pub mod domain;
pub mod engine;
pub mod monitor;
pub mod obs;
pub mod ops;
pub mod provider;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod telemetry;

pub use domain::{
    AgentRole, AgentSpec, AgentStatus, BlueprintManifest, CoordinationConfig, DeployedAgent,
    DeploymentStatus, FleetError, ModelTier, ProviderKind, ResourceSpec, Result, TeamDeployment,
};

pub use comms::{
    bootstrap_team_channel, broadcast_to_team, receive_messages, send_to_teammate,
    MessageEnvelope, TeamChannel,
};

pub use engine::DeploymentEngine;
pub use monitor::{EscalationSink, HealthMonitor, MonitorConfig, MonitorReport, StopHandle};
pub use ops::{AgentHealthRow, RemediationOps, RotateOutcome, ScaleOutcome};
pub use provider::{
    LocalProcessProvider, ProviderBackend, ProviderError, ProviderResult, ProvisionHandle,
};
pub use resolver::resolve_deploy_order;
pub use snapshot::snapshot_agent_context;
pub use store::DeploymentStore;
pub use telemetry::init_tracing;

/// Crate version, from the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
