//! Domain-level error taxonomy for fleet orchestration.
//!
//! `NotFound` and `Validation` variants are usage errors surfaced to the
//! caller. Provider failures are absorbed at the call sites inside the
//! engine, remediation ops, and monitor (captured into the affected
//! agent's `error` field) and only appear here when a single-target
//! operation has nothing left to report.

use crate::provider::ProviderError;

/// Fleet domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("agent '{agent}' not in deployment '{deployment}'")]
    AgentNotFound { deployment: String, agent: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),

    #[error("circular dependency detected among: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blueprint parse error: {0}")]
    BlueprintParse(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fleet domain operations.
pub type Result<T> = std::result::Result<T, FleetError>;
