//! Provider backend contract.
//!
//! Every execution backend (local process, container engine, cloud VM)
//! implements [`ProviderBackend`]. The engine, remediation ops, and
//! monitor only ever talk to this trait; backend-specific mechanics stay
//! behind it. In-memory fakes for testing live in the `fakes` module.
//!
//! Call sites must treat every method as fallible and potentially slow:
//! wrap calls in [`with_timeout`] and absorb failures into the affected
//! agent's record rather than aborting bulk operations.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::blueprint::{AgentSpec, ProviderKind};
use crate::domain::deployment::AgentStatus;

pub mod fakes;
pub mod local;

pub use local::LocalProcessProvider;

/// Errors produced by provider backends.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Default bound applied to every provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque backend handle returned by `provision` and threaded through
/// every later lifecycle call.
///
/// Well-known keys are typed fields; anything backend-specific beyond
/// them goes into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionHandle {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProvisionHandle {
    pub fn localhost() -> Self {
        Self {
            host: Some("localhost".to_string()),
            ..Self::default()
        }
    }

    /// Attach a backend-specific extra field.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Uniform lifecycle contract every execution backend implements.
///
/// Contract notes:
/// - `provision` must be safe to call again for the same name
///   (idempotent creation or replace-stale).
/// - `stop` and `destroy` must succeed when the target is already
///   stopped / already gone.
/// - any method may fail for backend-specific reasons; callers must not
///   let one failure abort a bulk operation.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Which provider family this backend belongs to.
    fn kind(&self) -> ProviderKind;

    /// Allocate resources for one agent and return its backend handle.
    async fn provision(
        &self,
        agent_name: &str,
        spec: &AgentSpec,
        team_name: &str,
    ) -> ProviderResult<ProvisionHandle>;

    /// Configure an agent after provisioning.
    async fn configure(
        &self,
        agent_name: &str,
        spec: &AgentSpec,
        handle: &ProvisionHandle,
    ) -> ProviderResult<()>;

    /// Start the agent process/container.
    async fn start(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()>;

    /// Stop a running agent. No-op if already stopped.
    async fn stop(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()>;

    /// Destroy agent infrastructure entirely. No-op if already gone.
    async fn destroy(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()>;

    /// Check the current health of a deployed agent.
    async fn health_check(
        &self,
        agent_name: &str,
        handle: &ProvisionHandle,
    ) -> ProviderResult<AgentStatus>;
}

/// Bound a provider call: backend I/O may block on subprocesses or the
/// network, and the long-running loops above must never hang on it.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}
