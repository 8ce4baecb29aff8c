//! In-memory fake provider for tests.
//!
//! Satisfies the [`ProviderBackend`] contract without touching any real
//! backend. Failures are scriptable per method and agent, health results
//! are settable, and every call is recorded so tests can assert on
//! lifecycle sequences.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::blueprint::{AgentSpec, ProviderKind};
use crate::domain::deployment::AgentStatus;

use super::{ProviderBackend, ProviderError, ProviderResult, ProvisionHandle};

/// Scriptable in-memory provider backend.
#[derive(Debug, Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<String>>,
    // (method, agent) pairs that should fail; agent "*" matches any.
    failures: Mutex<HashSet<(String, String)>>,
    health: Mutex<HashMap<String, AgentStatus>>,
    next_pid: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    /// Make `method` fail for `agent` ("*" = every agent).
    pub fn fail_on(&self, method: &str, agent: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((method.to_string(), agent.to_string()));
    }

    /// Clear a previously scripted failure.
    pub fn heal(&self, method: &str, agent: &str) {
        self.failures
            .lock()
            .unwrap()
            .remove(&(method.to_string(), agent.to_string()));
    }

    /// Set the status returned by `health_check` for one agent.
    pub fn set_health(&self, agent: &str, status: AgentStatus) {
        self.health
            .lock()
            .unwrap()
            .insert(agent.to_string(), status);
    }

    /// Every call made so far, as `method:agent` strings in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made to one method across all agents.
    pub fn call_count(&self, method: &str) -> usize {
        let prefix = format!("{method}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, method: &str, agent: &str) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{method}:{agent}"));
        let failures = self.failures.lock().unwrap();
        if failures.contains(&(method.to_string(), agent.to_string()))
            || failures.contains(&(method.to_string(), "*".to_string()))
        {
            return Err(ProviderError::Other(format!(
                "scripted failure: {method} {agent}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderBackend for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn provision(
        &self,
        agent_name: &str,
        _spec: &AgentSpec,
        _team_name: &str,
    ) -> ProviderResult<ProvisionHandle> {
        self.record("provision", agent_name)?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(ProvisionHandle {
            host: Some("localhost".to_string()),
            pid: Some(pid),
            ..ProvisionHandle::default()
        })
    }

    async fn configure(
        &self,
        agent_name: &str,
        _spec: &AgentSpec,
        _handle: &ProvisionHandle,
    ) -> ProviderResult<()> {
        self.record("configure", agent_name)
    }

    async fn start(&self, agent_name: &str, _handle: &ProvisionHandle) -> ProviderResult<()> {
        self.record("start", agent_name)
    }

    async fn stop(&self, agent_name: &str, _handle: &ProvisionHandle) -> ProviderResult<()> {
        self.record("stop", agent_name)
    }

    async fn destroy(&self, agent_name: &str, _handle: &ProvisionHandle) -> ProviderResult<()> {
        self.record("destroy", agent_name)
    }

    async fn health_check(
        &self,
        agent_name: &str,
        _handle: &ProvisionHandle,
    ) -> ProviderResult<AgentStatus> {
        self.record("health_check", agent_name)?;
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(agent_name)
            .copied()
            .unwrap_or(AgentStatus::Running))
    }
}
