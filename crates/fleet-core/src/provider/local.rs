//! Local process provider: agents as detached worker subprocesses.
//!
//! Each agent gets a working directory under the provider's root:
//! - `config.json`        — agent identity (role, model, skills, env)
//! - `runtime.json`       — worker runtime config (written by configure)
//! - `agent.pid`          — PID of the worker process
//! - `session_state.json` — live state written on start/stop
//! - `agent.log`          — stdout/stderr of the worker
//! - `memory/`, `scratch/` — persistent and ephemeral agent storage
//!
//! Health checks read `session_state.json` first and corroborate with a
//! raw PID liveness probe (signal 0); a state file that claims running
//! over a dead PID reports DEGRADED.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::blueprint::{AgentSpec, ProviderKind};
use crate::domain::deployment::AgentStatus;

use super::{ProviderBackend, ProviderError, ProviderResult, ProvisionHandle};

const PID_FILE: &str = "agent.pid";
const STATE_FILE: &str = "session_state.json";
const CONFIG_FILE: &str = "config.json";
const RUNTIME_FILE: &str = "runtime.json";
const LOG_FILE: &str = "agent.log";

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Live state written beside the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    status: String,
    #[serde(default)]
    pid: Option<u32>,
    agent_name: String,
}

/// Deploy agents as local worker processes.
pub struct LocalProcessProvider {
    work_root: PathBuf,
    /// Worker command line; `{name}` is replaced with the agent name.
    /// Defaults to a shell loop stub that idles until SIGTERM, giving
    /// the engine a real process to manage when no worker binary is
    /// installed.
    worker_command: Vec<String>,
}

impl LocalProcessProvider {
    /// Create a provider rooting agent workdirs at `<home>/agents/local`.
    pub fn new(home: impl AsRef<Path>) -> ProviderResult<Self> {
        let work_root = home.as_ref().join("agents").join("local");
        fs::create_dir_all(&work_root)?;
        Ok(Self {
            work_root,
            worker_command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "trap 'exit 0' TERM INT; while :; do sleep 1; done".to_string(),
            ],
        })
    }

    /// Override the worker command line.
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }

    fn agent_dir(&self, agent_name: &str) -> PathBuf {
        self.work_root.join(agent_name)
    }

    fn work_dir_from(&self, agent_name: &str, handle: &ProvisionHandle) -> PathBuf {
        handle
            .extra_str("work_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.agent_dir(agent_name))
    }

    fn effective_pid(work_dir: &Path, handle: &ProvisionHandle) -> Option<u32> {
        handle.pid.or_else(|| read_pid(work_dir))
    }

    fn write_state(work_dir: &Path, state: &SessionState) {
        if !work_dir.exists() {
            return;
        }
        if let Ok(json) = serde_json::to_string_pretty(state) {
            let _ = fs::write(work_dir.join(STATE_FILE), json);
        }
    }
}

#[async_trait]
impl ProviderBackend for LocalProcessProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn provision(
        &self,
        agent_name: &str,
        spec: &AgentSpec,
        team_name: &str,
    ) -> ProviderResult<ProvisionHandle> {
        let work_dir = self.agent_dir(agent_name);
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(work_dir.join("memory"))?;
        fs::create_dir_all(work_dir.join("scratch"))?;

        let config = serde_json::json!({
            "agent_name": agent_name,
            "team_name": team_name,
            "role": spec.role,
            "model": spec.model,
            "model_name": spec.model_name,
            "skills": spec.skills,
            "env": spec.env,
        });
        fs::write(
            work_dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)
                .map_err(|e| ProviderError::Provision(e.to_string()))?,
        )?;

        info!(agent = %agent_name, dir = %work_dir.display(), "provisioned local agent");
        Ok(ProvisionHandle::localhost()
            .with_extra("work_dir", serde_json::json!(work_dir.to_string_lossy())))
    }

    async fn configure(
        &self,
        agent_name: &str,
        spec: &AgentSpec,
        handle: &ProvisionHandle,
    ) -> ProviderResult<()> {
        let work_dir = self.work_dir_from(agent_name, handle);
        if !work_dir.exists() {
            return Err(ProviderError::Provision(format!(
                "configure: missing work dir for {agent_name}"
            )));
        }
        let runtime = serde_json::json!({
            "agent_name": agent_name,
            "state_file": work_dir.join(STATE_FILE),
            "memory_dir": work_dir.join("memory"),
            "scratch_dir": work_dir.join("scratch"),
            "env": spec.env,
        });
        fs::write(
            work_dir.join(RUNTIME_FILE),
            serde_json::to_string_pretty(&runtime)
                .map_err(|e| ProviderError::Provision(e.to_string()))?,
        )?;
        debug!(agent = %agent_name, "configured local worker runtime");
        Ok(())
    }

    async fn start(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()> {
        let work_dir = self.work_dir_from(agent_name, handle);
        if !work_dir.exists() {
            return Err(ProviderError::Spawn(format!(
                "start: missing work dir for {agent_name}"
            )));
        }

        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join(LOG_FILE))?;
        let log_err = log.try_clone()?;

        let argv: Vec<String> = self
            .worker_command
            .iter()
            .map(|a| a.replace("{name}", agent_name))
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProviderError::Spawn("empty worker command".to_string()))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&work_dir)
            .env("AGENT_NAME", agent_name)
            .env("AGENT_WORK_DIR", &work_dir)
            .env("AGENT_STATE_FILE", work_dir.join(STATE_FILE))
            .stdout(log)
            .stderr(log_err)
            .process_group(0); // detach from our process group

        let child = command
            .spawn()
            .map_err(|e| ProviderError::Spawn(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ProviderError::Spawn("worker exited before pid read".to_string()))?;

        fs::write(work_dir.join(PID_FILE), pid.to_string())?;
        Self::write_state(
            &work_dir,
            &SessionState {
                status: "running".to_string(),
                pid: Some(pid),
                agent_name: agent_name.to_string(),
            },
        );

        info!(agent = %agent_name, pid, "started local worker");
        Ok(())
    }

    async fn stop(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()> {
        let work_dir = self.work_dir_from(agent_name, handle);
        let stopped_state = SessionState {
            status: "stopped".to_string(),
            pid: None,
            agent_name: agent_name.to_string(),
        };

        let Some(pid) = Self::effective_pid(&work_dir, handle) else {
            debug!(agent = %agent_name, "stop: no pid, already stopped");
            Self::write_state(&work_dir, &stopped_state);
            return Ok(());
        };
        if !pid_is_alive(pid) {
            Self::write_state(&work_dir, &stopped_state);
            return Ok(());
        }

        // SIGTERM, wait, then escalate to SIGKILL.
        send_signal(pid, libc::SIGTERM);
        if !wait_for_exit(pid, STOP_TIMEOUT).await {
            warn!(agent = %agent_name, pid, "worker ignored SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            wait_for_exit(pid, KILL_TIMEOUT).await;
        }

        let stopped = !pid_is_alive(pid);
        Self::write_state(&work_dir, &stopped_state);
        if stopped {
            info!(agent = %agent_name, pid, "stopped local worker");
            Ok(())
        } else {
            Err(ProviderError::Other(format!(
                "worker {agent_name} (pid {pid}) did not exit"
            )))
        }
    }

    async fn destroy(&self, agent_name: &str, handle: &ProvisionHandle) -> ProviderResult<()> {
        if let Err(err) = self.stop(agent_name, handle).await {
            warn!(agent = %agent_name, %err, "destroy: stop failed, removing files anyway");
        }
        let work_dir = self.work_dir_from(agent_name, handle);
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir)?;
            info!(agent = %agent_name, dir = %work_dir.display(), "destroyed agent directory");
        }
        Ok(())
    }

    async fn health_check(
        &self,
        agent_name: &str,
        handle: &ProvisionHandle,
    ) -> ProviderResult<AgentStatus> {
        let work_dir = self.work_dir_from(agent_name, handle);
        let pid = Self::effective_pid(&work_dir, handle);

        if let Some(state) = read_state(&work_dir) {
            return Ok(state_to_status(&state, pid));
        }

        // No state file: fall back to a raw PID probe.
        Ok(match pid {
            Some(pid) if pid_is_alive(pid) => AgentStatus::Running,
            _ => AgentStatus::Stopped,
        })
    }
}

fn state_to_status(state: &SessionState, pid: Option<u32>) -> AgentStatus {
    match state.status.as_str() {
        "running" | "idle" => {
            // Corroborate the claimed status against process liveness.
            let live_pid = state.pid.or(pid);
            match live_pid {
                Some(p) if !pid_is_alive(p) => AgentStatus::Degraded,
                _ => AgentStatus::Running,
            }
        }
        "stopped" => AgentStatus::Stopped,
        "error" => AgentStatus::Degraded,
        _ => AgentStatus::Degraded,
    }
}

fn read_pid(work_dir: &Path) -> Option<u32> {
    let text = fs::read_to_string(work_dir.join(PID_FILE)).ok()?;
    text.trim().parse().ok()
}

fn read_state(work_dir: &Path) -> Option<SessionState> {
    let text = fs::read_to_string(work_dir.join(STATE_FILE)).ok()?;
    serde_json::from_str(&text).ok()
}

fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    !pid_is_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_provider() -> (tempfile::TempDir, LocalProcessProvider) {
        let home = tempfile::tempdir().unwrap();
        let provider = LocalProcessProvider::new(home.path()).unwrap();
        (home, provider)
    }

    #[tokio::test]
    async fn test_provision_creates_workdir_layout() {
        let (home, provider) = make_provider();
        let spec = AgentSpec::default();
        let handle = provider
            .provision("team-a-worker-1", &spec, "team-a")
            .await
            .expect("provision");

        let dir = home.path().join("agents/local/team-a-worker-1");
        assert!(dir.join("memory").is_dir());
        assert!(dir.join("scratch").is_dir());
        assert!(dir.join(CONFIG_FILE).is_file());
        assert_eq!(handle.host.as_deref(), Some("localhost"));
        assert_eq!(handle.extra_str("work_dir"), Some(dir.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let (_home, provider) = make_provider();
        let spec = AgentSpec::default();
        provider.provision("a-1", &spec, "t").await.expect("first");
        provider.provision("a-1", &spec, "t").await.expect("second");
    }

    #[tokio::test]
    async fn test_stop_without_pid_is_noop() {
        let (_home, provider) = make_provider();
        let handle = ProvisionHandle::localhost();
        provider.stop("ghost", &handle).await.expect("no-op stop");
    }

    #[tokio::test]
    async fn test_destroy_missing_agent_is_noop() {
        let (_home, provider) = make_provider();
        let handle = ProvisionHandle::localhost();
        provider.destroy("ghost", &handle).await.expect("no-op destroy");
    }

    #[tokio::test]
    async fn test_health_check_without_state_reports_stopped() {
        let (_home, provider) = make_provider();
        let spec = AgentSpec::default();
        let handle = provider.provision("a-1", &spec, "t").await.expect("provision");
        let status = provider.health_check("a-1", &handle).await.expect("status");
        assert_eq!(status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_home, provider) = make_provider();
        let spec = AgentSpec::default();
        let handle = provider.provision("a-1", &spec, "t").await.expect("provision");
        provider.configure("a-1", &spec, &handle).await.expect("configure");
        provider.start("a-1", &handle).await.expect("start");

        let status = provider.health_check("a-1", &handle).await.expect("status");
        assert_eq!(status, AgentStatus::Running);

        provider.stop("a-1", &handle).await.expect("stop");
        let status = provider.health_check("a-1", &handle).await.expect("status");
        assert_eq!(status, AgentStatus::Stopped);
    }

    #[test]
    fn test_state_over_dead_pid_is_degraded() {
        let state = SessionState {
            status: "running".to_string(),
            // PIDs near the kernel max are effectively never alive.
            pid: Some(u32::MAX / 2),
            agent_name: "a-1".to_string(),
        };
        assert_eq!(state_to_status(&state, None), AgentStatus::Degraded);
    }
}
