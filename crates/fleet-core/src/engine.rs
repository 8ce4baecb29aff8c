//! Deployment engine: turns a validated blueprint into a running team.
//!
//! Agents come up in dependency order (wave by wave) against a single
//! provider backend. A backend failure never aborts the deployment;
//! the failing agent is recorded as FAILED with its error and the
//! rollout carries on, so one bad worker cannot strand its teammates.
//!
//! With no provider attached the engine runs in dry-run mode: agents
//! are recorded as PENDING on localhost and no backend is touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::comms::bootstrap_team_channel;
use crate::domain::blueprint::{AgentRole, AgentSpec, BlueprintManifest, ProviderKind};
use crate::domain::deployment::{AgentStatus, DeployedAgent, TeamDeployment};
use crate::domain::error::Result;
use crate::obs;
use crate::provider::{with_timeout, ProviderBackend, ProviderResult, DEFAULT_PROVIDER_TIMEOUT};
use crate::resolver::resolve_deploy_order;
use crate::store::DeploymentStore;

pub struct DeploymentEngine {
    home: PathBuf,
    store: DeploymentStore,
    provider: Option<Arc<dyn ProviderBackend>>,
    comms_root: Option<PathBuf>,
    provider_timeout: Duration,
}

impl DeploymentEngine {
    /// Build an engine rooted at `home`. Records live under
    /// `<home>/deployments`, team channels under `<home>/comms`.
    pub fn new(home: impl Into<PathBuf>, provider: Option<Arc<dyn ProviderBackend>>) -> Result<Self> {
        let home = home.into();
        let store = DeploymentStore::open(home.join("deployments"))?;
        let comms_root = Some(home.join("comms"));
        Ok(Self {
            home,
            store,
            provider,
            comms_root,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        })
    }

    /// Override where team channels are created, or disable them.
    pub fn with_comms_root(mut self, comms_root: Option<PathBuf>) -> Self {
        self.comms_root = comms_root;
        self
    }

    /// Override the per-call backend timeout.
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn is_dry_run(&self) -> bool {
        self.provider.is_none()
    }

    pub(crate) fn store(&self) -> &DeploymentStore {
        &self.store
    }

    pub(crate) fn provider(&self) -> Option<&Arc<dyn ProviderBackend>> {
        self.provider.as_ref()
    }

    pub(crate) fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    /// Deploy a team from a blueprint.
    ///
    /// Instances are named `<slug>-<spec_key>` with a `-<n>` suffix
    /// (from 1) only when a spec asks for more than one copy.
    pub async fn deploy(
        &self,
        manifest: &BlueprintManifest,
        team_name: Option<&str>,
        provider_override: Option<ProviderKind>,
    ) -> Result<TeamDeployment> {
        manifest.validate()?;
        let waves = resolve_deploy_order(manifest)?;

        let deployment_id = format!("{}-{}", manifest.slug, Utc::now().timestamp());
        let _span = obs::DeploymentSpan::enter(&deployment_id);

        let provider_kind = provider_override.unwrap_or(manifest.default_provider);
        let team_name = team_name.unwrap_or(&manifest.name);
        let dry_run = self.provider.is_none();
        obs::emit_deploy_started(
            &deployment_id,
            &manifest.slug,
            manifest.agent_count() as usize,
            dry_run,
        );

        let mut deployment =
            TeamDeployment::new(&deployment_id, &manifest.slug, team_name, provider_kind);

        for wave in &waves {
            debug!(wave = ?wave, "deploying wave");
            let mut batch: Vec<(DeployedAgent, &AgentSpec)> = Vec::new();
            for spec_key in wave {
                // validate() guarantees every wave entry resolves
                let Some(spec) = manifest.agents.get(spec_key) else {
                    continue;
                };
                for n in 1..=spec.count {
                    let name = if spec.count == 1 {
                        format!("{}-{}", manifest.slug, spec_key)
                    } else {
                        format!("{}-{}-{}", manifest.slug, spec_key, n)
                    };
                    let mut agent =
                        DeployedAgent::new(name, &deployment_id, spec_key, provider_kind);
                    if dry_run {
                        agent.host = Some("localhost".to_string());
                    }
                    batch.push((agent, spec));
                }
            }
            // agents in one wave have no dependencies on each other,
            // so they come up together
            if !dry_run {
                futures::future::join_all(
                    batch
                        .iter_mut()
                        .map(|(agent, spec)| self.provision_instance(agent, *spec, team_name)),
                )
                .await;
            }
            for (agent, _) in batch {
                deployment.insert_agent(agent);
            }
        }

        deployment.refresh_status();
        self.store.save(&deployment)?;

        if let Some(comms_root) = &self.comms_root {
            if let Err(err) = self.bootstrap_comms(comms_root, manifest, &deployment) {
                warn!(%err, "team channel bootstrap failed");
            }
        }

        let failed = deployment
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Failed)
            .count();
        obs::emit_deploy_finished(&deployment_id, &deployment.status, failed);
        Ok(deployment)
    }

    /// Run the full provision/configure/start sequence for one agent,
    /// absorbing any backend error into the agent's FAILED state.
    pub(crate) async fn provision_instance(
        &self,
        agent: &mut DeployedAgent,
        spec: &AgentSpec,
        team_name: &str,
    ) {
        let Some(provider) = &self.provider else {
            agent.host = Some("localhost".to_string());
            return;
        };
        let limit = self.provider_timeout;
        agent.status = AgentStatus::Provisioning;

        let outcome: ProviderResult<()> = async {
            let handle = with_timeout(limit, provider.provision(&agent.name, spec, team_name)).await?;
            agent.apply_handle(&handle);
            agent.status = AgentStatus::Configuring;
            with_timeout(limit, provider.configure(&agent.name, spec, &handle)).await?;
            with_timeout(limit, provider.start(&agent.name, &handle)).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                agent.mark_running();
                info!(agent = %agent.name, "agent running");
            }
            Err(err) => {
                error!(agent = %agent.name, %err, "agent bring-up failed");
                agent.mark_failed(err.to_string());
            }
        }
    }

    fn bootstrap_comms(
        &self,
        comms_root: &Path,
        manifest: &BlueprintManifest,
        deployment: &TeamDeployment,
    ) -> Result<()> {
        let members: Vec<String> = deployment.agents.keys().cloned().collect();
        let coordinator = self.pick_coordinator(manifest, deployment);
        bootstrap_team_channel(
            comms_root,
            &manifest.slug,
            &members,
            coordinator.as_deref(),
        )?;
        Ok(())
    }

    /// The channel coordinator: the first instance of the blueprint's
    /// nominated coordinator spec, else the first manager-role agent.
    fn pick_coordinator(
        &self,
        manifest: &BlueprintManifest,
        deployment: &TeamDeployment,
    ) -> Option<String> {
        if let Some(key) = &manifest.coordination.coordinator {
            if let Some(name) = deployment.instances_of(key).into_iter().next() {
                return Some(name);
            }
        }
        deployment
            .agents
            .values()
            .find(|agent| {
                manifest
                    .agents
                    .get(&agent.agent_spec_key)
                    .is_some_and(|spec| spec.role == AgentRole::Manager)
            })
            .map(|agent| agent.name.clone())
    }

    /// All stored deployments, oldest record first.
    pub fn list_deployments(&self) -> Result<Vec<TeamDeployment>> {
        self.store.list()
    }

    pub fn get_deployment(&self, deployment_id: &str) -> Result<Option<TeamDeployment>> {
        self.store.load(deployment_id)
    }

    /// Tear a deployment down: best-effort destroy of every agent,
    /// then delete the record.
    ///
    /// Returns `Ok(false)` when no such deployment exists, `Ok(true)`
    /// when every backend destroy succeeded. Individual destroy
    /// failures are logged but never leave the record behind.
    pub async fn destroy_deployment(&self, deployment_id: &str) -> Result<bool> {
        let Some(deployment) = self.store.load(deployment_id)? else {
            return Ok(false);
        };
        let _span = obs::DeploymentSpan::enter(deployment_id);

        let mut all_ok = true;
        if let Some(provider) = &self.provider {
            for agent in deployment.agents.values() {
                let handle = agent.handle();
                if let Err(err) =
                    with_timeout(self.provider_timeout, provider.destroy(&agent.name, &handle))
                        .await
                {
                    warn!(agent = %agent.name, %err, "destroy failed");
                    all_ok = false;
                }
            }
        }

        self.store.delete(deployment_id)?;
        info!(clean = all_ok, "deployment destroyed");
        Ok(all_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fakes::FakeProvider;

    const TEAM_YAML: &str = r#"
name: Crew
slug: crew
agents:
  lead:
    role: manager
  worker:
    count: 2
    depends_on: [lead]
coordination:
  coordinator: lead
"#;

    fn manifest() -> BlueprintManifest {
        BlueprintManifest::from_yaml(TEAM_YAML).expect("manifest")
    }

    fn engine_with(provider: Option<Arc<dyn ProviderBackend>>) -> (tempfile::TempDir, DeploymentEngine) {
        let home = tempfile::tempdir().unwrap();
        let engine = DeploymentEngine::new(home.path(), provider).unwrap();
        (home, engine)
    }

    #[tokio::test]
    async fn test_dry_run_marks_agents_pending() {
        let (_home, engine) = engine_with(None);
        let d = engine.deploy(&manifest(), None, None).await.unwrap();

        assert_eq!(d.agents.len(), 3);
        assert!(d
            .agents
            .values()
            .all(|a| a.status == AgentStatus::Pending && a.host.as_deref() == Some("localhost")));
        assert_eq!(d.status, crate::domain::deployment::DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_deploy_names_and_order() {
        let fake = Arc::new(FakeProvider::new());
        let (_home, engine) = engine_with(Some(fake.clone()));
        let d = engine.deploy(&manifest(), None, None).await.unwrap();

        let names: Vec<&str> = d.agents.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["crew-lead", "crew-worker-1", "crew-worker-2"]);
        assert!(d.agents.values().all(|a| a.status == AgentStatus::Running));

        // lead provisioned before either worker
        let calls = fake.calls();
        let lead = calls.iter().position(|c| c == "provision:crew-lead").unwrap();
        let worker = calls
            .iter()
            .position(|c| c == "provision:crew-worker-1")
            .unwrap();
        assert!(lead < worker);
    }

    #[tokio::test]
    async fn test_backend_failure_absorbed_per_agent() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_on("start", "crew-worker-2");
        let (_home, engine) = engine_with(Some(fake));
        let d = engine.deploy(&manifest(), None, None).await.unwrap();

        let bad = &d.agents["crew-worker-2"];
        assert_eq!(bad.status, AgentStatus::Failed);
        assert!(bad.error.as_deref().unwrap().contains("scripted failure"));
        assert_eq!(d.agents["crew-lead"].status, AgentStatus::Running);
        assert_eq!(
            d.status,
            crate::domain::deployment::DeploymentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_deploy_persists_record_and_comms() {
        let (home, engine) = engine_with(None);
        let d = engine.deploy(&manifest(), Some("Night Crew"), None).await.unwrap();

        let loaded = engine.get_deployment(&d.deployment_id).unwrap().unwrap();
        assert_eq!(loaded.team_name, "Night Crew");
        assert!(home
            .path()
            .join("comms")
            .join("crew")
            .join("inbox")
            .join("crew-lead")
            .is_dir());
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let fake = Arc::new(FakeProvider::new());
        let (_home, engine) = engine_with(Some(fake.clone()));
        let d = engine.deploy(&manifest(), None, None).await.unwrap();

        assert!(engine.destroy_deployment(&d.deployment_id).await.unwrap());
        assert_eq!(fake.call_count("destroy"), 3);
        assert!(!engine.destroy_deployment(&d.deployment_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_reports_partial_failure_but_deletes_record() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_on("destroy", "crew-lead");
        let (_home, engine) = engine_with(Some(fake));
        let d = engine.deploy(&manifest(), None, None).await.unwrap();

        assert!(!engine.destroy_deployment(&d.deployment_id).await.unwrap());
        assert!(engine.get_deployment(&d.deployment_id).unwrap().is_none());
    }
}
