//! Operator-driven remediation against a live deployment.

use std::sync::Arc;

use fleet_core::provider::fakes::FakeProvider;
use fleet_core::{
    AgentStatus, BlueprintManifest, DeploymentEngine, FleetError, RemediationOps,
};

const BLUEPRINT: &str = r#"
name: Pipeline Crew
slug: pipeline
agents:
  lead:
    role: manager
  worker:
    count: 2
    depends_on: [lead]
"#;

async fn fleet(fake: Arc<FakeProvider>) -> (tempfile::TempDir, Arc<RemediationOps>, String) {
    let home = tempfile::tempdir().unwrap();
    let engine = Arc::new(DeploymentEngine::new(home.path(), Some(fake)).unwrap());
    let manifest = BlueprintManifest::from_yaml(BLUEPRINT).unwrap();
    let deployment = engine.deploy(&manifest, None, None).await.unwrap();
    let ops = Arc::new(RemediationOps::new(engine).unwrap());
    (home, ops, deployment.deployment_id)
}

#[tokio::test]
async fn test_restart_all_reports_every_agent() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake).await;

    let outcomes = ops.restart_agent(&id, None).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.values().all(|o| o == "restarted"));
}

#[tokio::test]
async fn test_failed_restart_recorded_not_raised() {
    let fake = Arc::new(FakeProvider::new());
    fake.fail_on("start", "pipeline-worker-1");
    let (_home, ops, id) = fleet(fake).await;

    let outcomes = ops.restart_agent(&id, None).await.unwrap();
    assert_eq!(outcomes["pipeline-lead"], "restarted");
    assert!(outcomes["pipeline-worker-1"].starts_with("error: "));

    let deployment = ops.engine().get_deployment(&id).unwrap().unwrap();
    assert_eq!(
        deployment.agents["pipeline-worker-1"].status,
        AgentStatus::Failed
    );
}

#[tokio::test]
async fn test_scale_round_trip_keeps_names_contiguous() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake).await;

    let up = ops.scale_agent(&id, "worker", 4).await.unwrap();
    assert_eq!(up.added, vec!["pipeline-worker-3", "pipeline-worker-4"]);

    let down = ops.scale_agent(&id, "worker", 2).await.unwrap();
    assert_eq!(down.removed, vec!["pipeline-worker-3", "pipeline-worker-4"]);
    assert_eq!(down.current_count, 2);

    // scaling back up reuses the freed numbers
    let again = ops.scale_agent(&id, "worker", 3).await.unwrap();
    assert_eq!(again.added, vec!["pipeline-worker-3"]);
}

#[tokio::test]
async fn test_operations_on_missing_targets() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake).await;

    assert!(matches!(
        ops.restart_agent("ghost", None).await.unwrap_err(),
        FleetError::DeploymentNotFound(_)
    ));
    assert!(matches!(
        ops.rotate_agent(&id, "pipeline-ghost").await.unwrap_err(),
        FleetError::AgentNotFound { .. }
    ));
    assert!(matches!(
        ops.scale_agent(&id, "ghost", 2).await.unwrap_err(),
        FleetError::Validation(_)
    ));
}

#[tokio::test]
async fn test_rotate_preserves_name_and_position() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake.clone()).await;

    let outcome = ops.rotate_agent(&id, "pipeline-worker-1").await.unwrap();
    assert!(outcome.destroyed);
    assert!(outcome.redeployed);

    let deployment = ops.engine().get_deployment(&id).unwrap().unwrap();
    let names: Vec<&str> = deployment.agents.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec!["pipeline-lead", "pipeline-worker-1", "pipeline-worker-2"]
    );
}

#[tokio::test]
async fn test_health_report_updates_stored_statuses() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake.clone()).await;
    fake.set_health("pipeline-worker-2", AgentStatus::Degraded);

    let rows = ops.health_report(&id).await.unwrap();
    let degraded: Vec<&str> = rows
        .iter()
        .filter(|r| !r.healthy)
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(degraded, vec!["pipeline-worker-2"]);

    let deployment = ops.engine().get_deployment(&id).unwrap().unwrap();
    assert_eq!(
        deployment.agents["pipeline-worker-2"].status,
        AgentStatus::Degraded
    );
    assert_eq!(
        deployment.status,
        fleet_core::DeploymentStatus::Degraded
    );
}

#[tokio::test]
async fn test_audit_trail_reaches_logs() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake).await;
    ops.restart_agent(&id, Some("pipeline-lead")).await.unwrap();
    ops.scale_agent(&id, "worker", 3).await.unwrap();

    let logs = ops.get_logs(&id, Some("pipeline-lead"), 20).await.unwrap();
    let lines = &logs["pipeline-lead"];
    // the restart targeted the lead, the scale applies deployment-wide
    assert!(lines.iter().any(|l| l.contains("restart")));
    assert!(lines.iter().any(|l| l.contains("scale")));
}

#[tokio::test]
async fn test_same_deployment_ops_serialize() {
    let fake = Arc::new(FakeProvider::new());
    let (_home, ops, id) = fleet(fake).await;

    // concurrent mutations must not lose updates to the record
    let a = {
        let ops = Arc::clone(&ops);
        let id = id.clone();
        tokio::spawn(async move { ops.scale_agent(&id, "worker", 5).await })
    };
    let b = {
        let ops = Arc::clone(&ops);
        let id = id.clone();
        tokio::spawn(async move { ops.restart_agent(&id, None).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let deployment = ops.engine().get_deployment(&id).unwrap().unwrap();
    assert_eq!(deployment.agents.len(), 6);
}
