//! Dependency resolution: blueprint `depends_on` edges to deployment waves.

use std::collections::HashSet;

use crate::domain::blueprint::BlueprintManifest;
use crate::domain::error::{FleetError, Result};

/// Topological sort of agent specs by `depends_on`, Kahn-style.
///
/// Returns a list of waves. Agents in the same wave carry no relative
/// ordering guarantee and may deploy in parallel; wave k+1 never starts
/// before wave k fully completes. Dependency names that are not spec
/// keys in this blueprint are ignored.
///
/// Errors with [`FleetError::DependencyCycle`] naming the unresolved
/// specs when no progress can be made.
pub fn resolve_deploy_order(blueprint: &BlueprintManifest) -> Result<Vec<Vec<String>>> {
    let agent_keys: HashSet<&str> = blueprint.agents.keys().map(String::as_str).collect();
    let mut remaining: Vec<&str> = blueprint.agents.keys().map(String::as_str).collect();
    let mut resolved: HashSet<&str> = HashSet::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    let max_iterations = agent_keys.len() + 1;
    let mut iteration = 0;

    while !remaining.is_empty() {
        iteration += 1;
        if iteration > max_iterations {
            return Err(cycle_error(&remaining));
        }

        let wave: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|key| {
                blueprint.agents[*key]
                    .depends_on
                    .iter()
                    .filter(|dep| agent_keys.contains(dep.as_str()))
                    .all(|dep| resolved.contains(dep.as_str()))
            })
            .collect();

        if wave.is_empty() {
            return Err(cycle_error(&remaining));
        }

        for key in &wave {
            resolved.insert(key);
        }
        remaining.retain(|key| !resolved.contains(key));
        waves.push(wave.into_iter().map(String::from).collect());
    }

    Ok(waves)
}

fn cycle_error(remaining: &[&str]) -> FleetError {
    FleetError::DependencyCycle(remaining.iter().map(|s| s.to_string()).collect())
}
