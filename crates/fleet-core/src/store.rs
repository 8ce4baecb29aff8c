//! Persisted deployment records: one JSON document per deployment.
//!
//! The record file is the single source of truth shared by the engine,
//! remediation ops, and the monitor. Writes go through a temp file in
//! the same directory followed by an atomic rename, so external tooling
//! reading the file never observes a partial record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::domain::deployment::TeamDeployment;
use crate::domain::error::Result;

/// Filesystem-backed store of [`TeamDeployment`] records.
///
/// Layout: `<root>/<deployment_id>.json`.
pub struct DeploymentStore {
    dir: PathBuf,
}

impl DeploymentStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, deployment_id: &str) -> PathBuf {
        self.dir.join(format!("{deployment_id}.json"))
    }

    /// Persist a deployment record (whole-file, atomic rename).
    pub fn save(&self, deployment: &TeamDeployment) -> Result<PathBuf> {
        let path = self.record_path(&deployment.deployment_id);
        let json = serde_json::to_vec_pretty(deployment)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(path)
    }

    /// Load one deployment by id. `Ok(None)` if the record is absent.
    pub fn load(&self, deployment_id: &str) -> Result<Option<TeamDeployment>> {
        let path = self.record_path(deployment_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// List every stored deployment, sorted by filename.
    ///
    /// Corrupt or unreadable records are skipped with a warning; a bad
    /// file never makes listing fatal.
    pub fn list(&self) -> Result<Vec<TeamDeployment>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut deployments = Vec::new();
        for path in paths {
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
            {
                Ok(deployment) => deployments.push(deployment),
                Err(err) => warn!(file = %path.display(), %err, "skipping unreadable deployment record"),
            }
        }
        Ok(deployments)
    }

    /// Delete one deployment record. Returns whether a record existed.
    pub fn delete(&self, deployment_id: &str) -> Result<bool> {
        let path = self.record_path(deployment_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
