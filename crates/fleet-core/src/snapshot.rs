//! Point-in-time copies of an agent's working directory.
//!
//! Rotation snapshots the old worker's context before destroying it so
//! its memory and scratch space survive the replacement.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::domain::error::Result;

/// Copy `<home>/agents/local/<agent_name>` to
/// `<home>/snapshots/<agent_name>-<timestamp>`.
///
/// The snapshot directory is created (and returned) even when the
/// agent has no working directory on disk, so callers always get a
/// stable path to record.
pub fn snapshot_agent_context(home: impl AsRef<Path>, agent_name: &str) -> Result<PathBuf> {
    let home = home.as_ref();
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let src = home.join("agents").join("local").join(agent_name);
    let dst = home.join("snapshots").join(format!("{agent_name}-{ts}"));

    fs::create_dir_all(&dst)?;
    if src.is_dir() {
        copy_dir_all(&src, &dst)?;
    } else {
        debug!(agent = agent_name, "no working directory to snapshot");
    }
    Ok(dst)
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
