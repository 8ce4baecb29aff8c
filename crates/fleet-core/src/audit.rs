//! Append-only audit trail of remediation actions.
//!
//! Every remediation operation writes one JSON line to
//! `<home>/coordination/audit.log`. The log doubles as the fallback
//! source for `logs` queries when an agent has no process log on disk.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use crate::domain::error::Result;

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open the audit log under `home`, creating parent directories.
    pub fn open(home: impl AsRef<Path>) -> Result<Self> {
        let dir = home.as_ref().join("coordination");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("audit.log"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one audit entry. `details` keys are merged into the
    /// entry alongside the timestamp, action, and deployment id.
    pub fn write(&self, action: &str, deployment_id: &str, details: Value) -> Result<()> {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "action": action,
            "deployment_id": deployment_id,
        });
        if let (Some(obj), Value::Object(extra)) = (entry.as_object_mut(), details) {
            for (key, value) in extra {
                obj.insert(key, value);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }

    /// Audit lines that concern one agent of one deployment, newest
    /// last, at most `tail` entries.
    ///
    /// An entry matches when its `agent_name` equals the agent, is
    /// `"ALL"`, or is absent (deployment-wide actions).
    pub fn lines_for_agent(
        &self,
        deployment_id: &str,
        agent_name: &str,
        tail: usize,
    ) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut matched = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let Ok(entry) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if entry.get("deployment_id").and_then(Value::as_str) != Some(deployment_id) {
                continue;
            }
            let subject = entry.get("agent_name").and_then(Value::as_str);
            if !matches!(subject, None | Some("ALL")) && subject != Some(agent_name) {
                continue;
            }
            let ts = entry.get("ts").and_then(Value::as_str).unwrap_or("-");
            let action = entry.get("action").and_then(Value::as_str).unwrap_or("-");
            matched.push(format!("[{ts}] {action}: {entry}"));
        }

        if matched.len() > tail {
            matched.drain(..matched.len() - tail);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.write("restart", "team-1", json!({"agent_name": "team-worker"}))
            .unwrap();
        log.write("scale", "team-1", json!({"added": ["team-worker-2"]}))
            .unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "restart");
        assert_eq!(first["deployment_id"], "team-1");
        assert_eq!(first["agent_name"], "team-worker");
    }

    #[test]
    fn test_lines_for_agent_filters_and_tails() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.write("restart", "team-1", json!({"agent_name": "team-a"}))
            .unwrap();
        log.write("restart", "team-1", json!({"agent_name": "team-b"}))
            .unwrap();
        log.write("restart", "team-1", json!({"agent_name": "ALL"}))
            .unwrap();
        log.write("deploy", "team-1", json!({})).unwrap();
        log.write("restart", "other", json!({"agent_name": "team-a"}))
            .unwrap();

        let lines = log.lines_for_agent("team-1", "team-a", 50).unwrap();
        // direct match, ALL, and the deployment-wide entry
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("team-a"));

        let tailed = log.lines_for_agent("team-1", "team-a", 1).unwrap();
        assert_eq!(tailed.len(), 1);
        assert!(tailed[0].contains("deploy"));
    }

    #[test]
    fn test_missing_log_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        assert!(log.lines_for_agent("team-1", "x", 10).unwrap().is_empty());
    }
}
