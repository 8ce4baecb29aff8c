//! File-based message channel shared by a deployed team.
//!
//! Each team gets a directory tree under the comms root with one inbox
//! and archive per member plus a broadcast drop for the coordinator.
//! Envelopes are JSON files written through a temp name and renamed
//! into place, so a reader never picks up a half-written message.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::error::{FleetError, Result};

const ENVELOPE_SUFFIX: &str = ".msg.json";

/// One message dropped into a teammate's inbox or the broadcast dir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    pub envelope_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub urgency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(sender: &str, recipient: &str, content: &str) -> Self {
        Self {
            envelope_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            urgency: "normal".to_string(),
            thread_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Handle on one team's communication tree.
#[derive(Debug, Clone)]
pub struct TeamChannel {
    pub team_slug: String,
    pub comms_root: PathBuf,
    pub members: Vec<String>,
    pub coordinator: Option<String>,
}

impl TeamChannel {
    pub fn team_dir(&self) -> PathBuf {
        self.comms_root.join(&self.team_slug)
    }

    pub fn inbox_for(&self, member: &str) -> PathBuf {
        self.team_dir().join("inbox").join(member)
    }

    pub fn archive_for(&self, member: &str) -> PathBuf {
        self.team_dir().join("archive").join(member)
    }

    pub fn broadcast_dir(&self) -> PathBuf {
        self.team_dir().join("broadcast")
    }

    fn is_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }
}

/// Create the directory tree for a team channel. Safe to call again
/// for an existing team; new members simply gain inboxes.
pub fn bootstrap_team_channel(
    comms_root: impl Into<PathBuf>,
    team_slug: &str,
    members: &[String],
    coordinator: Option<&str>,
) -> Result<TeamChannel> {
    let channel = TeamChannel {
        team_slug: team_slug.to_string(),
        comms_root: comms_root.into(),
        members: members.to_vec(),
        coordinator: coordinator.map(str::to_string),
    };

    fs::create_dir_all(channel.broadcast_dir())?;
    for member in members {
        fs::create_dir_all(channel.inbox_for(member))?;
        fs::create_dir_all(channel.archive_for(member))?;
    }
    debug!(team = team_slug, members = members.len(), "team channel ready");
    Ok(channel)
}

/// Drop a direct message into `recipient`'s inbox.
pub fn send_to_teammate(
    channel: &TeamChannel,
    sender: &str,
    recipient: &str,
    content: &str,
) -> Result<MessageEnvelope> {
    if !channel.is_member(recipient) {
        return Err(FleetError::Validation(format!(
            "'{recipient}' is not a member of team '{}'",
            channel.team_slug
        )));
    }
    let envelope = MessageEnvelope::new(sender, recipient, content);
    write_envelope(&channel.inbox_for(recipient), &envelope)?;
    Ok(envelope)
}

/// Coordinator-only: place one copy in the broadcast dir and one in
/// every other member's inbox.
pub fn broadcast_to_team(
    channel: &TeamChannel,
    sender: &str,
    content: &str,
) -> Result<MessageEnvelope> {
    if channel.coordinator.as_deref() != Some(sender) {
        return Err(FleetError::Validation(format!(
            "only the coordinator may broadcast to team '{}'",
            channel.team_slug
        )));
    }
    let envelope = MessageEnvelope::new(sender, "ALL", content);
    write_envelope(&channel.broadcast_dir(), &envelope)?;
    for member in &channel.members {
        if member != sender {
            write_envelope(&channel.inbox_for(member), &envelope)?;
        }
    }
    Ok(envelope)
}

/// Drain `member`'s inbox, moving each envelope to the archive.
/// Corrupt files are left behind with a warning.
pub fn receive_messages(channel: &TeamChannel, member: &str) -> Result<Vec<MessageEnvelope>> {
    let inbox = channel.inbox_for(member);
    if !inbox.is_dir() {
        return Ok(Vec::new());
    }
    let archive = channel.archive_for(member);
    fs::create_dir_all(&archive)?;

    let mut paths: Vec<PathBuf> = fs::read_dir(&inbox)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(ENVELOPE_SUFFIX))
        })
        .collect();
    paths.sort();

    let mut messages = Vec::new();
    for path in paths {
        let text = fs::read_to_string(&path)?;
        match serde_json::from_str::<MessageEnvelope>(&text) {
            Ok(envelope) => {
                if let Some(name) = path.file_name() {
                    fs::rename(&path, archive.join(name))?;
                }
                messages.push(envelope);
            }
            Err(err) => warn!(file = %path.display(), %err, "skipping corrupt envelope"),
        }
    }
    Ok(messages)
}

fn write_envelope(dir: &Path, envelope: &MessageEnvelope) -> Result<()> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(format!("{}{ENVELOPE_SUFFIX}", envelope.envelope_id));
    let tmp_path = dir.join(format!(".{}.tmp", envelope.envelope_id));
    fs::write(&tmp_path, serde_json::to_vec_pretty(envelope)?)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}
