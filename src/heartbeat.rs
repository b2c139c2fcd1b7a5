//! Agent heartbeat registry.
//!
//! One overwrite-only record per agent under `agents/<agent-id>.json`.
//! Heartbeats are never consulted for claim decisions; the lease reaper is
//! their only reader inside the crate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::tasks::timestamp;
use crate::workspace::{self, Workspace};

/// Whether the agent process is still polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Running,
    Stopped,
}

/// Liveness and capability advertisement for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub active_tasks: usize,
    #[serde(with = "timestamp")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub status: AgentStatus,
}

impl AgentHeartbeat {
    /// Whether the last beat is older than `timeout` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > timeout
    }
}

/// Reader/writer for `agents/`.
#[derive(Debug, Clone)]
pub struct HeartbeatRegistry {
    workspace: Workspace,
}

impl HeartbeatRegistry {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Overwrite this agent's record.
    pub async fn beat(&self, heartbeat: &AgentHeartbeat) -> Result<(), StoreError> {
        let path = self
            .workspace
            .agents_dir()
            .join(format!("{}.json", heartbeat.agent_id));
        workspace::write_json_atomic(&path, heartbeat).await
    }

    /// Read one agent's record; `None` if it never beat.
    pub async fn read(&self, agent_id: &str) -> Result<Option<AgentHeartbeat>, StoreError> {
        let path = self.workspace.agents_dir().join(format!("{agent_id}.json"));
        match workspace::read_json(&path).await {
            Ok(hb) => Ok(Some(hb)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All readable heartbeat records. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<AgentHeartbeat>, StoreError> {
        let dir = self.workspace.agents_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut heartbeats = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !workspace::is_record_file(&name.to_string_lossy()) {
                continue;
            }
            match workspace::read_json::<AgentHeartbeat>(&entry.path()).await {
                Ok(hb) => heartbeats.push(hb),
                Err(e) => debug!(path = %entry.path().display(), error = %e, "Skipping heartbeat"),
            }
        }
        heartbeats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(heartbeats)
    }
}
