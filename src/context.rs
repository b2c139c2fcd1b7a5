//! Context store: result snapshots of completed tasks.
//!
//! `context/<task-id>_context.json`, written just before a task completes and
//! read by later tasks that depend on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::tasks::TaskRecord;
use crate::tasks::timestamp;
use crate::workspace::{self, Workspace};

const SUFFIX: &str = "_context.json";

/// Durable record of a completed task's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub task_id: String,
    /// Set when the task was a retry, so dependents of the first id find it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage_id: Option<String>,
    pub description: String,
    pub result: Value,
    #[serde(default)]
    pub original_goal: Option<String>,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn from_task(task: &TaskRecord, result: Value) -> Self {
        Self {
            task_id: task.id.clone(),
            lineage_id: task.lineage_id.clone(),
            description: task.description.clone(),
            result,
            original_goal: task.context.original_goal.clone(),
            created_at: Utc::now(),
        }
    }

    fn answers_to(&self, id: &str) -> bool {
        self.task_id == id || self.lineage_id.as_deref() == Some(id)
    }
}

/// Reader/writer for `context/`.
#[derive(Debug, Clone)]
pub struct ContextStore {
    workspace: Workspace,
}

impl ContextStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn path_for(&self, task_id: &str) -> std::path::PathBuf {
        self.workspace
            .context_dir()
            .join(format!("{task_id}{SUFFIX}"))
    }

    pub async fn write(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        workspace::write_json_atomic(&self.path_for(&snapshot.task_id), snapshot).await
    }

    /// Drop the snapshot of `task_id`. Missing snapshots are fine.
    pub async fn remove(&self, task_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot for exactly `task_id`, if one was written.
    pub async fn read(&self, task_id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        match workspace::read_json(&self.path_for(task_id)).await {
            Ok(s) => Ok(Some(s)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Snapshots answering to each of `ids`, matching retries by lineage.
    /// Ids without a readable snapshot are left out.
    pub async fn for_tasks(&self, ids: &[String]) -> Result<Vec<ContextSnapshot>, StoreError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut all: Option<Vec<ContextSnapshot>> = None;

        for id in ids {
            match self.read(id).await {
                Ok(Some(snapshot)) => {
                    found.push(snapshot);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(task_id = %id, error = %e, "Unreadable context snapshot");
                    continue;
                }
            }

            if all.is_none() {
                all = Some(self.list().await?);
            }
            if let Some(snapshot) = all
                .as_ref()
                .and_then(|all| all.iter().find(|s| s.answers_to(id)))
            {
                found.push(snapshot.clone());
            }
        }
        Ok(found)
    }

    /// All readable snapshots, oldest first.
    pub async fn list(&self) -> Result<Vec<ContextSnapshot>, StoreError> {
        let dir = self.workspace.context_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !workspace::is_record_file(&name) || !name.ends_with(SUFFIX) {
                continue;
            }
            if let Ok(s) = workspace::read_json::<ContextSnapshot>(&entry.path()).await {
                snapshots.push(s);
            }
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }
}
