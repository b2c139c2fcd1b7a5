//! Task record data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::tasks::timestamp;

/// Default retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Structured context threaded through a chain of tasks.
///
/// Keys other than the named ones (a capability `request`, a breakdown
/// `plan`, producer annotations) are kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Root intent; copied verbatim into every subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_goal: Option<String>,
    /// Task this one was decomposed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskContext {
    /// Context with only a goal set.
    pub fn with_goal(goal: impl Into<String>) -> Self {
        Self {
            original_goal: Some(goal.into()),
            ..Default::default()
        }
    }

    /// The original goal, if present and non-blank.
    pub fn goal(&self) -> Option<&str> {
        self.original_goal
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    /// Look up an extra context key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Builder: set an extra context key.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A unit of work shared through the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique id; the file name stem outside `active/`.
    pub id: String,
    /// First id of this retry lineage. Absent on a first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage_id: Option<String>,
    /// Free-text goal statement.
    pub description: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    /// Capability tags an agent needs.
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Ids that must be completed before this task is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub heartbeat_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Fields written by other producers, preserved across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_task_type() -> String {
    "unknown".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl TaskRecord {
    /// Create a new pending task with a fresh UUID.
    pub fn new(description: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), description, task_type)
    }

    /// Create a new pending task with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        description: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            lineage_id: None,
            description: description.into(),
            task_type: task_type.into(),
            requirements: Vec::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            context: TaskContext::default(),
            created_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_heartbeat: None,
            heartbeat_count: 0,
            result: None,
            completed_at: None,
            error: None,
            failed_at: None,
            extra: Map::new(),
        }
    }

    /// Builder: set requirements.
    pub fn with_requirements<I, S>(mut self, reqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = reqs.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set dependencies.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set context.
    pub fn with_context(mut self, ctx: TaskContext) -> Self {
        self.context = ctx;
        self
    }

    /// Builder: set retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Lineage this record belongs to (its own id on a first attempt).
    pub fn lineage(&self) -> &str {
        self.lineage_id.as_deref().unwrap_or(&self.id)
    }

    /// Whether another failure would still leave retry budget.
    pub fn retries_remain_after_failure(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_defaults() {
        let task = TaskRecord::new("Write a script", "file_operations");
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.priority, Priority::Medium);
        assert!(task.claimed_by.is_none());
        assert_eq!(task.lineage(), task.id);
    }

    #[test]
    fn parses_external_producer_format() {
        let raw = json!({
            "id": "5b0c",
            "description": "Create a simple shell script",
            "type": "simple_task",
            "requirements": ["file_operations"],
            "priority": "medium",
            "context": {"original_goal": "Create a shell script", "test_task": true},
            "created_at": "2025-01-02T03:04:05.678901",
            "max_retries": 3,
            "retry_count": 0,
            "status": "pending"
        });
        let task: TaskRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(task.task_type, "simple_task");
        assert_eq!(task.context.goal(), Some("Create a shell script"));
        assert_eq!(task.context.get("test_task"), Some(&json!(true)));
        assert_eq!(task.extra.get("status"), Some(&json!("pending")));
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn unknown_fields_survive_serialization() {
        let raw = json!({
            "id": "t1",
            "description": "d",
            "owner_note": {"k": [1, 2]},
            "context": {"plan_hint": "x"}
        });
        let task: TaskRecord = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["owner_note"], json!({"k": [1, 2]}));
        assert_eq!(back["context"]["plan_hint"], json!("x"));
        assert_eq!(back["type"], json!("unknown"));
    }

    #[test]
    fn blank_goal_counts_as_unset() {
        let ctx = TaskContext::with_goal("   ");
        assert!(ctx.goal().is_none());
        assert!(TaskContext::default().goal().is_none());
    }

    #[test]
    fn retry_budget_arithmetic() {
        let mut task = TaskRecord::new("d", "t").with_max_retries(3);
        assert!(task.retries_remain_after_failure());
        task.retry_count = 2;
        assert!(!task.retries_remain_after_failure());
    }

    #[test]
    fn short_id_handles_short_ids() {
        let task = TaskRecord::with_id("T1", "d", "t");
        assert_eq!(task.short_id(), "T1");
        let task = TaskRecord::with_id("0123456789abcdef", "d", "t");
        assert_eq!(task.short_id(), "01234567");
    }
}
