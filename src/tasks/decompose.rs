//! Task decomposition: turning a breakdown plan into chained pending subtasks.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::StoreError;
use crate::tasks::model::{TaskContext, TaskRecord};
use crate::tasks::store::{TaskRef, TaskStore};

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("static regex"));

/// A plan for splitting one task into ordered steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownPlan {
    #[serde(default)]
    pub breakdown_needed: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// One step of a breakdown plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    /// Agent type name, e.g. `GitAgent`.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// References to earlier steps, `step_N` (1-based).
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
}

fn default_agent_type() -> String {
    "unknown".to_string()
}

impl BreakdownPlan {
    /// Read a plan from a JSON value: either the plan object itself or a
    /// string containing one JSON object somewhere in its text.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Self::from_text(text),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    /// Extract the outermost JSON object from free text.
    pub fn from_text(text: &str) -> Option<Self> {
        let m = JSON_OBJECT.find(text)?;
        serde_json::from_str(m.as_str()).ok()
    }

    /// Whether this plan yields any subtasks.
    pub fn is_actionable(&self) -> bool {
        self.breakdown_needed && !self.steps.is_empty()
    }
}

/// Task type for an agent type name: `GitAgent` becomes `git_operations`.
pub fn task_type_for(agent_type: &str) -> String {
    agent_type.to_lowercase().replace("agent", "_operations")
}

/// Build the subtasks for `plan` without writing anything.
///
/// Every subtask gets a fresh id. `step_N` dependencies resolve only to
/// steps earlier in the same plan; forward and self references are dropped,
/// so the resulting graph is acyclic.
pub fn decompose(parent: &TaskRecord, plan: &BreakdownPlan) -> Vec<TaskRecord> {
    if !plan.is_actionable() {
        return Vec::new();
    }

    let goal = parent
        .context
        .goal()
        .map(str::to_string)
        .unwrap_or_else(|| parent.description.clone());
    let total = plan.steps.len() as u32;
    let mut subtasks: Vec<TaskRecord> = Vec::with_capacity(plan.steps.len());

    for (index, step) in plan.steps.iter().enumerate() {
        let dependencies: Vec<String> = step
            .dependencies
            .iter()
            .filter_map(|dep| step_index(dep))
            .filter(|&i| i < index)
            .map(|i| subtasks[i].id.clone())
            .collect();

        let mut context = TaskContext::with_goal(goal.clone());
        context.parent_task = Some(parent.id.clone());
        context.step_number = Some(index as u32 + 1);
        context.total_steps = Some(total);
        if let Some(duration) = &step.estimated_duration {
            context
                .extra
                .insert("estimated_duration".into(), Value::String(duration.clone()));
        }

        let subtask = TaskRecord::new(step.description.clone(), task_type_for(&step.agent_type))
            .with_requirements(step.requirements.iter().cloned())
            .with_dependencies(dependencies)
            .with_priority(parent.priority)
            .with_context(context);
        subtasks.push(subtask);
    }
    subtasks
}

/// Write subtasks into `pending`, in plan order.
pub async fn materialize(
    store: &TaskStore,
    parent: &TaskRecord,
    subtasks: &[TaskRecord],
) -> Result<Vec<TaskRef>, StoreError> {
    let mut refs = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        refs.push(store.create(subtask).await?);
    }
    if !refs.is_empty() {
        info!(parent = %parent.id, count = refs.len(), "Created subtasks");
    }
    Ok(refs)
}

/// Zero-based index of a `step_N` reference.
fn step_index(reference: &str) -> Option<usize> {
    reference
        .strip_prefix("step_")?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}
