//! Executor for the task-breakdown role.

use async_trait::async_trait;
use serde_json::json;

use crate::context::ContextSnapshot;
use crate::error::ExecutorError;
use crate::executor::{ExecutionOutput, Executor};
use crate::tasks::{BreakdownPlan, TaskRecord};

/// Returns the plan attached to a task (`context.plan`) as its breakdown.
///
/// The plan may be the JSON object itself or text containing one, such as
/// the raw answer of an external planner.
#[derive(Debug, Clone, Default)]
pub struct PlannerExecutor;

#[async_trait]
impl Executor for PlannerExecutor {
    fn name(&self) -> &str {
        "planner"
    }

    async fn execute(
        &self,
        task: &TaskRecord,
        _prior: &[ContextSnapshot],
    ) -> Result<ExecutionOutput, ExecutorError> {
        let raw = task.context.get("plan").ok_or(ExecutorError::NoRequest)?;
        let plan = BreakdownPlan::from_value(raw).ok_or_else(|| ExecutorError::InvalidRequest {
            reason: "`plan` does not contain a breakdown object".to_string(),
        })?;

        let result = json!({
            "breakdown_needed": plan.breakdown_needed,
            "reasoning": plan.reasoning,
            "steps": plan.steps.len(),
        });
        let breakdown = plan.is_actionable().then_some(plan);
        Ok(ExecutionOutput { result, breakdown })
    }
}
