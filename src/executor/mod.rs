//! Task executors.
//!
//! The worker hands each claimed task to an `Executor` together with the
//! context snapshots of its dependencies. `BuiltinExecutor` runs the closed
//! set of capability requests; `PlannerExecutor` turns an attached plan into
//! a breakdown.

pub mod builtin;
pub mod file;
pub mod http;
pub mod planner;
pub mod request;
pub mod shell;
pub mod sql;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ContextSnapshot;
use crate::error::ExecutorError;
use crate::tasks::{BreakdownPlan, TaskRecord};

pub use builtin::BuiltinExecutor;
pub use planner::PlannerExecutor;
pub use request::CapabilityRequest;

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Stored as the task's `result` and in its context snapshot.
    pub result: Value,
    /// Subtasks to create before the task completes.
    pub breakdown: Option<BreakdownPlan>,
}

impl ExecutionOutput {
    pub fn value(result: Value) -> Self {
        Self {
            result,
            breakdown: None,
        }
    }
}

/// Performs the work a task describes.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Execute `task`. `prior` holds snapshots of its completed dependencies.
    /// An error routes the task through retry-or-fail.
    async fn execute(
        &self,
        task: &TaskRecord,
        prior: &[ContextSnapshot],
    ) -> Result<ExecutionOutput, ExecutorError>;
}
