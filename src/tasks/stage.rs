//! Task lifecycle stages.
//!
//! A task's stage is the directory that currently holds its file; records
//! never carry their own status field.

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one agent.
    Active,
    /// Finished and validated.
    Completed,
    /// Retries exhausted.
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Self::Pending, Self::Active, Self::Completed, Self::Failed];

    /// Check if this stage allows moving a record to `target`.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Pending, Active) |
            (Active, Completed) | (Active, Failed) |
            // Retry re-injection and orphan recycling
            (Active, Pending)
        )
    }

    /// Directory name under `tasks/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
