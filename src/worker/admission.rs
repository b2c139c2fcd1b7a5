//! Admission: should this agent claim this task right now?
//!
//! Three oracle stages run in order after the local concurrency cap:
//! reflective veto, capability check, fitness against the eagerness
//! threshold. Decisions are recomputed for every task on every poll.
//!
//! Oracle failures degrade rather than abort: a failed reflection proceeds,
//! a failed capability check refuses, a failed or out-of-range fitness
//! score counts as 1.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::tasks::{Priority, TaskRecord};

/// Snapshot of an agent's situation, passed to the oracles.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub eagerness: u8,
    /// Most recent actions, newest last.
    pub recent_actions: Vec<String>,
}

impl AgentState {
    pub fn at_capacity(&self) -> bool {
        self.active_tasks >= self.max_concurrent_tasks
    }
}

/// External judgment on whether to take a task.
#[async_trait]
pub trait AdmissionOracle: Send + Sync {
    /// Can `task` be taken without compromising what this agent is already
    /// doing? `true` means no conflict, proceed.
    async fn reflect(&self, task: &TaskRecord, state: &AgentState) -> Result<bool, OracleError>;

    /// Can an agent with `capabilities` technically do `task`?
    async fn capable(&self, task: &TaskRecord, capabilities: &[String]) -> Result<bool, OracleError>;

    /// How well `task` fits this agent now, 1..=10.
    async fn fitness(&self, task: &TaskRecord, state: &AgentState) -> Result<u8, OracleError>;
}

/// External judgment on whether a result advances the task's goal.
#[async_trait]
pub trait GoalValidator: Send + Sync {
    async fn advances_goal(
        &self,
        goal: &str,
        task: &TaskRecord,
        result: &Value,
    ) -> Result<bool, OracleError>;
}

/// Outcome of admission for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit { fitness: u8 },
    AtCapacity,
    Vetoed,
    Incapable,
    Unfit { fitness: u8, threshold: u8 },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }
}

/// Whether `requirements` and `capabilities` share at least one tag.
/// Tasks without requirements match everyone.
pub fn shares_capability(requirements: &[String], capabilities: &[String]) -> bool {
    requirements.is_empty() || requirements.iter().any(|r| capabilities.contains(r))
}

/// Run admission for `task`.
pub async fn admit(oracle: &dyn AdmissionOracle, task: &TaskRecord, state: &AgentState) -> Decision {
    if state.at_capacity() {
        return Decision::AtCapacity;
    }

    match oracle.reflect(task, state).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %task.id, "Reflection vetoed task");
            return Decision::Vetoed;
        }
        Err(e) => warn!(task_id = %task.id, error = %e, "Reflection failed, proceeding"),
    }

    if !shares_capability(&task.requirements, &state.capabilities) {
        return Decision::Incapable;
    }
    match oracle.capable(task, &state.capabilities).await {
        Ok(true) => {}
        Ok(false) => return Decision::Incapable,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Capability check failed, refusing");
            return Decision::Incapable;
        }
    }

    let fitness = match oracle.fitness(task, state).await.and_then(in_range) {
        Ok(score) => score,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Fitness check failed, scoring 1");
            1
        }
    };
    if fitness >= state.eagerness {
        Decision::Admit { fitness }
    } else {
        Decision::Unfit {
            fitness,
            threshold: state.eagerness,
        }
    }
}

fn in_range(score: u8) -> Result<u8, OracleError> {
    if (1..=10).contains(&score) {
        Ok(score)
    } else {
        Err(OracleError::InvalidResponse {
            oracle: "fitness".to_string(),
            reason: format!("score {score} outside 1..=10"),
        })
    }
}

/// Validate `result` against the task's original goal.
///
/// A task without a goal passes without consulting the validator; a
/// validator error also counts as a pass.
pub async fn validate(validator: &dyn GoalValidator, task: &TaskRecord, result: &Value) -> bool {
    let Some(goal) = task.context.goal() else {
        return true;
    };
    match validator.advances_goal(goal, task, result).await {
        Ok(passed) => passed,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Goal validation failed, accepting result");
            true
        }
    }
}

/// Local, deterministic admission based on capability tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityOracle;

impl CapabilityOracle {
    /// `1 + 9 * matched/required`, less one per task already held, with a
    /// priority nudge. Tasks without requirements score a neutral 5.
    pub fn score(task: &TaskRecord, state: &AgentState) -> u8 {
        let base = if task.requirements.is_empty() {
            5.0
        } else {
            let matched = task
                .requirements
                .iter()
                .filter(|r| state.capabilities.contains(r))
                .count();
            1.0 + 9.0 * matched as f64 / task.requirements.len() as f64
        };
        let nudge = match task.priority {
            Priority::Low => -1.0,
            Priority::Medium => 0.0,
            Priority::High => 1.0,
            Priority::Critical => 2.0,
        };
        let score = base.round() - state.active_tasks as f64 + nudge;
        score.clamp(1.0, 10.0) as u8
    }
}

#[async_trait]
impl AdmissionOracle for CapabilityOracle {
    async fn reflect(&self, _task: &TaskRecord, _state: &AgentState) -> Result<bool, OracleError> {
        Ok(true)
    }

    async fn capable(&self, task: &TaskRecord, capabilities: &[String]) -> Result<bool, OracleError> {
        Ok(shares_capability(&task.requirements, capabilities))
    }

    async fn fitness(&self, task: &TaskRecord, state: &AgentState) -> Result<u8, OracleError> {
        Ok(Self::score(task, state))
    }
}

/// Accepts every result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptingValidator;

#[async_trait]
impl GoalValidator for AcceptingValidator {
    async fn advances_goal(
        &self,
        _goal: &str,
        _task: &TaskRecord,
        _result: &Value,
    ) -> Result<bool, OracleError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskContext;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(active: usize) -> AgentState {
        AgentState {
            agent_id: "FileAgent_1".into(),
            agent_type: "FileAgent".into(),
            capabilities: vec!["file_operations".into(), "code_analysis".into()],
            active_tasks: active,
            max_concurrent_tasks: 3,
            eagerness: 8,
            recent_actions: Vec::new(),
        }
    }

    /// Oracle with fixed answers that counts calls.
    #[derive(Default)]
    struct Scripted {
        reflect: Option<bool>,
        capable: Option<bool>,
        fitness: Option<u8>,
        calls: AtomicUsize,
    }

    fn unavailable(oracle: &str) -> OracleError {
        OracleError::Unavailable {
            oracle: oracle.into(),
            reason: "down".into(),
        }
    }

    #[async_trait]
    impl AdmissionOracle for Scripted {
        async fn reflect(&self, _: &TaskRecord, _: &AgentState) -> Result<bool, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reflect.ok_or_else(|| unavailable("reflect"))
        }
        async fn capable(&self, _: &TaskRecord, _: &[String]) -> Result<bool, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.capable.ok_or_else(|| unavailable("capable"))
        }
        async fn fitness(&self, _: &TaskRecord, _: &AgentState) -> Result<u8, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fitness.ok_or_else(|| unavailable("fitness"))
        }
    }

    fn file_task() -> TaskRecord {
        TaskRecord::new("write", "file_operations").with_requirements(["file_operations"])
    }

    #[tokio::test]
    async fn capacity_refuses_before_any_oracle() {
        let oracle = Scripted {
            reflect: Some(true),
            capable: Some(true),
            fitness: Some(10),
            ..Default::default()
        };
        let decision = admit(&oracle, &file_task(), &state(3)).await;
        assert_eq!(decision, Decision::AtCapacity);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disjoint_requirements_short_circuit() {
        let oracle = Scripted {
            reflect: Some(true),
            capable: Some(true),
            fitness: Some(10),
            ..Default::default()
        };
        let task = TaskRecord::new("push", "git_operations").with_requirements(["git_operations"]);
        assert_eq!(admit(&oracle, &task, &state(0)).await, Decision::Incapable);
        // Only reflection ran.
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fitness_threshold_is_inclusive() {
        let at = Scripted {
            reflect: Some(true),
            capable: Some(true),
            fitness: Some(8),
            ..Default::default()
        };
        assert_eq!(
            admit(&at, &file_task(), &state(0)).await,
            Decision::Admit { fitness: 8 }
        );
        let below = Scripted {
            reflect: Some(true),
            capable: Some(true),
            fitness: Some(7),
            ..Default::default()
        };
        assert_eq!(
            admit(&below, &file_task(), &state(0)).await,
            Decision::Unfit {
                fitness: 7,
                threshold: 8
            }
        );
    }

    #[tokio::test]
    async fn oracle_failures_degrade() {
        // Reflection error proceeds; fitness error scores 1.
        let oracle = Scripted {
            capable: Some(true),
            ..Default::default()
        };
        assert_eq!(
            admit(&oracle, &file_task(), &state(0)).await,
            Decision::Unfit {
                fitness: 1,
                threshold: 8
            }
        );
        // Capability error refuses.
        let oracle = Scripted {
            reflect: Some(true),
            fitness: Some(10),
            ..Default::default()
        };
        assert_eq!(admit(&oracle, &file_task(), &state(0)).await, Decision::Incapable);
    }

    #[tokio::test]
    async fn out_of_range_fitness_scores_one() {
        for score in [0, 11, 200] {
            let oracle = Scripted {
                reflect: Some(true),
                capable: Some(true),
                fitness: Some(score),
                ..Default::default()
            };
            assert_eq!(
                admit(&oracle, &file_task(), &state(0)).await,
                Decision::Unfit {
                    fitness: 1,
                    threshold: 8
                },
                "score {score}"
            );
        }
        assert!(matches!(
            in_range(11),
            Err(OracleError::InvalidResponse { ref oracle, .. }) if oracle == "fitness"
        ));
    }

    #[tokio::test]
    async fn veto_stops_admission() {
        let oracle = Scripted {
            reflect: Some(false),
            capable: Some(true),
            fitness: Some(10),
            ..Default::default()
        };
        assert_eq!(admit(&oracle, &file_task(), &state(0)).await, Decision::Vetoed);
    }

    #[test]
    fn capability_oracle_scoring() {
        let full = file_task();
        assert_eq!(CapabilityOracle::score(&full, &state(0)), 10);
        assert_eq!(CapabilityOracle::score(&full, &state(2)), 8);

        let half = TaskRecord::new("d", "t").with_requirements(["file_operations", "sql_queries"]);
        assert_eq!(CapabilityOracle::score(&half, &state(0)), 6);
        let half_high = half.clone().with_priority(Priority::High);
        assert_eq!(CapabilityOracle::score(&half_high, &state(0)), 7);

        let none = TaskRecord::new("d", "t");
        assert_eq!(CapabilityOracle::score(&none, &state(0)), 5);
        let none_low = none.with_priority(Priority::Low);
        assert_eq!(CapabilityOracle::score(&none_low, &state(9)), 1);
    }

    struct Rejecting;

    #[async_trait]
    impl GoalValidator for Rejecting {
        async fn advances_goal(&self, _: &str, _: &TaskRecord, _: &Value) -> Result<bool, OracleError> {
            Ok(false)
        }
    }

    struct Broken;

    #[async_trait]
    impl GoalValidator for Broken {
        async fn advances_goal(&self, _: &str, _: &TaskRecord, _: &Value) -> Result<bool, OracleError> {
            Err(unavailable("validator"))
        }
    }

    #[tokio::test]
    async fn validation_rules() {
        let no_goal = TaskRecord::new("d", "t");
        let blank_goal = TaskRecord::new("d", "t").with_context(TaskContext::with_goal("  "));
        let with_goal = TaskRecord::new("d", "t").with_context(TaskContext::with_goal("ship"));
        let result = json!("anything");

        assert!(validate(&Rejecting, &no_goal, &result).await);
        assert!(validate(&Rejecting, &blank_goal, &result).await);
        assert!(!validate(&Rejecting, &with_goal, &result).await);
        assert!(validate(&Broken, &with_goal, &result).await);
        assert!(validate(&AcceptingValidator, &with_goal, &result).await);
    }
}
