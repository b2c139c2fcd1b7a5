//! Agent worker: admission, orphan recovery and the poll loop.
//!
//! - `admission` decides whether to claim a task and validates results
//! - `lease` recycles claims whose owner stopped heartbeating
//! - `agent_loop` runs the heartbeat/scan/claim/execute cycle

pub mod admission;
pub mod agent_loop;
pub mod lease;

pub use admission::{
    AcceptingValidator, AdmissionOracle, AgentState, CapabilityOracle, Decision, GoalValidator,
};
pub use agent_loop::{AgentDeps, TaskOutcome, WorkerLoop};
