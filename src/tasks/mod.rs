//! Shared task queue: records, stages, the store and lifecycle transitions.

pub mod decompose;
pub mod deps;
pub mod lifecycle;
pub mod model;
pub mod stage;
pub mod store;
pub mod timestamp;

pub use decompose::{BreakdownPlan, PlanStep};
pub use deps::CompletedSet;
pub use lifecycle::Resolution;
pub use model::{Priority, TaskContext, TaskRecord};
pub use stage::Stage;
pub use store::{TaskRef, TaskStore};
