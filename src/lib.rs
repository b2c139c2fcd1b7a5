//! Agent Hive: autonomous agents sharing a filesystem task queue.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod tasks;
pub mod worker;
pub mod workspace;
