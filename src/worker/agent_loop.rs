//! The agent's poll loop: heartbeat, reap, scan, admit, claim, execute.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::context::{ContextSnapshot, ContextStore};
use crate::error::StoreError;
use crate::executor::{ExecutionOutput, Executor};
use crate::heartbeat::{AgentHeartbeat, AgentStatus, HeartbeatRegistry};
use crate::tasks::decompose::{decompose, materialize};
use crate::tasks::{CompletedSet, Resolution, Stage, TaskRecord, TaskRef, TaskStore};
use crate::worker::admission::{self, AdmissionOracle, AgentState, GoalValidator};
use crate::worker::lease;
use crate::workspace::Workspace;

/// Pause after a failed poll cycle.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Half-width of the poll jitter window, in seconds.
const JITTER_SECS: f64 = 0.5;

/// How many recent actions are offered to the reflective oracle.
const RECENT_ACTIONS: usize = 10;

/// Shared dependencies for the loop and its spawned task handlers.
#[derive(Clone)]
pub struct AgentDeps {
    pub config: Arc<AgentConfig>,
    pub store: Arc<TaskStore>,
    pub contexts: Arc<ContextStore>,
    pub heartbeats: Arc<HeartbeatRegistry>,
    pub executor: Arc<dyn Executor>,
    pub oracle: Arc<dyn AdmissionOracle>,
    pub validator: Arc<dyn GoalValidator>,
}

impl AgentDeps {
    /// Wire the stores for `config.workspace_path`.
    pub fn new(
        config: AgentConfig,
        executor: Arc<dyn Executor>,
        oracle: Arc<dyn AdmissionOracle>,
        validator: Arc<dyn GoalValidator>,
    ) -> Self {
        let workspace = Workspace::new(&config.workspace_path);
        Self {
            config: Arc::new(config),
            store: Arc::new(TaskStore::new(workspace.clone())),
            contexts: Arc::new(ContextStore::new(workspace.clone())),
            heartbeats: Arc::new(HeartbeatRegistry::new(workspace)),
            executor,
            oracle,
            validator,
        }
    }

    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }
}

/// How a claimed task ended for this agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { task_id: String, subtasks: usize },
    Retried { task_id: String, new_id: String },
    Failed { task_id: String },
    /// Ownership was lost or the record could not be moved.
    Abandoned { task_id: String },
}

/// Bounded log of this agent's recent actions.
#[derive(Debug, Clone, Default)]
struct ActionLog(Arc<Mutex<VecDeque<String>>>);

impl ActionLog {
    fn push(&self, action: String) {
        let mut log = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() == RECENT_ACTIONS {
            log.pop_front();
        }
        log.push_back(action);
    }

    fn snapshot(&self) -> Vec<String> {
        let log = self.0.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().cloned().collect()
    }
}

/// One agent's polling service.
pub struct WorkerLoop {
    deps: AgentDeps,
    in_flight: JoinSet<TaskOutcome>,
    actions: ActionLog,
}

impl WorkerLoop {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            deps,
            in_flight: JoinSet::new(),
            actions: ActionLog::default(),
        }
    }

    pub fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    /// Claims currently being processed.
    pub fn active_tasks(&self) -> usize {
        self.in_flight.len()
    }

    /// Poll until `shutdown` fires, then drain in-flight tasks and write a
    /// final `stopped` heartbeat.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let config = Arc::clone(&self.deps.config);
        info!(
            agent_id = %config.agent_id,
            role = %config.role,
            capabilities = ?config.capabilities,
            eagerness = config.eagerness,
            workspace = %config.workspace_path.display(),
            "Agent started"
        );

        while !shutdown.is_cancelled() {
            let pause = match self.poll_cycle().await {
                Ok(_) => self.jittered_interval(),
                Err(e) => {
                    error!(agent_id = %config.agent_id, error = %e, "Poll cycle failed");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if !self.in_flight.is_empty() {
            info!(in_flight = self.in_flight.len(), "Waiting for in-flight tasks");
        }
        self.drain().await;
        self.beat(AgentStatus::Stopped).await;
        info!(agent_id = %config.agent_id, "Agent stopped");
    }

    /// One poll cycle. Returns the id of the task claimed, if any.
    ///
    /// At most one task is claimed per cycle; it is processed on a spawned
    /// task so the next cycle's heartbeat is not delayed.
    pub async fn poll_cycle(&mut self) -> Result<Option<String>, StoreError> {
        self.collect_finished();
        self.beat(AgentStatus::Running).await;

        if let Some(timeout) = self.deps.config.lease_timeout {
            match lease::reap_orphans(&self.deps.store, &self.deps.heartbeats, timeout, Utc::now())
                .await
            {
                Ok(0) => {}
                Ok(n) => info!(reaped = n, "Recycled orphaned claims"),
                Err(e) => warn!(error = %e, "Lease reaping failed"),
            }
        }

        let state = self.agent_state();
        if state.at_capacity() {
            debug!(active = state.active_tasks, "At capacity, not scanning");
            return Ok(None);
        }

        let completed = CompletedSet::load(&self.deps.store).await?;
        let mut pending = self.deps.store.scan(Stage::Pending).await?;

        while let Some(task_ref) = pending.next().await {
            let task = match self.deps.store.load(&task_ref).await {
                Ok(task) => task,
                Err(e) if e.is_transient() => {
                    debug!(file = task_ref.file_name(), error = %e, "Skipping pending file");
                    continue;
                }
                Err(e) => {
                    warn!(file = task_ref.file_name(), error = %e, "Failed to read pending task");
                    continue;
                }
            };

            if !completed.satisfies(&task) {
                debug!(task_id = %task.id, missing = ?completed.missing(&task), "Dependencies not met");
                continue;
            }

            let decision = admission::admit(self.deps.oracle.as_ref(), &task, &state).await;
            if !decision.is_admit() {
                debug!(task_id = %task.id, ?decision, "Not admitting task");
                continue;
            }

            match self.deps.store.claim(&task_ref, self.deps.agent_id()).await {
                Ok(active) => {
                    info!(
                        agent_id = %self.deps.agent_id(),
                        task_id = %task.id,
                        description = %task.description,
                        ?decision,
                        "Claimed task"
                    );
                    self.actions.push(format!("claimed {}", task.short_id()));
                    let deps = self.deps.clone();
                    let actions = self.actions.clone();
                    self.in_flight
                        .spawn(async move { process_claimed(&deps, &actions, active).await });
                    return Ok(Some(task.id));
                }
                Err(e) if e.is_race_lost() => {
                    debug!(task_id = %task.id, "Lost claim race");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Claim failed");
                }
            }
        }
        Ok(None)
    }

    /// Run one cycle and wait for whatever it started.
    pub async fn run_once(&mut self) -> Result<Vec<TaskOutcome>, StoreError> {
        self.poll_cycle().await?;
        Ok(self.drain().await)
    }

    /// Wait for every in-flight task.
    pub async fn drain(&mut self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Task handler panicked"),
            }
        }
        outcomes
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Task handler panicked");
            }
        }
    }

    fn agent_state(&self) -> AgentState {
        let config = &self.deps.config;
        AgentState {
            agent_id: config.agent_id.clone(),
            agent_type: config.role.agent_type().to_string(),
            capabilities: config.capabilities.clone(),
            active_tasks: self.in_flight.len(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            eagerness: config.eagerness,
            recent_actions: self.actions.snapshot(),
        }
    }

    async fn beat(&self, status: AgentStatus) {
        let config = &self.deps.config;
        let heartbeat = AgentHeartbeat {
            agent_id: config.agent_id.clone(),
            agent_type: config.role.agent_type().to_string(),
            capabilities: config.capabilities.clone(),
            active_tasks: self.in_flight.len(),
            last_heartbeat: Utc::now(),
            status,
        };
        if let Err(e) = self.deps.heartbeats.beat(&heartbeat).await {
            warn!(error = %e, "Failed to write heartbeat");
        }
    }

    fn jittered_interval(&self) -> Duration {
        jittered(self.deps.config.poll_interval, &mut rand::thread_rng())
    }
}

/// `base` shifted by up to ±0.5 s, never negative.
fn jittered(base: Duration, rng: &mut impl Rng) -> Duration {
    let offset = rng.gen_range(-JITTER_SECS..=JITTER_SECS);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Execute a claimed task and resolve it.
async fn process_claimed(deps: &AgentDeps, actions: &ActionLog, active: TaskRef) -> TaskOutcome {
    let mut task = match deps.store.load(&active).await {
        Ok(task) => task,
        Err(e) => {
            warn!(file = active.file_name(), error = %e, "Claimed task unreadable");
            return TaskOutcome::Abandoned {
                task_id: claimed_task_id(&active, deps.agent_id()).to_string(),
            };
        }
    };

    task.last_heartbeat = Some(Utc::now());
    task.heartbeat_count += 1;
    if let Err(e) = deps.store.save(&active, &task).await {
        warn!(task_id = %task.id, error = %e, "Failed to stamp task heartbeat");
    }

    let prior = if task.dependencies.is_empty() {
        Vec::new()
    } else {
        deps.contexts
            .for_tasks(&task.dependencies)
            .await
            .unwrap_or_else(|e| {
                warn!(task_id = %task.id, error = %e, "Failed to load dependency context");
                Vec::new()
            })
    };

    info!(
        task_id = %task.id,
        executor = deps.executor.name(),
        prior = prior.len(),
        "Executing task"
    );
    let reason = match deps.executor.execute(&task, &prior).await {
        Ok(output) => {
            if admission::validate(deps.validator.as_ref(), &task, &output.result).await {
                match finish(deps, &active, &task, output).await {
                    Ok(outcome) => {
                        actions.push(format!("completed {}", task.short_id()));
                        return outcome;
                    }
                    Err(e) if lost_ownership(&e) => return abandoned(&task, &e),
                    Err(e) => format!("failed to record result: {e}"),
                }
            } else {
                "result does not advance the original goal".to_string()
            }
        }
        Err(e) => e.to_string(),
    };

    warn!(task_id = %task.id, error = %reason, "Task attempt failed");
    actions.push(format!("failed {}", task.short_id()));
    match deps.store.retry_or_fail(&active, &reason).await {
        Ok(Resolution::Retried { new_id, .. }) => TaskOutcome::Retried {
            task_id: task.id,
            new_id,
        },
        Ok(Resolution::Failed { .. }) => TaskOutcome::Failed { task_id: task.id },
        Err(e) if lost_ownership(&e) => abandoned(&task, &e),
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to resolve task");
            TaskOutcome::Abandoned { task_id: task.id }
        }
    }
}

/// Snapshot the result, complete, then materialize any breakdown.
///
/// The snapshot lands before `completed/` shows the task, so a dependent
/// admitted on that file always finds it. Subtasks are created only once
/// the parent is ours for good.
async fn finish(
    deps: &AgentDeps,
    active: &TaskRef,
    task: &TaskRecord,
    output: ExecutionOutput,
) -> Result<TaskOutcome, StoreError> {
    let snapshot = ContextSnapshot::from_task(task, output.result.clone());
    if let Err(e) = deps.contexts.write(&snapshot).await {
        warn!(task_id = %task.id, error = %e, "Failed to write context snapshot");
    }

    if let Err(e) = deps.store.complete(active, output.result).await {
        if let Err(remove_err) = deps.contexts.remove(&task.id).await {
            warn!(task_id = %task.id, error = %remove_err, "Failed to remove context snapshot");
        }
        return Err(e);
    }

    let mut subtasks = 0;
    if let Some(plan) = output.breakdown.as_ref().filter(|p| p.is_actionable()) {
        let records = decompose(task, plan);
        match materialize(&deps.store, task, &records).await {
            Ok(created) => subtasks = created.len(),
            Err(e) => error!(
                task_id = %task.id,
                planned = records.len(),
                error = %e,
                "Failed to create subtasks"
            ),
        }
    }
    Ok(TaskOutcome::Completed {
        task_id: task.id.clone(),
        subtasks,
    })
}

fn lost_ownership(e: &StoreError) -> bool {
    e.is_race_lost() || matches!(e, StoreError::NotFound { .. })
}

fn abandoned(task: &TaskRecord, e: &StoreError) -> TaskOutcome {
    warn!(task_id = %task.id, error = %e, "Lost ownership of task, abandoning");
    TaskOutcome::Abandoned {
        task_id: task.id.clone(),
    }
}

/// Task id from an `active/<agent>_<id>.json` reference.
fn claimed_task_id<'a>(active: &'a TaskRef, agent_id: &str) -> &'a str {
    let stem = active.stem();
    stem.strip_prefix(agent_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(stem)
}
