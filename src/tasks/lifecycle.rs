//! Task lifecycle operations built on `TaskStore::transition`.
//!
//! Stage graph:
//!
//! ```text
//! pending --claim--> active --complete--> completed
//!                      |
//!                      +--retry_or_fail--> pending (new id, same lineage)
//!                      +--retry_or_fail--> failed  (retries exhausted)
//! ```

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::tasks::model::TaskRecord;
use crate::tasks::stage::Stage;
use crate::tasks::store::{TaskRef, TaskStore};

/// Outcome of `retry_or_fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Re-injected into `pending` under a new id.
    Retried { new_id: String, task_ref: TaskRef },
    /// Moved to `failed` for good.
    Failed { task_ref: TaskRef },
}

/// Id of the `attempt`-th retry of a lineage.
pub fn retry_id(lineage: &str, attempt: u32) -> String {
    format!("{lineage}-retry-{attempt}")
}

/// File name of a claimed task in `active/`.
pub fn active_file_name(agent_id: &str, task_id: &str) -> String {
    format!("{agent_id}_{task_id}.json")
}

impl TaskStore {
    /// Claim a pending task for `agent_id`.
    ///
    /// Losing the rename race returns `AlreadyClaimed` and mutates nothing.
    pub async fn claim(&self, pending: &TaskRef, agent_id: &str) -> Result<TaskRef, StoreError> {
        let task_id = pending.stem().to_string();
        let dest = active_file_name(agent_id, &task_id);
        let owner = agent_id.to_string();

        self.transition(pending, Stage::Active, &dest, move |r| {
            r.claimed_by = Some(owner);
            r.claimed_at = Some(Utc::now());
        })
        .await
        .map_err(|e| match e {
            StoreError::AlreadyGone { .. } => StoreError::AlreadyClaimed { id: task_id },
            other => other,
        })
    }

    /// Record a successful result and move the task to `completed`.
    pub async fn complete(&self, active: &TaskRef, result: Value) -> Result<TaskRef, StoreError> {
        let record = self.load(active).await?;
        let dest = format!("{}.json", record.id);

        let done = self
            .transition(active, Stage::Completed, &dest, move |r| {
                r.result = Some(result);
                r.completed_at = Some(Utc::now());
            })
            .await?;
        info!(task_id = %record.id, "Task completed");
        Ok(done)
    }

    /// Route a failed attempt: re-inject a new pending attempt while retries
    /// remain, otherwise park the task in `failed`.
    ///
    /// `retry_count` is incremented first; the task fails iff the new count
    /// reaches `max_retries`.
    pub async fn retry_or_fail(
        &self,
        active: &TaskRef,
        error: &str,
    ) -> Result<Resolution, StoreError> {
        let record = self.load(active).await?;
        let error = error.to_string();

        if record.retries_remain_after_failure() {
            let attempt = record.retry_count + 1;
            let lineage = record.lineage().to_string();
            let new_id = retry_id(&lineage, attempt);
            let dest = format!("{new_id}.json");

            let assigned = new_id.clone();
            let task_ref = self
                .transition(active, Stage::Pending, &dest, move |r| {
                    r.retry_count = attempt;
                    r.lineage_id = Some(lineage);
                    r.id = assigned;
                    r.error = Some(error);
                    reset_claim(r);
                })
                .await?;
            info!(
                task_id = %record.id,
                new_id = %new_id,
                retry_count = attempt,
                max_retries = record.max_retries,
                "Task re-queued for retry"
            );
            Ok(Resolution::Retried { new_id, task_ref })
        } else {
            let dest = format!("{}.json", record.id);
            let task_ref = self
                .transition(active, Stage::Failed, &dest, move |r| {
                    r.retry_count += 1;
                    r.error = Some(error);
                    r.failed_at = Some(Utc::now());
                })
                .await?;
            warn!(
                task_id = %record.id,
                retry_count = record.retry_count + 1,
                "Task failed permanently"
            );
            Ok(Resolution::Failed { task_ref })
        }
    }
}

fn reset_claim(record: &mut TaskRecord) {
    record.claimed_by = None;
    record.claimed_at = None;
    record.last_heartbeat = None;
    record.heartbeat_count = 0;
    record.result = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskContext;
    use crate::workspace::Workspace;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_dirs().await.unwrap();
        (TaskStore::new(ws), dir)
    }

    #[tokio::test]
    async fn claim_stamps_owner_and_renames() {
        let (store, _dir) = test_store().await;
        let pending = store
            .create(&TaskRecord::with_id("T1", "d", "t"))
            .await
            .unwrap();

        let active = store.claim(&pending, "FileAgent_ab12cd34").await.unwrap();
        assert_eq!(active.file_name(), "FileAgent_ab12cd34_T1.json");

        let record = store.load(&active).await.unwrap();
        assert_eq!(record.claimed_by.as_deref(), Some("FileAgent_ab12cd34"));
        assert!(record.claimed_at.is_some());
    }

    #[tokio::test]
    async fn second_claim_is_already_claimed() {
        let (store, _dir) = test_store().await;
        let pending = store
            .create(&TaskRecord::with_id("T1", "d", "t"))
            .await
            .unwrap();

        store.claim(&pending, "a").await.unwrap();
        let err = store.claim(&pending, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyClaimed { ref id } if id == "T1"));

        let active = store.scan_all(Stage::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].file_name(), "a_T1.json");
    }

    #[tokio::test]
    async fn complete_moves_to_completed_by_id() {
        let (store, _dir) = test_store().await;
        let pending = store
            .create(&TaskRecord::with_id("T4", "d", "t"))
            .await
            .unwrap();
        let active = store.claim(&pending, "agent").await.unwrap();

        let done = store.complete(&active, json!("ok")).await.unwrap();
        assert_eq!(done.file_name(), "T4.json");
        assert!(store.scan_all(Stage::Active).await.unwrap().is_empty());

        let record = store.load(&done).await.unwrap();
        assert_eq!(record.result, Some(json!("ok")));
        assert!(record.completed_at.is_some());
        assert_eq!(record.claimed_by.as_deref(), Some("agent"));
    }

    #[tokio::test]
    async fn retry_reinjects_with_new_id_and_same_payload() {
        let (store, _dir) = test_store().await;
        let original = TaskRecord::with_id("T3", "flaky", "terminal_operations")
            .with_context(TaskContext::with_goal("goal"));
        let pending = store.create(&original).await.unwrap();
        let active = store.claim(&pending, "agent").await.unwrap();

        let resolution = store.retry_or_fail(&active, "boom").await.unwrap();
        let Resolution::Retried { new_id, task_ref } = resolution else {
            panic!("expected retry");
        };
        assert_eq!(new_id, "T3-retry-1");
        assert_eq!(task_ref.file_name(), "T3-retry-1.json");

        let record = store.load(&task_ref).await.unwrap();
        assert_eq!(record.id, "T3-retry-1");
        assert_eq!(record.lineage(), "T3");
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.description, "flaky");
        assert_eq!(record.context, original.context);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.claimed_by.is_none());
        assert!(record.claimed_at.is_none());
        assert!(store.scan_all(Stage::Active).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed() {
        let (store, _dir) = test_store().await;
        let mut pending = store
            .create(&TaskRecord::with_id("T3", "d", "t").with_max_retries(3))
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            let active = store.claim(&pending, "agent").await.unwrap();
            match store.retry_or_fail(&active, "boom").await.unwrap() {
                Resolution::Retried { task_ref, .. } => {
                    assert!(attempt < 3);
                    pending = task_ref;
                }
                Resolution::Failed { task_ref } => {
                    assert_eq!(attempt, 3);
                    // Failed records keep the id of the last attempt.
                    assert_eq!(task_ref.file_name(), "T3-retry-2.json");
                    let record = store.load(&task_ref).await.unwrap();
                    assert_eq!(record.retry_count, 3);
                    assert_eq!(record.lineage(), "T3");
                    assert!(record.failed_at.is_some());
                }
            }
        }
        assert!(store.scan_all(Stage::Pending).await.unwrap().is_empty());
        assert!(store.scan_all(Stage::Active).await.unwrap().is_empty());
        assert_eq!(store.scan_all(Stage::Failed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_retry_budget_fails_immediately() {
        let (store, _dir) = test_store().await;
        let pending = store
            .create(&TaskRecord::with_id("once", "d", "t").with_max_retries(1))
            .await
            .unwrap();
        let active = store.claim(&pending, "agent").await.unwrap();
        let resolution = store.retry_or_fail(&active, "nope").await.unwrap();
        assert!(matches!(resolution, Resolution::Failed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completed_file_carries_result_when_it_appears() {
        let (store, _dir) = test_store().await;
        for i in 0..50 {
            let id = format!("C{i}");
            let pending = store
                .create(&TaskRecord::with_id(&id, "d", "t"))
                .await
                .unwrap();
            let active = store.claim(&pending, "agent").await.unwrap();

            let done = store.task_ref(Stage::Completed, &format!("{id}.json"));
            let watcher = {
                let store = store.clone();
                tokio::spawn(async move {
                    loop {
                        if let Ok(record) = store.load(&done).await {
                            return record;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            };

            store.complete(&active, json!({"n": i})).await.unwrap();
            let first_seen = watcher.await.unwrap();
            assert_eq!(first_seen.result, Some(json!({"n": i})));
            assert!(first_seen.completed_at.is_some());
        }
    }

    #[tokio::test]
    async fn complete_after_losing_ownership_is_already_gone() {
        let (store, _dir) = test_store().await;
        let pending = store
            .create(&TaskRecord::with_id("L", "d", "t"))
            .await
            .unwrap();
        let active = store.claim(&pending, "agent").await.unwrap();
        store.retry_or_fail(&active, "lease expired").await.unwrap();

        let err = store.complete(&active, json!(1)).await.unwrap_err();
        assert!(err.is_race_lost() || matches!(err, StoreError::NotFound { .. }));
    }
}
