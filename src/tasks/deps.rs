//! Dependency gating against the completed set.

use std::collections::HashSet;

use tracing::debug;

use crate::error::StoreError;
use crate::tasks::model::TaskRecord;
use crate::tasks::stage::Stage;
use crate::tasks::store::TaskStore;

/// Ids known to be completed.
///
/// Holds file stems, record ids and lineage ids of everything in
/// `completed/`, so a dependency on a task id is satisfied by any completed
/// attempt of its lineage.
#[derive(Debug, Clone, Default)]
pub struct CompletedSet {
    ids: HashSet<String>,
}

impl CompletedSet {
    /// Re-scan `completed/`. Records that cannot be read still count by stem.
    pub async fn load(store: &TaskStore) -> Result<Self, StoreError> {
        let mut ids = HashSet::new();
        for task_ref in store.scan_all(Stage::Completed).await? {
            ids.insert(task_ref.stem().to_string());
            match store.load(&task_ref).await {
                Ok(record) => {
                    if let Some(lineage) = record.lineage_id {
                        ids.insert(lineage);
                    }
                    ids.insert(record.id);
                }
                Err(e) => {
                    debug!(path = %task_ref.path.display(), error = %e, "Counting completed task by file name only");
                }
            }
        }
        Ok(Self { ids })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether every dependency of `task` is completed.
    pub fn satisfies(&self, task: &TaskRecord) -> bool {
        task.dependencies.iter().all(|d| self.contains(d))
    }

    /// Dependencies of `task` that are not completed yet.
    pub fn missing<'a>(&self, task: &'a TaskRecord) -> Vec<&'a str> {
        task.dependencies
            .iter()
            .filter(|d| !self.contains(d))
            .map(String::as_str)
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for CompletedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn empty_dependencies_always_satisfied() {
        let set = CompletedSet::default();
        assert!(set.satisfies(&TaskRecord::with_id("a", "d", "t")));
    }

    #[test]
    fn missing_lists_unfinished_dependencies() {
        let set: CompletedSet = ["T1"].into_iter().collect();
        let task = TaskRecord::with_id("T3", "d", "t").with_dependencies(["T1", "T2"]);
        assert!(!set.satisfies(&task));
        assert_eq!(set.missing(&task), vec!["T2"]);
    }

    #[tokio::test]
    async fn completed_retry_satisfies_original_id() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_dirs().await.unwrap();
        let store = TaskStore::new(ws);

        let pending = store
            .create(&TaskRecord::with_id("T1", "d", "t"))
            .await
            .unwrap();
        let active = store.claim(&pending, "a").await.unwrap();
        store.retry_or_fail(&active, "first try failed").await.unwrap();

        let dependent = TaskRecord::with_id("T2", "d", "t").with_dependencies(["T1"]);
        let set = CompletedSet::load(&store).await.unwrap();
        assert!(!set.satisfies(&dependent));

        let retry = store.task_ref(Stage::Pending, "T1-retry-1.json");
        let active = store.claim(&retry, "b").await.unwrap();
        store.complete(&active, json!("done")).await.unwrap();

        let set = CompletedSet::load(&store).await.unwrap();
        assert!(set.contains("T1-retry-1"));
        assert!(set.satisfies(&dependent));
    }

    #[tokio::test]
    async fn unreadable_completed_file_counts_by_stem() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_dirs().await.unwrap();
        tokio::fs::write(ws.stage_dir(Stage::Completed).join("T9.json"), "not json")
            .await
            .unwrap();

        let set = CompletedSet::load(&TaskStore::new(ws)).await.unwrap();
        assert!(set.contains("T9"));
        assert_eq!(set.len(), 1);
    }
}
