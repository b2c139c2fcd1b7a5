//! Filesystem task store.
//!
//! Each task is one JSON file; the directory holding it is its stage. The
//! only mutation that changes ownership is `transition`, built around a
//! single atomic rename whose source path encodes the precondition: if the
//! source is gone, another worker won and the caller backs off. A record is
//! always fully written before it becomes visible in a stage others read.

use std::io;
use std::path::PathBuf;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs;
use tokio_stream::wrappers::ReadDirStream;
use tracing::debug;

use crate::error::StoreError;
use crate::tasks::model::TaskRecord;
use crate::tasks::stage::Stage;
use crate::workspace::{self, Workspace};

/// Location of a task file in a given stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub stage: Stage,
    pub path: PathBuf,
}

impl TaskRef {
    fn from_path(stage: Stage, path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        workspace::is_record_file(name).then_some(Self { stage, path })
    }

    /// File name, e.g. `T1.json` or `agent_T1.json`.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// File name without `.json`. Equals the task id outside `active/`.
    pub fn stem(&self) -> &str {
        self.file_name()
            .strip_suffix(".json")
            .unwrap_or(self.file_name())
    }
}

/// Shared task store rooted in a workspace.
#[derive(Debug, Clone)]
pub struct TaskStore {
    workspace: Workspace,
}

impl TaskStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Reference to `<stage>/<file_name>`.
    pub fn task_ref(&self, stage: Stage, file_name: &str) -> TaskRef {
        TaskRef {
            stage,
            path: self.workspace.stage_dir(stage).join(file_name),
        }
    }

    /// Lazily list the task files currently in `stage`.
    ///
    /// Call again to restart. A missing directory is empty; entries that fail
    /// to stat mid-listing are skipped.
    pub async fn scan(&self, stage: Stage) -> Result<BoxStream<'static, TaskRef>, StoreError> {
        let dir = self.workspace.stage_dir(stage);
        let read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(stream::empty().boxed());
            }
            Err(e) => return Err(e.into()),
        };

        let refs = ReadDirStream::new(read_dir).filter_map(move |entry| {
            let task_ref = match entry {
                Ok(entry) => TaskRef::from_path(stage, entry.path()),
                Err(e) => {
                    debug!(stage = %stage, error = %e, "Skipping unreadable directory entry");
                    None
                }
            };
            futures::future::ready(task_ref)
        });
        Ok(refs.boxed())
    }

    /// Collect `scan(stage)` into a vector.
    pub async fn scan_all(&self, stage: Stage) -> Result<Vec<TaskRef>, StoreError> {
        Ok(self.scan(stage).await?.collect().await)
    }

    /// Load a task record.
    pub async fn load(&self, task_ref: &TaskRef) -> Result<TaskRecord, StoreError> {
        workspace::read_json(&task_ref.path).await
    }

    /// Save a record at its current location (temp file + atomic replace).
    pub async fn save(&self, task_ref: &TaskRef, record: &TaskRecord) -> Result<(), StoreError> {
        workspace::write_json_atomic(&task_ref.path, record).await
    }

    /// Publish a new record into `pending/<id>.json`.
    pub async fn create(&self, record: &TaskRecord) -> Result<TaskRef, StoreError> {
        let file_name = format!("{}.json", record.id);
        if self.id_exists(&record.id).await {
            return Err(StoreError::DuplicateId {
                id: record.id.clone(),
            });
        }
        let task_ref = self.task_ref(Stage::Pending, &file_name);
        self.save(&task_ref, record).await?;
        Ok(task_ref)
    }

    /// Whether any stage already holds a record with this id.
    pub async fn id_exists(&self, id: &str) -> bool {
        let file_name = format!("{id}.json");
        let suffix = format!("_{id}.json");
        for stage in [Stage::Pending, Stage::Completed, Stage::Failed] {
            if fs::try_exists(self.workspace.stage_dir(stage).join(&file_name))
                .await
                .unwrap_or(false)
            {
                return true;
            }
        }
        match self.scan_all(Stage::Active).await {
            Ok(active) => active.iter().any(|r| r.file_name().ends_with(&suffix)),
            Err(_) => false,
        }
    }

    /// Move a record between stages, applying `mutate` on the way.
    ///
    /// Out of `active/`, where only the owner writes, the mutation is saved
    /// at the source first and the rename publishes the finished record. Into
    /// `active/`, the rename decides the winner and the winner then stamps
    /// its own file. Either way a missing source means another worker already
    /// moved the file (`AlreadyGone`) and nothing visible was changed.
    pub async fn transition<F>(
        &self,
        from: &TaskRef,
        to: Stage,
        dest_file_name: &str,
        mutate: F,
    ) -> Result<TaskRef, StoreError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        if !from.stage.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: from.stage.to_string(),
                to: to.to_string(),
            });
        }

        let dest_dir = self.workspace.stage_dir(to);
        fs::create_dir_all(&dest_dir).await?;
        let dest = self.task_ref(to, dest_file_name);

        if from.stage == Stage::Active {
            let mut record = self.load(from).await.map_err(|e| gone(from, e))?;
            mutate(&mut record);
            self.save(from, &record).await?;
            self.rename(from, &dest).await?;
        } else {
            self.rename(from, &dest).await?;
            let mut record = self.load(&dest).await?;
            mutate(&mut record);
            self.save(&dest, &record).await?;
        }
        Ok(dest)
    }

    async fn rename(&self, from: &TaskRef, to: &TaskRef) -> Result<(), StoreError> {
        fs::rename(&from.path, &to.path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::AlreadyGone {
                    path: from.path.clone(),
                }
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Ids (file stems) present in a non-active stage.
    pub async fn stage_ids(&self, stage: Stage) -> Result<Vec<String>, StoreError> {
        Ok(self
            .scan_all(stage)
            .await?
            .iter()
            .map(|r| r.stem().to_string())
            .collect())
    }

    /// Directory path for a stage.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.workspace.stage_dir(stage)
    }
}

fn gone(from: &TaskRef, e: StoreError) -> StoreError {
    match e {
        StoreError::NotFound { .. } => StoreError::AlreadyGone {
            path: from.path.clone(),
        },
        other => other,
    }
}
