//! Shared workspace layout.
//!
//! The workspace is a directory tree shared by every agent process:
//! - `tasks/{pending,active,completed,failed}/`: task records, one file each
//! - `agents/`: per-agent heartbeat records
//! - `context/`: result snapshots of completed tasks
//!
//! Rename is the only mutual-exclusion primitive, so every directory above
//! must live on one volume. `check_same_volume` verifies that at startup.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};
use crate::tasks::Stage;

/// Well-known workspace directories.
pub mod paths {
    pub const TASKS: &str = "tasks";
    pub const AGENTS: &str = "agents";
    pub const CONTEXT: &str = "context";
}

/// Filesystem layout rooted at the workspace path.
#[derive(Debug, Clone)]
pub struct Workspace {
    base_path: PathBuf,
}

impl Workspace {
    /// Create a new workspace rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding task records of one lifecycle stage.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.base_path.join(paths::TASKS).join(stage.dir_name())
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.base_path.join(paths::AGENTS)
    }

    pub fn context_dir(&self) -> PathBuf {
        self.base_path.join(paths::CONTEXT)
    }

    /// Every directory the protocol touches.
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Stage::ALL.iter().map(|s| self.stage_dir(*s)).collect();
        dirs.push(self.agents_dir());
        dirs.push(self.context_dir());
        dirs
    }

    /// Ensure the workspace directory structure exists.
    pub async fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in self.all_dirs() {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Verify that all protocol directories share one filesystem volume.
    ///
    /// Cross-volume renames are copies, which breaks claim exclusivity.
    #[cfg(unix)]
    pub async fn check_same_volume(&self) -> Result<(), ConfigError> {
        use std::os::unix::fs::MetadataExt;

        let mut expected: Option<(u64, PathBuf)> = None;
        for dir in self.all_dirs() {
            let dev = fs::metadata(&dir).await?.dev();
            match &expected {
                None => expected = Some((dev, dir)),
                Some((first, first_dir)) if *first != dev => {
                    return Err(ConfigError::Precondition(format!(
                        "{} and {} are on different volumes; atomic rename cannot be guaranteed",
                        first_dir.display(),
                        dir.display()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn check_same_volume(&self) -> Result<(), ConfigError> {
        tracing::warn!("Same-volume check unsupported on this platform; assuming a single volume");
        Ok(())
    }
}

/// Write `value` as pretty JSON to `path` without readers ever observing a
/// partial file: write a sibling temp file, then rename over the target.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read and parse a JSON file. A vanished file is `NotFound`; a file that
/// does not parse is `Corrupt`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Whether a directory entry name is a visible JSON record (not a temp file).
pub fn is_record_file(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".json")
}
