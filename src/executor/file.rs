//! Sandboxed file operations.
//!
//! Every path is resolved against the workspace root and must stay under it:
//! - Lexical normalization for paths that do not exist yet
//! - Size limits on read/write operations
//! - Capped directory listings

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use serde_json::{Value, json};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ExecutorError;

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Normalize a path by resolving `.` and `..` components lexically (no filesystem access).
///
/// `canonicalize` only works on paths that exist, so new files are normalized
/// without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the nearest existing ancestor of `path` and re-append the rest.
fn canonical_with_missing_tail(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail_parts: Vec<&OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let mut result = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail_parts.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail_parts.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// File operations confined to one directory tree.
#[derive(Debug, Clone)]
pub struct FileSandbox {
    base: PathBuf,
    /// Subtrees that may be read but never modified.
    protected: Vec<PathBuf>,
}

impl FileSandbox {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: normalize_lexical(&base.into()),
            protected: Vec::new(),
        }
    }

    /// Mark subtrees (such as the task queue) as read-only.
    pub fn with_protected(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.protected = dirs.into_iter().map(|d| normalize_lexical(&d)).collect();
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `path_str` (relative to the base, or absolute) and refuse
    /// anything that escapes the base, including through symlinks or
    /// not-yet-existing parents.
    pub fn resolve(&self, path_str: &str) -> Result<PathBuf, ExecutorError> {
        let path = PathBuf::from(path_str);
        let joined = if path.is_absolute() {
            path
        } else {
            self.base.join(path)
        };
        let resolved = normalize_lexical(&joined);

        let base_canonical = self
            .base
            .canonicalize()
            .unwrap_or_else(|_| self.base.clone());
        let check_path = canonical_with_missing_tail(&resolved);

        if !check_path.starts_with(&base_canonical) {
            return Err(ExecutorError::NotAuthorized(format!(
                "Path escapes sandbox: {path_str}"
            )));
        }
        Ok(resolved)
    }

    /// `resolve`, additionally refusing protected subtrees.
    pub fn resolve_writable(&self, path_str: &str) -> Result<PathBuf, ExecutorError> {
        let path = self.resolve(path_str)?;
        if path == self.base {
            return Err(ExecutorError::NotAuthorized(
                "Refusing to modify the workspace root".to_string(),
            ));
        }
        if self.protected.iter().any(|p| path.starts_with(p)) {
            return Err(ExecutorError::NotAuthorized(format!(
                "Path is read-only: {path_str}"
            )));
        }
        Ok(path)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    pub async fn read(&self, path_str: &str) -> Result<Value, ExecutorError> {
        let path = self.resolve(path_str)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| failed("read_file", format!("Cannot access file: {e}")))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(failed(
                "read_file",
                format!(
                    "File too large ({} bytes). Maximum is {MAX_READ_SIZE} bytes.",
                    metadata.len()
                ),
            ));
        }
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| failed("read_file", format!("Failed to read file: {e}")))?;
        Ok(json!({
            "path": self.relative(&path),
            "content": content,
            "size": metadata.len(),
        }))
    }

    pub async fn write(&self, path_str: &str, content: &str) -> Result<Value, ExecutorError> {
        self.write_inner("write_file", path_str, content, false).await
    }

    pub async fn append(&self, path_str: &str, content: &str) -> Result<Value, ExecutorError> {
        self.write_inner("append_file", path_str, content, true).await
    }

    async fn write_inner(
        &self,
        op: &str,
        path_str: &str,
        content: &str,
        append: bool,
    ) -> Result<Value, ExecutorError> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(failed(
                op,
                format!(
                    "Content too large ({} bytes). Maximum is {MAX_WRITE_SIZE} bytes.",
                    content.len()
                ),
            ));
        }
        let path = self.resolve_writable(path_str)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(op, format!("Failed to create parent directories: {e}")))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(|e| failed(op, format!("Failed to open file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| failed(op, format!("Failed to write file: {e}")))?;
        file.flush().await?;

        Ok(json!({
            "path": self.relative(&path),
            "bytes_written": content.len(),
        }))
    }

    pub async fn delete(&self, path_str: &str) -> Result<Value, ExecutorError> {
        let path = self.resolve_writable(path_str)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| failed("delete_file", format!("Cannot access path: {e}")))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(json!({ "path": self.relative(&path), "deleted": true }))
    }

    pub async fn list(&self, path_str: &str) -> Result<Value, ExecutorError> {
        let path = self.resolve(path_str)?;
        let mut rd = fs::read_dir(&path)
            .await
            .map_err(|e| failed("list_dir", format!("Cannot read directory: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        // Directories first, then alphabetical.
        entries.sort_by(|a, b| {
            b.ends_with('/')
                .cmp(&a.ends_with('/'))
                .then_with(|| a.cmp(b))
        });
        let truncated = entries.len() > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);

        Ok(json!({
            "path": self.relative(&path),
            "entries": entries,
            "truncated": truncated,
        }))
    }

    pub async fn create_dir(&self, path_str: &str) -> Result<Value, ExecutorError> {
        let path = self.resolve_writable(path_str)?;
        fs::create_dir_all(&path).await?;
        Ok(json!({ "path": self.relative(&path), "created": true }))
    }

    pub async fn exists(&self, path_str: &str) -> Result<Value, ExecutorError> {
        let path = self.resolve(path_str)?;
        let metadata = fs::metadata(&path).await.ok();
        Ok(json!({
            "path": self.relative(&path),
            "exists": metadata.is_some(),
            "is_dir": metadata.as_ref().is_some_and(|m| m.is_dir()),
        }))
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<Value, ExecutorError> {
        let src = self.resolve(from)?;
        let dst = self.resolve_writable(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = fs::copy(&src, &dst)
            .await
            .map_err(|e| failed("copy_file", format!("Failed to copy: {e}")))?;
        Ok(json!({
            "from": self.relative(&src),
            "to": self.relative(&dst),
            "bytes_copied": bytes,
        }))
    }
}

fn failed(op: &str, reason: String) -> ExecutorError {
    ExecutorError::Failed {
        op: op.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (FileSandbox, TempDir) {
        let dir = TempDir::new().unwrap();
        (FileSandbox::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn write_append_read() {
        let (fs_box, _dir) = sandbox();
        fs_box.write("src/hello.py", "print('hi')\n").await.unwrap();
        fs_box.append("src/hello.py", "print('bye')\n").await.unwrap();

        let read = fs_box.read("src/hello.py").await.unwrap();
        assert_eq!(read["content"], "print('hi')\nprint('bye')\n");
        assert_eq!(read["path"], "src/hello.py");
    }

    #[tokio::test]
    async fn list_puts_directories_first() {
        let (fs_box, _dir) = sandbox();
        fs_box.write("b.txt", "").await.unwrap();
        fs_box.create_dir("zdir").await.unwrap();
        fs_box.write("a.txt", "").await.unwrap();

        let listing = fs_box.list(".").await.unwrap();
        assert_eq!(listing["entries"], json!(["zdir/", "a.txt", "b.txt"]));
        assert_eq!(listing["truncated"], false);
    }

    #[tokio::test]
    async fn copy_exists_delete() {
        let (fs_box, _dir) = sandbox();
        fs_box.write("a.txt", "data").await.unwrap();
        fs_box.copy("a.txt", "backup/a.txt").await.unwrap();
        assert_eq!(fs_box.exists("backup/a.txt").await.unwrap()["exists"], true);

        fs_box.delete("a.txt").await.unwrap();
        assert_eq!(fs_box.exists("a.txt").await.unwrap()["exists"], false);
        assert!(fs_box.delete(".").await.is_err());
    }

    #[test]
    fn rejects_relative_traversal() {
        let (fs_box, _dir) = sandbox();
        let result = fs_box.resolve("../../etc/passwd");
        assert!(matches!(result, Err(ExecutorError::NotAuthorized(_))));
    }

    #[test]
    fn rejects_traversal_via_missing_parent() {
        let (fs_box, dir) = sandbox();
        let evil = format!("{}/../../outside/newdir/file.txt", dir.path().display());
        assert!(fs_box.resolve(&evil).is_err());
        assert!(fs_box.resolve("/etc/hosts").is_err());
    }

    #[test]
    fn allows_dot_dot_within_sandbox() {
        let (fs_box, dir) = sandbox();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        assert!(fs_box.resolve("a/b/../c.txt").is_ok());
        assert!(fs_box.resolve("subdir/newfile.txt").is_ok());
    }

    #[tokio::test]
    async fn protected_subtrees_are_read_only() {
        let dir = TempDir::new().unwrap();
        let fs_box = FileSandbox::new(dir.path()).with_protected([dir.path().join("tasks")]);
        std::fs::create_dir_all(dir.path().join("tasks/pending")).unwrap();
        std::fs::write(dir.path().join("tasks/pending/T1.json"), "{}").unwrap();

        assert!(fs_box.read("tasks/pending/T1.json").await.is_ok());
        for result in [
            fs_box.write("tasks/pending/T2.json", "{}").await,
            fs_box.delete("tasks/pending/T1.json").await,
            fs_box.delete("tasks").await,
            fs_box.copy("tasks/pending/T1.json", "tasks/active/x_T1.json").await,
        ] {
            assert!(matches!(result, Err(ExecutorError::NotAuthorized(_))));
        }
        assert!(fs_box.write("notes/tasks.txt", "ok").await.is_ok());
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let (fs_box, _dir) = sandbox();
        let err = fs_box.read("nope.txt").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Failed { .. }));
    }
}
