//! Capability requests carried in a task's context.
//!
//! A task names its work as `context.request` (one object) or
//! `context.requests` (a list), each tagged by `op`:
//!
//! ```json
//! {"op": "write_file", "path": "hello.py", "content": "print('hi')"}
//! ```
//!
//! Requests are parsed once at the boundary; execution matches exhaustively.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutorError;
use crate::tasks::TaskContext;

/// HTTP method for an `http` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

/// One operation an agent can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CapabilityRequest {
    /// Run a command through `sh -c`.
    Shell {
        command: String,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Run `git <args>` (no shell) in `repo`, default the workspace root.
    Git {
        args: Vec<String>,
        #[serde(default)]
        repo: Option<String>,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    AppendFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    ListDir {
        #[serde(default = "current_dir")]
        path: String,
    },
    CreateDir {
        path: String,
    },
    Exists {
        path: String,
    },
    CopyFile {
        from: String,
        to: String,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        /// Fail the request unless the response has this status.
        #[serde(default)]
        expect_status: Option<u16>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Run one SQL statement with positional parameters.
    Sql {
        query: String,
        #[serde(default)]
        params: Vec<Value>,
    },
}

fn current_dir() -> String {
    ".".to_string()
}

impl CapabilityRequest {
    /// The `op` tag.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::Git { .. } => "git",
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::AppendFile { .. } => "append_file",
            Self::DeleteFile { .. } => "delete_file",
            Self::ListDir { .. } => "list_dir",
            Self::CreateDir { .. } => "create_dir",
            Self::Exists { .. } => "exists",
            Self::CopyFile { .. } => "copy_file",
            Self::Http { .. } => "http",
            Self::Sql { .. } => "sql",
        }
    }

    /// Capability tag an agent needs for this operation.
    pub fn capability(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "command_execution",
            Self::Git { .. } => "git_operations",
            Self::ReadFile { .. }
            | Self::WriteFile { .. }
            | Self::AppendFile { .. }
            | Self::DeleteFile { .. }
            | Self::ListDir { .. }
            | Self::CreateDir { .. }
            | Self::Exists { .. }
            | Self::CopyFile { .. } => "file_operations",
            Self::Http { .. } => "http_requests",
            Self::Sql { .. } => "sql_queries",
        }
    }

    fn parse(value: &Value) -> Result<Self, ExecutorError> {
        serde_json::from_value(value.clone()).map_err(|e| ExecutorError::InvalidRequest {
            reason: e.to_string(),
        })
    }
}

/// Parse the requests a task carries. `requests` wins over `request`.
pub fn requests_from(context: &TaskContext) -> Result<Vec<CapabilityRequest>, ExecutorError> {
    if let Some(list) = context.get("requests") {
        let items = list.as_array().ok_or_else(|| ExecutorError::InvalidRequest {
            reason: "`requests` must be an array".to_string(),
        })?;
        if items.is_empty() {
            return Err(ExecutorError::NoRequest);
        }
        return items.iter().map(CapabilityRequest::parse).collect();
    }

    match context.get("request") {
        Some(single) => Ok(vec![CapabilityRequest::parse(single)?]),
        None => Err(ExecutorError::NoRequest),
    }
}
