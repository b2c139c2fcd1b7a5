//! Built-in capability executor.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::ContextSnapshot;
use crate::error::ExecutorError;
use crate::executor::file::FileSandbox;
use crate::executor::http::{HttpCall, HttpCapability};
use crate::executor::request::{CapabilityRequest, requests_from};
use crate::executor::shell::{CommandOutput, ShellRunner};
use crate::executor::sql::SqlCapability;
use crate::executor::{ExecutionOutput, Executor};
use crate::tasks::TaskRecord;

/// Runs the requests a task carries, in order, stopping at the first error.
///
/// A single request's output is the task result; several produce
/// `{"steps": [...]}`.
#[derive(Debug)]
pub struct BuiltinExecutor {
    files: FileSandbox,
    shell: ShellRunner,
    http: HttpCapability,
    sql: SqlCapability,
}

impl BuiltinExecutor {
    pub fn new(files: FileSandbox, shell: ShellRunner, http: HttpCapability, sql: SqlCapability) -> Self {
        Self {
            files,
            shell,
            http,
            sql,
        }
    }

    /// Execute one request.
    pub async fn run(&self, request: &CapabilityRequest) -> Result<Value, ExecutorError> {
        match request {
            CapabilityRequest::Shell {
                command,
                workdir,
                timeout_secs,
            } => {
                let cwd = workdir
                    .as_deref()
                    .map(|w| self.files.resolve(w))
                    .transpose()?;
                let out = self
                    .shell
                    .run_shell(command, cwd.as_deref(), timeout_secs.map(Duration::from_secs))
                    .await?;
                command_result("shell", out)
            }
            CapabilityRequest::Git { args, repo } => {
                let repo = self.files.resolve(repo.as_deref().unwrap_or("."))?;
                let out = self.shell.run_git(args, &repo).await?;
                command_result("git", out)
            }
            CapabilityRequest::ReadFile { path } => self.files.read(path).await,
            CapabilityRequest::WriteFile { path, content } => self.files.write(path, content).await,
            CapabilityRequest::AppendFile { path, content } => {
                self.files.append(path, content).await
            }
            CapabilityRequest::DeleteFile { path } => self.files.delete(path).await,
            CapabilityRequest::ListDir { path } => self.files.list(path).await,
            CapabilityRequest::CreateDir { path } => self.files.create_dir(path).await,
            CapabilityRequest::Exists { path } => self.files.exists(path).await,
            CapabilityRequest::CopyFile { from, to } => self.files.copy(from, to).await,
            CapabilityRequest::Http {
                method,
                url,
                headers,
                body,
                expect_status,
                timeout_secs,
            } => {
                self.http
                    .send(HttpCall {
                        method: *method,
                        url,
                        headers,
                        body: body.as_ref(),
                        expect_status: *expect_status,
                        timeout_secs: *timeout_secs,
                    })
                    .await
            }
            CapabilityRequest::Sql { query, params } => self.sql.run(query, params).await,
        }
    }
}

/// A non-zero exit fails the request; the output becomes the error text.
fn command_result(op: &str, out: CommandOutput) -> Result<Value, ExecutorError> {
    if !out.success {
        return Err(ExecutorError::Failed {
            op: op.to_string(),
            reason: format!("exit code {}: {}", out.exit_code, out.output.trim()),
        });
    }
    serde_json::to_value(out).map_err(|e| ExecutorError::Failed {
        op: op.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Executor for BuiltinExecutor {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn execute(
        &self,
        task: &TaskRecord,
        prior: &[ContextSnapshot],
    ) -> Result<ExecutionOutput, ExecutorError> {
        let requests = requests_from(&task.context)?;
        debug!(
            task_id = %task.id,
            requests = requests.len(),
            prior = prior.len(),
            "Executing capability requests"
        );

        let mut outputs = Vec::with_capacity(requests.len());
        for request in &requests {
            let output = self.run(request).await?;
            info!(task_id = %task.id, op = request.op(), "Capability request done");
            outputs.push(json!({ "op": request.op(), "output": output }));
        }

        let result = if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            json!({ "steps": outputs })
        };
        Ok(ExecutionOutput::value(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskContext;
    use tempfile::TempDir;

    fn executor(dir: &TempDir) -> BuiltinExecutor {
        BuiltinExecutor::new(
            FileSandbox::new(dir.path()),
            ShellRunner::new(dir.path()),
            HttpCapability::new(),
            SqlCapability::new(dir.path().join("data/agent.db")),
        )
    }

    fn task_with(request: Value) -> TaskRecord {
        TaskRecord::new("d", "file_operations")
            .with_context(TaskContext::with_goal("g").with("request", request))
    }

    #[tokio::test]
    async fn single_request_result() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        let task = task_with(json!({"op": "write_file", "path": "hello.py", "content": "print(1)"}));

        let out = exec.execute(&task, &[]).await.unwrap();
        assert_eq!(out.result["op"], "write_file");
        assert_eq!(out.result["output"]["bytes_written"], 8);
        assert!(out.breakdown.is_none());
        assert!(dir.path().join("hello.py").exists());
    }

    #[tokio::test]
    async fn request_list_runs_in_order() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        let task = TaskRecord::new("d", "t").with_context(TaskContext::default().with(
            "requests",
            json!([
                {"op": "write_file", "path": "a.txt", "content": "one"},
                {"op": "shell", "command": "cat a.txt"},
            ]),
        ));

        let out = exec.execute(&task, &[]).await.unwrap();
        let steps = out.result["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[1]["output"]["output"].as_str().unwrap().contains("one"));
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        let task = task_with(json!({"op": "shell", "command": "exit 1"}));
        let err = exec.execute(&task, &[]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Failed { .. }));
    }

    #[tokio::test]
    async fn shell_workdir_is_sandboxed() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        let task = task_with(json!({"op": "shell", "command": "ls", "workdir": "../.."}));
        let err = exec.execute(&task, &[]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn missing_request_is_an_error() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        let err = exec
            .execute(&TaskRecord::new("d", "t"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NoRequest));
    }
}
