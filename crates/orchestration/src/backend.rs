use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Credential, TaskRecord};

/// What an execution backend reports for a launched task.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionStatus {
    Running,
    Completed { result: Option<Value> },
    Failed { error: String },
}

/// Launches and supervises the worker process behind a task.
///
/// Implementations own the task's worktree and session for as long as the
/// task is active. `stop` must tolerate a task that already exited.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn start(&self, task: &TaskRecord, credential: Option<&Credential>) -> Result<()>;

    async fn stop(&self, task: &TaskRecord) -> Result<()>;

    async fn status(&self, task: &TaskRecord) -> Result<ExecutionStatus>;
}
