use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{ExecutionBackend, ExecutionStatus};
use crate::types::{Credential, TaskRecord};

#[derive(Default)]
struct LocalState {
    running: HashMap<String, ExecutionStatus>,
    started: Vec<String>,
    stopped: Vec<String>,
    fail_starts: bool,
}

/// In-process backend. Tasks stay `Running` until [`LocalBackend::finish`]
/// or [`LocalBackend::fail`] is called; nothing is spawned.
#[derive(Default)]
pub struct LocalBackend {
    state: Mutex<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("local backend state poisoned"))
    }

    /// Mark a launched task as completed with the given result.
    pub fn finish(&self, task_id: &str, result: Option<Value>) -> Result<()> {
        self.set(task_id, ExecutionStatus::Completed { result })
    }

    pub fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<()> {
        self.set(
            task_id,
            ExecutionStatus::Failed {
                error: error.into(),
            },
        )
    }

    /// Make every subsequent `start` fail.
    pub fn fail_starts(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_starts = fail;
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.started.clone())
            .unwrap_or_default()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.stopped.clone())
            .unwrap_or_default()
    }

    fn set(&self, task_id: &str, status: ExecutionStatus) -> Result<()> {
        let mut state = self.lock()?;
        match state.running.get_mut(task_id) {
            Some(slot) => {
                *slot = status;
                Ok(())
            }
            None => bail!("task {task_id} was never started"),
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn start(&self, task: &TaskRecord, _credential: Option<&Credential>) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_starts {
            bail!("local backend refused to start {}", task.task_id);
        }
        state
            .running
            .insert(task.task_id.clone(), ExecutionStatus::Running);
        state.started.push(task.task_id.clone());
        Ok(())
    }

    async fn stop(&self, task: &TaskRecord) -> Result<()> {
        let mut state = self.lock()?;
        state.running.remove(&task.task_id);
        state.stopped.push(task.task_id.clone());
        Ok(())
    }

    async fn status(&self, task: &TaskRecord) -> Result<ExecutionStatus> {
        let state = self.lock()?;
        Ok(state
            .running
            .get(&task.task_id)
            .cloned()
            .unwrap_or_else(|| ExecutionStatus::Failed {
                error: "worker process is gone".to_string(),
            }))
    }
}
