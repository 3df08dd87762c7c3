//! Backend that runs each task in its own git worktree and detached tmux
//! session.
//!
//! The worker is expected to leave `.taskd-result.json` in its worktree
//! before exiting:
//!
//! ```json
//! { "status": "completed", "result": { "prUrl": "..." } }
//! { "status": "failed", "error": "tests did not pass" }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use taskd_common::CommandRunner;
use tracing::{debug, info, warn};

use crate::backend::{ExecutionBackend, ExecutionStatus};
use crate::types::{Credential, TaskRecord, WorkerType};
use crate::worktree::absolute_path;

pub const PROMPT_FILE: &str = ".taskd-prompt.md";
pub const RESULT_FILE: &str = ".taskd-result.json";
const BRANCH_PREFIX: &str = "taskd/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
enum WorkerOutcome {
    Completed {
        #[serde(default)]
        result: Option<Value>,
    },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

pub struct TmuxBackend {
    runner: Arc<dyn CommandRunner>,
    repo_path: PathBuf,
    worker_commands: HashMap<WorkerType, String>,
}

impl TmuxBackend {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        repo_path: impl Into<PathBuf>,
        worker_commands: HashMap<WorkerType, String>,
    ) -> Self {
        Self {
            runner,
            repo_path: repo_path.into(),
            worker_commands,
        }
    }

    fn command_for(&self, worker: WorkerType) -> Result<&str> {
        self.worker_commands
            .get(&worker)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no worker command configured for '{worker}'"))
    }

    async fn add_worktree(&self, task: &TaskRecord, worktree: &Path) -> Result<()> {
        if tokio::fs::try_exists(worktree).await.unwrap_or(false) {
            bail!("worktree path {} already exists", worktree.display());
        }
        let path = path_arg(worktree)?;
        let branch = format!("{BRANCH_PREFIX}{}", task.task_id);
        let base = task.base_branch.as_deref().unwrap_or("HEAD");
        self.runner
            .run(
                "git",
                &["worktree", "add", "-b", branch.as_str(), path, base],
                Some(&self.repo_path),
            )
            .await?
            .into_success("git worktree add")?;
        Ok(())
    }

    async fn read_outcome(&self, task: &TaskRecord) -> Result<ExecutionStatus> {
        let path = absolute_path(&task.worktree_path).join(RESULT_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ExecutionStatus::Failed {
                    error: "worker exited without writing a result".to_string(),
                })
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let outcome = match serde_json::from_slice::<WorkerOutcome>(&raw) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(task_id = %task.task_id, "unreadable worker result: {err}");
                return Ok(ExecutionStatus::Failed {
                    error: format!("unreadable worker result: {err}"),
                });
            }
        };
        Ok(match outcome {
            WorkerOutcome::Completed { result } => ExecutionStatus::Completed { result },
            WorkerOutcome::Failed { error } => ExecutionStatus::Failed {
                error: error.unwrap_or_else(|| "worker reported failure".to_string()),
            },
        })
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path {} is not valid UTF-8", path.display()))
}

fn missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("no server running")
}

#[async_trait]
impl ExecutionBackend for TmuxBackend {
    async fn start(&self, task: &TaskRecord, credential: Option<&Credential>) -> Result<()> {
        let command = self.command_for(task.worker_type)?.to_string();
        // Relative task paths belong to our working directory, not the repository's.
        let worktree = absolute_path(&task.worktree_path);
        self.add_worktree(task, &worktree).await?;

        let prompt_path = worktree.join(PROMPT_FILE);
        tokio::fs::write(&prompt_path, &task.prompt)
            .await
            .with_context(|| format!("failed to write {}", prompt_path.display()))?;

        let cwd = path_arg(&worktree)?;
        let mut env = vec![
            format!(
                "GITHUB_TOKEN={}",
                credential.map(|c| c.token.as_str()).unwrap_or_default()
            ),
            format!("TASKD_TASK_ID={}", task.task_id),
            format!("TASKD_PROMPT_FILE={PROMPT_FILE}"),
        ];
        if let Some(repo) = task.repository.as_deref() {
            env.push(format!("TASKD_REPOSITORY={repo}"));
        }

        let mut args = vec!["new-session", "-d", "-s", task.tmux_session.as_str(), "-c", cwd];
        for pair in &env {
            args.push("-e");
            args.push(pair.as_str());
        }
        args.push(command.as_str());

        self.runner
            .run("tmux", &args, None)
            .await?
            .into_success("tmux new-session")?;

        info!(
            task_id = %task.task_id,
            session = %task.tmux_session,
            worker = %task.worker_type,
            "worker session started"
        );
        Ok(())
    }

    async fn stop(&self, task: &TaskRecord) -> Result<()> {
        let output = self
            .runner
            .run("tmux", &["kill-session", "-t", task.tmux_session.as_str()], None)
            .await?;
        if output.success() || missing_session(&output.stderr) {
            debug!(task_id = %task.task_id, "worker session stopped");
            return Ok(());
        }
        output.into_success("tmux kill-session").map(|_| ())
    }

    async fn status(&self, task: &TaskRecord) -> Result<ExecutionStatus> {
        let output = self
            .runner
            .run("tmux", &["has-session", "-t", task.tmux_session.as_str()], None)
            .await?;
        if output.success() {
            return Ok(ExecutionStatus::Running);
        }
        if output.status.is_none() {
            bail!("tmux has-session terminated by signal");
        }
        self.read_outcome(task).await
    }
}
