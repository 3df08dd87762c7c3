//! Admission control and lifecycle transitions for dispatched tasks.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::backend::{ExecutionBackend, ExecutionStatus};
use crate::credentials::CredentialRefresher;
use crate::error::{DispatchError, StoreError};
use crate::state::SharedState;
use crate::types::{
    TaskRecord, TaskStatus, TaskSubmission, WebhookPayload, WebhookStatus, SESSION_PREFIX,
};
use crate::webhook::WebhookDelivery;

const INTERRUPTED_REASON: &str = "orchestrator restarted while the task was in flight";

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Maximum number of active (queued or running) tasks.
    pub capacity: usize,
    /// Each task gets `<worktrees_root>/<taskId>`.
    pub worktrees_root: PathBuf,
}

/// Result of one task-poll tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct TaskDispatcher {
    config: DispatcherConfig,
    state: Arc<SharedState>,
    backend: Arc<dyn ExecutionBackend>,
    credentials: Arc<CredentialRefresher>,
    webhooks: Arc<WebhookDelivery>,
}

impl TaskDispatcher {
    pub fn new(
        config: DispatcherConfig,
        state: Arc<SharedState>,
        backend: Arc<dyn ExecutionBackend>,
        credentials: Arc<CredentialRefresher>,
        webhooks: Arc<WebhookDelivery>,
    ) -> Self {
        Self {
            config,
            state,
            backend,
            credentials,
            webhooks,
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn credentials(&self) -> &Arc<CredentialRefresher> {
        &self.credentials
    }

    pub fn webhooks(&self) -> &Arc<WebhookDelivery> {
        &self.webhooks
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Tasks currently holding a capacity slot.
    pub async fn running_count(&self) -> usize {
        self.state.read(|s| s.active_count()).await
    }

    /// Admit a task, persist it as `queued` and launch it in the background.
    pub async fn submit_task(
        self: &Arc<Self>,
        submission: TaskSubmission,
    ) -> Result<String, DispatchError> {
        submission.validate().map_err(DispatchError::Validation)?;

        let task_id = submission.task_id.trim().to_string();
        let record = TaskRecord {
            task_id: task_id.clone(),
            worker_type: submission.worker_type,
            prompt: submission.prompt,
            repository: submission.repository,
            base_branch: submission.base_branch,
            webhook_url: submission.webhook_url,
            webhook_secret: submission.webhook_secret,
            status: TaskStatus::Queued,
            tmux_session: format!("{SESSION_PREFIX}{task_id}"),
            worktree_path: self.config.worktrees_root.join(&task_id),
            started_at: Utc::now(),
            linear_issue_id: submission.linear_issue_id,
            linear_issue_title: submission.linear_issue_title,
            slug: submission.slug,
            action_id: submission.action_id,
            completed_at: None,
            result: None,
            error: None,
        };

        let capacity = self.config.capacity;
        self.state
            .update(|state| {
                if state
                    .tasks
                    .get(&task_id)
                    .is_some_and(|task| task.status.is_active())
                {
                    return Err(DispatchError::Validation(format!(
                        "task {task_id} is already active"
                    )));
                }
                if state.active_count() >= capacity {
                    return Err(DispatchError::AtCapacity { capacity });
                }
                state.tasks.insert(task_id.clone(), record);
                Ok(())
            })
            .await?;

        info!(task_id = %task_id, "task queued");

        let this = Arc::clone(self);
        let launch_id = task_id.clone();
        tokio::spawn(async move { this.launch(&launch_id).await });

        Ok(task_id)
    }

    async fn launch(&self, task_id: &str) {
        let Some(record) = self.get_task(task_id).await else {
            return;
        };
        if record.status != TaskStatus::Queued {
            return;
        }

        let credential = self.credentials.current();
        match self.backend.start(&record, credential.as_ref()).await {
            Ok(()) => {
                let promoted = self
                    .state
                    .update(|state| {
                        Ok::<_, StoreError>(match state.tasks.get_mut(task_id) {
                            Some(task) if task.status == TaskStatus::Queued => {
                                task.status = TaskStatus::Running;
                                true
                            }
                            _ => false,
                        })
                    })
                    .await;
                match promoted {
                    Ok(true) => info!(task_id, "task running"),
                    Ok(false) => {
                        // Cancelled while the worker was starting.
                        if let Err(err) = self.backend.stop(&record).await {
                            warn!(task_id, "failed to stop cancelled task: {err:#}");
                        }
                    }
                    Err(err) => error!(task_id, "failed to persist running state: {err}"),
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(task_id, "execution backend refused task: {reason}");
                self.finish(task_id, TaskStatus::Queued, TaskStatus::Failed, None, Some(reason))
                    .await;
            }
        }
    }

    /// Move `task_id` from `from` to a finished status and send the
    /// completion webhook. Does nothing if the task moved on meanwhile.
    async fn finish(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        failure: Option<String>,
    ) -> bool {
        let webhook_status = match to {
            TaskStatus::Completed => WebhookStatus::Completed,
            _ => WebhookStatus::Failed,
        };
        let updated = self
            .state
            .update(|state| {
                Ok::<_, StoreError>(match state.tasks.get_mut(task_id) {
                    Some(task) if task.status == from => {
                        task.status = to;
                        task.completed_at = Some(Utc::now());
                        task.result = result;
                        task.error = failure;
                        Some(task.clone())
                    }
                    _ => None,
                })
            })
            .await;

        let task = match updated {
            Ok(Some(task)) => task,
            Ok(None) => return false,
            Err(err) => {
                error!(task_id, "failed to persist task outcome: {err}");
                return false;
            }
        };

        info!(task_id, status = %task.status, duration_ms = ?task.duration_ms(), "task finished");
        let payload = WebhookPayload::for_task(&task, webhook_status);
        if let Err(err) = self
            .webhooks
            .send(&task.webhook_url, &task.webhook_secret, &payload, task_id)
            .await
        {
            error!(task_id, "failed to queue completion webhook: {err}");
        }
        true
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.state.read(|s| s.tasks.get(task_id).cloned()).await
    }

    /// Every known task, oldest first.
    pub async fn list_tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.state.read(|s| s.tasks.values().cloned().collect()).await;
        tasks.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    /// Mark a task cancelled and ask the backend to stop it.
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskRecord, DispatchError> {
        let (record, was_active) = self
            .state
            .update(|state| -> Result<_, DispatchError> {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))?;
                if task.status.is_terminal() {
                    return Err(DispatchError::AlreadyCompleted {
                        task_id: task_id.to_string(),
                        status: task.status,
                    });
                }
                let was_active = task.status.is_active();
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                Ok((task.clone(), was_active))
            })
            .await?;

        info!(task_id, "task cancelled");
        if was_active {
            if let Err(err) = self.backend.stop(&record).await {
                warn!(task_id, "failed to stop worker for cancelled task: {err:#}");
            }
        }
        Ok(record)
    }

    /// Ask the backend about every running task and record finished ones.
    pub async fn poll_tasks(&self) -> PollReport {
        let running: Vec<TaskRecord> = self
            .state
            .read(|s| {
                s.tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Running)
                    .cloned()
                    .collect()
            })
            .await;

        let mut report = PollReport {
            checked: running.len(),
            ..PollReport::default()
        };
        for task in running {
            let status = match self.backend.status(&task).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(task_id = %task.task_id, "status check failed: {err:#}");
                    continue;
                }
            };
            match status {
                ExecutionStatus::Running => {}
                ExecutionStatus::Completed { result } => {
                    if self
                        .finish(&task.task_id, TaskStatus::Running, TaskStatus::Completed, result, None)
                        .await
                    {
                        report.completed += 1;
                    }
                }
                ExecutionStatus::Failed { error } => {
                    if self
                        .finish(&task.task_id, TaskStatus::Running, TaskStatus::Failed, None, Some(error))
                        .await
                    {
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    /// Startup recovery: every task that was in flight when the previous
    /// process died gets an `interrupted` webhook attempt and is persisted
    /// as `interrupted`, whether or not the webhook went through.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, DispatchError> {
        let in_flight: Vec<TaskRecord> = self
            .state
            .read(|s| {
                let mut tasks: Vec<TaskRecord> = s
                    .tasks
                    .values()
                    .filter(|t| t.status.is_active())
                    .cloned()
                    .collect();
                tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
                tasks
            })
            .await;

        let mut recovered = Vec::with_capacity(in_flight.len());
        for task in in_flight {
            let mut payload = WebhookPayload::for_task(&task, WebhookStatus::Interrupted);
            payload.error = Some(INTERRUPTED_REASON.to_string());
            if let Err(err) = self
                .webhooks
                .send(&task.webhook_url, &task.webhook_secret, &payload, &task.task_id)
                .await
            {
                error!(task_id = %task.task_id, "failed to queue interrupted webhook: {err}");
            }

            self.state
                .update(|state| {
                    if let Some(record) = state.tasks.get_mut(&task.task_id) {
                        record.status = TaskStatus::Interrupted;
                        record.error = Some(INTERRUPTED_REASON.to_string());
                    }
                    Ok::<_, StoreError>(())
                })
                .await?;
            warn!(task_id = %task.task_id, previous = %task.status, "task marked interrupted");
            recovered.push(task.task_id);
        }
        Ok(recovered)
    }

    /// Final shutdown write of whatever is in memory.
    pub async fn persist_snapshot(&self) -> Result<(), DispatchError> {
        self.state.persist().await?;
        Ok(())
    }
}
