use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_PREFIX: &str = "task-";

/// Executor class a task is dispatched to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Opus,
    Auto,
    Glm,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Opus => "opus",
            WorkerType::Auto => "auto",
            WorkerType::Glm => "glm",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
}

impl TaskStatus {
    /// Holds a capacity slot and exclusively owns its worktree and session.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    /// States a cancellation request can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub worker_type: WorkerType,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub status: TaskStatus,
    pub tmux_session: String,
    pub worktree_path: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_issue_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    /// Milliseconds between start and completion, when finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let finished = self.completed_at?;
        u64::try_from((finished - self.started_at).num_milliseconds()).ok()
    }
}

/// Inbound `POST /tasks` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    pub task_id: String,
    pub worker_type: WorkerType,
    pub prompt: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub linear_issue_id: Option<String>,
    #[serde(default)]
    pub linear_issue_title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
}

impl TaskSubmission {
    /// Field-level checks that do not need orchestrator state.
    pub fn validate(&self) -> Result<(), String> {
        let task_id = self.task_id.trim();
        if task_id.is_empty() {
            return Err("taskId is required".to_string());
        }
        if task_id.len() > 128
            || !task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || task_id.starts_with('.')
        {
            return Err("taskId may only contain letters, digits, '-', '_' and '.'".to_string());
        }
        if self.prompt.trim().is_empty() {
            return Err("prompt is required".to_string());
        }
        if self.webhook_secret.is_empty() {
            return Err("webhookSecret is required".to_string());
        }
        match reqwest::Url::parse(&self.webhook_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(format!(
                    "webhookUrl must use http or https, got '{}'",
                    url.scheme()
                ))
            }
            Err(err) => return Err(format!("webhookUrl is not a valid URL: {err}")),
        }
        for (name, value) in [
            ("repository", &self.repository),
            ("baseBranch", &self.base_branch),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(format!("{name} must not be blank when provided"));
            }
        }
        Ok(())
    }
}

/// Short-lived version-control credential. Replaced wholesale on refresh.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Completed,
    Failed,
    Interrupted,
}

/// Body of the completion notification sent to the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub task_id: String,
    pub status: WebhookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl WebhookPayload {
    pub fn for_task(task: &TaskRecord, status: WebhookStatus) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status,
            result: task.result.clone(),
            error: task.error.clone(),
            duration: task.duration_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryAttempt {
    pub task_id: String,
    pub url: String,
    pub secret: String,
    pub payload: WebhookPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl WebhookDeliveryAttempt {
    /// Queue entries carry no id of their own; task + enqueue time is unique
    /// enough to find an entry again after the queue was reloaded.
    pub fn same_entry(&self, other: &WebhookDeliveryAttempt) -> bool {
        self.task_id == other.task_id && self.enqueued_at == other.enqueued_at
    }
}

/// The single persisted aggregate.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub tasks: HashMap<String, TaskRecord>,
    pub credential: Option<Credential>,
    pub pending_webhooks: Vec<WebhookDeliveryAttempt>,
}

impl OrchestratorState {
    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status.is_active())
            .count()
    }

    pub fn active_worktrees(&self) -> HashSet<PathBuf> {
        self.tasks
            .values()
            .filter(|task| task.status.is_active())
            .map(|task| task.worktree_path.clone())
            .collect()
    }
}
