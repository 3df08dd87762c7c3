use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Value};
use taskd_orchestration::{
    CredentialRefresher, DispatchError, DispatcherConfig, LocalBackend, OrchestratorState,
    SharedState, StateStore, TaskDispatcher, TaskRecord, TaskStatus, TaskSubmission,
    UnconfiguredIssuer, WebhookDelivery, WebhookHttpClient, WorkerType,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

/// Records webhook bodies and answers every call with `status`.
struct RecordingClient {
    status: Mutex<Result<u16, String>>,
    bodies: Mutex<Vec<Value>>,
}

impl RecordingClient {
    fn new(status: Result<u16, String>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            bodies: Mutex::new(Vec::new()),
        })
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookHttpClient for RecordingClient {
    async fn post(
        &self,
        _url: &str,
        _headers: Vec<(String, String)>,
        body: Vec<u8>,
        _timeout: Duration,
    ) -> Result<u16, String> {
        self.bodies
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&body).unwrap());
        self.status.lock().unwrap().clone()
    }
}

struct Harness {
    _temp: TempDir,
    state_path: PathBuf,
    backend: Arc<LocalBackend>,
    client: Arc<RecordingClient>,
    dispatcher: Arc<TaskDispatcher>,
}

async fn harness_with(capacity: usize, initial: Option<OrchestratorState>) -> Harness {
    let temp = TempDir::new().unwrap();
    let state_path = temp.path().join("state/orchestrator.json");
    let store = Arc::new(StateStore::new(&state_path));
    if let Some(initial) = initial {
        store.save(&initial).await.unwrap();
    }
    let state = Arc::new(SharedState::load(store).await.unwrap());
    let backend = Arc::new(LocalBackend::new());
    let client = RecordingClient::new(Ok(200));
    let webhooks = Arc::new(WebhookDelivery::new(client.clone(), state.clone()));
    let credentials =
        Arc::new(CredentialRefresher::from_state(Arc::new(UnconfiguredIssuer), state.clone()).await);
    let dispatcher = Arc::new(TaskDispatcher::new(
        DispatcherConfig {
            capacity,
            worktrees_root: temp.path().join("worktrees"),
        },
        state,
        backend.clone(),
        credentials,
        webhooks,
    ));
    Harness {
        _temp: temp,
        state_path,
        backend,
        client,
        dispatcher,
    }
}

async fn harness(capacity: usize) -> Harness {
    harness_with(capacity, None).await
}

fn submission(id: &str) -> TaskSubmission {
    serde_json::from_value(json!({
        "taskId": id,
        "workerType": "auto",
        "prompt": "make the build green",
        "webhookUrl": "https://caller.example/hooks/task",
        "webhookSecret": "whsec_test",
        "repository": "acme/app",
        "linearIssueId": "LIN-7"
    }))
    .unwrap()
}

async fn wait_for(dispatcher: &TaskDispatcher, id: &str, status: TaskStatus) -> TaskRecord {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(task) = dispatcher.get_task(id).await {
                if task.status == status {
                    return task;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status}"))
}

async fn on_disk(path: &PathBuf) -> OrchestratorState {
    StateStore::new(path).load().await.unwrap()
}

#[tokio::test]
async fn submitted_task_is_persisted_and_started() -> Result<()> {
    let h = harness(2).await;
    let id = h.dispatcher.submit_task(submission("t1")).await?;
    assert_eq!(id, "t1");

    let task = wait_for(&h.dispatcher, "t1", TaskStatus::Running).await;
    assert_eq!(task.tmux_session, "task-t1");
    assert!(task.worktree_path.ends_with("worktrees/t1"));
    assert_eq!(task.worker_type, WorkerType::Auto);
    assert_eq!(task.linear_issue_id.as_deref(), Some("LIN-7"));
    assert_eq!(h.backend.started(), vec!["t1".to_string()]);

    let persisted = on_disk(&h.state_path).await;
    assert_eq!(persisted.tasks["t1"].status, TaskStatus::Running);
    Ok(())
}

#[tokio::test]
async fn capacity_is_never_exceeded_under_concurrent_submission() -> Result<()> {
    let h = harness(3).await;
    let attempts = (0..10).map(|i| {
        let dispatcher = h.dispatcher.clone();
        async move { dispatcher.submit_task(submission(&format!("t{i}"))).await }
    });
    let results = join_all(attempts).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(DispatchError::AtCapacity { capacity: 3 })))
        .count();
    assert_eq!(accepted, 3);
    assert_eq!(rejected, 7);
    assert_eq!(h.dispatcher.running_count().await, 3);
    assert_eq!(on_disk(&h.state_path).await.tasks.len(), 3);
    Ok(())
}

#[tokio::test]
async fn at_capacity_until_a_slot_frees_up() -> Result<()> {
    let h = harness(1).await;
    h.dispatcher.submit_task(submission("t1")).await?;
    let err = h.dispatcher.submit_task(submission("t2")).await.unwrap_err();
    assert_eq!(err.code(), "at_capacity");

    h.dispatcher.cancel_task("t1").await?;
    h.dispatcher.submit_task(submission("t2")).await?;
    assert_eq!(h.dispatcher.running_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn invalid_or_duplicate_submissions_are_rejected() -> Result<()> {
    let h = harness(4).await;
    let mut bad = submission("t1");
    bad.webhook_url = "not a url".into();
    assert!(matches!(
        h.dispatcher.submit_task(bad).await,
        Err(DispatchError::Validation(_))
    ));

    h.dispatcher.submit_task(submission("t1")).await?;
    let err = h.dispatcher.submit_task(submission("t1")).await.unwrap_err();
    assert!(matches!(err, DispatchError::Validation(ref msg) if msg.contains("already active")));
    assert_eq!(h.dispatcher.running_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_semantics() -> Result<()> {
    let h = harness(2).await;
    h.dispatcher.submit_task(submission("t1")).await?;
    wait_for(&h.dispatcher, "t1", TaskStatus::Running).await;

    let cancelled = h.dispatcher.cancel_task("t1").await?;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(h.dispatcher.running_count().await, 0);
    assert_eq!(h.backend.stopped(), vec!["t1".to_string()]);
    assert_eq!(
        on_disk(&h.state_path).await.tasks["t1"].status,
        TaskStatus::Cancelled
    );

    let again = h.dispatcher.cancel_task("t1").await.unwrap_err();
    assert!(matches!(
        again,
        DispatchError::AlreadyCompleted {
            status: TaskStatus::Cancelled,
            ..
        }
    ));
    assert!(matches!(
        h.dispatcher.cancel_task("missing").await,
        Err(DispatchError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn completed_task_cannot_be_cancelled() -> Result<()> {
    let h = harness(2).await;
    h.dispatcher.submit_task(submission("t1")).await?;
    wait_for(&h.dispatcher, "t1", TaskStatus::Running).await;
    h.backend.finish("t1", Some(json!({ "prUrl": "https://example/pr/9" })))?;
    h.dispatcher.poll_tasks().await;

    let err = h.dispatcher.cancel_task("t1").await.unwrap_err();
    assert_eq!(err.code(), "already_completed");
    Ok(())
}

#[tokio::test]
async fn refused_start_fails_task_and_notifies() -> Result<()> {
    let h = harness(2).await;
    h.backend.fail_starts(true);
    h.dispatcher.submit_task(submission("t1")).await?;

    let task = wait_for(&h.dispatcher, "t1", TaskStatus::Failed).await;
    assert!(task.error.unwrap().contains("refused"));
    assert_eq!(h.dispatcher.running_count().await, 0);

    let bodies = h.client.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["taskId"], "t1");
    assert_eq!(bodies[0]["status"], "failed");
    Ok(())
}

#[tokio::test]
async fn poll_records_outcomes_and_sends_webhooks() -> Result<()> {
    let h = harness(3).await;
    for id in ["t1", "t2", "t3"] {
        h.dispatcher.submit_task(submission(id)).await?;
        wait_for(&h.dispatcher, id, TaskStatus::Running).await;
    }
    h.backend.finish("t1", Some(json!({ "prUrl": "https://example/pr/1" })))?;
    h.backend.fail("t2", "tests failed")?;

    let report = h.dispatcher.poll_tasks().await;
    assert_eq!(report.checked, 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.dispatcher.running_count().await, 1);

    let t1 = h.dispatcher.get_task("t1").await.unwrap();
    assert_eq!(t1.status, TaskStatus::Completed);
    assert!(t1.completed_at.is_some());

    let mut bodies = h.client.bodies();
    bodies.sort_by(|a, b| a["taskId"].as_str().cmp(&b["taskId"].as_str()));
    assert_eq!(bodies[0]["status"], "completed");
    assert_eq!(bodies[0]["result"]["prUrl"], "https://example/pr/1");
    assert!(bodies[0]["duration"].is_u64());
    assert_eq!(bodies[1]["status"], "failed");
    assert_eq!(bodies[1]["error"], "tests failed");

    // A second tick does not re-announce finished tasks.
    h.dispatcher.poll_tasks().await;
    assert_eq!(h.client.bodies().len(), 2);
    Ok(())
}

fn record(id: &str, status: TaskStatus) -> TaskRecord {
    TaskRecord {
        task_id: id.to_string(),
        worker_type: WorkerType::Opus,
        prompt: "p".into(),
        repository: None,
        base_branch: None,
        webhook_url: "https://caller.example/hooks/task".into(),
        webhook_secret: "whsec_test".into(),
        status,
        tmux_session: format!("task-{id}"),
        worktree_path: PathBuf::from(format!("/wt/{id}")),
        started_at: Utc::now(),
        linear_issue_id: None,
        linear_issue_title: None,
        slug: None,
        action_id: None,
        completed_at: None,
        result: None,
        error: None,
    }
}

#[tokio::test]
async fn restart_marks_in_flight_tasks_interrupted() -> Result<()> {
    let mut previous = OrchestratorState::default();
    for (id, status) in [
        ("a", TaskStatus::Running),
        ("b", TaskStatus::Running),
        ("c", TaskStatus::Completed),
    ] {
        previous.tasks.insert(id.to_string(), record(id, status));
    }
    let h = harness_with(4, Some(previous)).await;
    // The caller is down; the interrupted notices must be queued.
    *h.client.status.lock().unwrap() = Err("connection refused".into());

    let recovered = h.dispatcher.recover_interrupted().await?;
    assert_eq!(recovered, vec!["a".to_string(), "b".to_string()]);

    let persisted = on_disk(&h.state_path).await;
    assert_eq!(persisted.tasks["a"].status, TaskStatus::Interrupted);
    assert_eq!(persisted.tasks["b"].status, TaskStatus::Interrupted);
    assert_eq!(persisted.tasks["c"].status, TaskStatus::Completed);

    let mut queued: Vec<_> = persisted
        .pending_webhooks
        .iter()
        .map(|e| (e.task_id.clone(), serde_json::to_value(&e.payload).unwrap()["status"].clone()))
        .collect();
    queued.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        queued,
        vec![
            ("a".to_string(), json!("interrupted")),
            ("b".to_string(), json!("interrupted")),
        ]
    );
    assert_eq!(h.dispatcher.running_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn interrupted_task_can_still_be_cancelled() -> Result<()> {
    let mut previous = OrchestratorState::default();
    previous
        .tasks
        .insert("a".into(), record("a", TaskStatus::Interrupted));
    let h = harness_with(1, Some(previous)).await;

    let cancelled = h.dispatcher.cancel_task("a").await?;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(h.backend.stopped().is_empty());
    Ok(())
}

#[tokio::test]
async fn list_and_snapshot() -> Result<()> {
    let h = harness(2).await;
    h.dispatcher.submit_task(submission("t1")).await?;
    h.dispatcher.submit_task(submission("t2")).await?;
    let ids: Vec<String> = h
        .dispatcher
        .list_tasks()
        .await
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"t1".to_string()));

    std::fs::remove_file(&h.state_path)?;
    h.dispatcher.persist_snapshot().await?;
    assert_eq!(on_disk(&h.state_path).await.tasks.len(), 2);
    Ok(())
}
