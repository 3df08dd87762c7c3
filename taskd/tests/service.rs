use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use taskd::{service, Cli, Components, ServiceStatus, Settings};
use taskd_common::TokioCommandRunner;
use taskd_orchestration::{
    CredentialRefresher, DispatcherConfig, LocalBackend, OrchestratorState, SharedState,
    StateStore, TaskDispatcher, TaskRecord, TaskStatus, TaskSubmission, UnconfiguredIssuer,
    WebhookDelivery, WebhookHttpClient, WorkerType,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingClient {
    bodies: Mutex<Vec<Value>>,
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
        Ok(200)
    }
}

fn running_record(id: &str) -> TaskRecord {
    TaskRecord {
        task_id: id.to_string(),
        worker_type: WorkerType::Glm,
        prompt: "p".into(),
        repository: Some("acme/app".into()),
        base_branch: None,
        webhook_url: "https://caller.example/hooks/task".into(),
        webhook_secret: "whsec".into(),
        status: TaskStatus::Running,
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

fn settings(temp: &TempDir) -> Settings {
    Settings::resolve(&Cli {
        port: Some(0),
        state_path: Some(temp.path().join("state.json")),
        repo_path: Some(temp.path().to_path_buf()),
        worktrees_root: Some(temp.path().join("worktrees")),
        dispatch_secret: Some("service-test".into()),
        ..Cli::default()
    })
    .unwrap()
}

#[tokio::test]
async fn startup_recovers_then_shuts_down_cleanly() {
    let temp = TempDir::new().unwrap();
    let settings = settings(&temp);

    let mut previous = OrchestratorState::default();
    for id in ["a", "b"] {
        previous.tasks.insert(id.to_string(), running_record(id));
    }
    StateStore::new(&settings.state_path)
        .save(&previous)
        .await
        .unwrap();

    let client = Arc::new(RecordingClient::default());
    let components = Components {
        backend: Arc::new(LocalBackend::new()),
        webhook_client: client.clone(),
        token_issuer: Arc::new(UnconfiguredIssuer),
        command_runner: Arc::new(TokioCommandRunner),
    };
    let running = service::start(settings.clone(), components).await.unwrap();

    // No token issuer configured and no stored credential.
    assert_eq!(running.lifecycle().status(), ServiceStatus::AuthDegraded);
    assert!(running.lifecycle().accepting_tasks());

    let mut notified: Vec<(String, String)> = client
        .bodies
        .lock()
        .unwrap()
        .iter()
        .map(|b| {
            (
                b["taskId"].as_str().unwrap().to_string(),
                b["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    notified.sort();
    assert_eq!(
        notified,
        vec![
            ("a".to_string(), "interrupted".to_string()),
            ("b".to_string(), "interrupted".to_string()),
        ]
    );

    let health: Value = reqwest::get(format!("http://{}/health", running.local_addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "auth_degraded");
    assert_eq!(health["running"], 0);
    assert_eq!(health["available"], settings.capacity);

    running.lifecycle().begin_shutdown();
    tokio::time::timeout(Duration::from_secs(10), running.run_until_shutdown())
        .await
        .unwrap()
        .unwrap();

    let persisted = StateStore::new(&settings.state_path).load().await.unwrap();
    assert_eq!(persisted.tasks["a"].status, TaskStatus::Interrupted);
    assert_eq!(persisted.tasks["b"].status, TaskStatus::Interrupted);
    assert!(persisted.pending_webhooks.is_empty());
}

async fn dispatcher_with_backend(temp: &TempDir) -> (Arc<TaskDispatcher>, Arc<LocalBackend>) {
    let store = Arc::new(StateStore::new(temp.path().join("state.json")));
    let state = Arc::new(SharedState::load(store).await.unwrap());
    let backend = Arc::new(LocalBackend::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        DispatcherConfig {
            capacity: 2,
            worktrees_root: temp.path().join("worktrees"),
        },
        state.clone(),
        backend.clone(),
        Arc::new(CredentialRefresher::from_state(Arc::new(UnconfiguredIssuer), state.clone()).await),
        Arc::new(WebhookDelivery::new(
            Arc::new(RecordingClient::default()),
            state,
        )),
    ));
    (dispatcher, backend)
}

fn submission(id: &str) -> TaskSubmission {
    serde_json::from_value(json!({
        "taskId": id,
        "workerType": "auto",
        "prompt": "p",
        "webhookUrl": "https://caller.example/hooks/task",
        "webhookSecret": "whsec"
    }))
    .unwrap()
}

async fn wait_running(dispatcher: &TaskDispatcher, id: &str) {
    for _ in 0..500 {
        if dispatcher
            .get_task(id)
            .await
            .is_some_and(|t| t.status == TaskStatus::Running)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never started");
}

#[tokio::test]
async fn drain_waits_for_tasks_to_finish() {
    let temp = TempDir::new().unwrap();
    let (dispatcher, backend) = dispatcher_with_backend(&temp).await;
    dispatcher.submit_task(submission("t1")).await.unwrap();
    wait_running(&dispatcher, "t1").await;

    let finisher = {
        let backend = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            backend.finish("t1", None).unwrap();
        })
    };

    let left = service::drain(&dispatcher, Duration::from_millis(10), Duration::from_secs(5)).await;
    finisher.await.unwrap();
    assert_eq!(left, 0);
    assert_eq!(
        dispatcher.get_task("t1").await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn drain_gives_up_at_ceiling_without_cancelling() {
    let temp = TempDir::new().unwrap();
    let (dispatcher, backend) = dispatcher_with_backend(&temp).await;
    dispatcher.submit_task(submission("t1")).await.unwrap();
    wait_running(&dispatcher, "t1").await;

    let left = service::drain(&dispatcher, Duration::from_millis(10), Duration::from_millis(40)).await;
    assert_eq!(left, 1);
    assert_eq!(
        dispatcher.get_task("t1").await.unwrap().status,
        TaskStatus::Running
    );
    assert!(backend.stopped().is_empty());
}
