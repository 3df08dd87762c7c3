//! Startup recovery, background timers and the shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use taskd_common::{CommandRunner, Scheduler, TokioCommandRunner};
use taskd_orchestration::{
    CredentialRefresher, DispatcherConfig, ExecutionBackend, HttpTokenIssuer, LocalBackend,
    ReqwestWebhookClient, SharedState, StateStore, TaskDispatcher, TmuxBackend, TokenIssuer,
    UnconfiguredIssuer, WebhookDelivery, WebhookHttpClient,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::auth::DispatchAuthenticator;
use crate::config::{BackendKind, Settings};
use crate::http_server::{self, GatewayState};
use crate::lifecycle::Lifecycle;

/// Collaborators that talk to the outside world.
pub struct Components {
    pub backend: Arc<dyn ExecutionBackend>,
    pub webhook_client: Arc<dyn WebhookHttpClient>,
    pub token_issuer: Arc<dyn TokenIssuer>,
    pub command_runner: Arc<dyn CommandRunner>,
}

impl Components {
    pub fn production(settings: &Settings) -> Self {
        let command_runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let backend: Arc<dyn ExecutionBackend> = match settings.backend {
            BackendKind::Local => Arc::new(LocalBackend::new()),
            BackendKind::Tmux => Arc::new(TmuxBackend::new(
                command_runner.clone(),
                settings.repo_path.clone(),
                settings.worker_commands.clone(),
            )),
        };
        let http = reqwest::Client::new();
        let token_issuer: Arc<dyn TokenIssuer> = match &settings.token_issuer {
            Some(issuer) => Arc::new(HttpTokenIssuer::new(
                http.clone(),
                issuer.url.clone(),
                issuer.bearer.clone(),
            )),
            None => Arc::new(UnconfiguredIssuer),
        };
        Self {
            backend,
            webhook_client: Arc::new(ReqwestWebhookClient::new(http)),
            token_issuer,
            command_runner,
        }
    }
}

/// A service that has recovered, bound its listener and started its timers.
pub struct RunningService {
    settings: Settings,
    local_addr: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<TaskDispatcher>,
    scheduler: Scheduler,
    close: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
}

/// Load state, recover interrupted work, bind, start timers, go ready.
pub async fn start(settings: Settings, components: Components) -> Result<RunningService> {
    let lifecycle = Arc::new(Lifecycle::new());

    let store = Arc::new(
        StateStore::new(&settings.state_path).with_runner(components.command_runner.clone()),
    );
    let state = Arc::new(
        SharedState::load(store.clone())
            .await
            .with_context(|| format!("Failed to load state from {}", settings.state_path.display()))?,
    );
    let webhooks = Arc::new(WebhookDelivery::new(components.webhook_client, state.clone()));
    let credentials =
        Arc::new(CredentialRefresher::from_state(components.token_issuer, state.clone()).await);
    let dispatcher = Arc::new(TaskDispatcher::new(
        DispatcherConfig {
            capacity: settings.capacity,
            worktrees_root: settings.worktrees_root.clone(),
        },
        state,
        components.backend,
        credentials,
        webhooks,
    ));

    lifecycle.begin_recovery();
    let interrupted = dispatcher
        .recover_interrupted()
        .await
        .context("Failed to persist recovered task state")?;
    if !interrupted.is_empty() {
        warn!(count = interrupted.len(), tasks = ?interrupted, "recovered interrupted tasks");
    }

    let orphans = store.detect_orphan_worktrees(&settings.repo_path).await;
    for orphan in &orphans {
        warn!(path = %orphan.display(), "orphaned worktree (not owned by any active task)");
    }

    refresh_credential(&dispatcher, &lifecycle, &settings).await;
    lifecycle.set_webhook_health(dispatcher.webhooks().pending_count().await == 0);

    let listener = http_server::bind(&settings.host, settings.port).await?;
    let local_addr = listener.local_addr().context("Listener has no local address")?;

    let scheduler = start_timers(&settings, &dispatcher, &lifecycle);

    let gateway = GatewayState::new(
        dispatcher.clone(),
        DispatchAuthenticator::new(settings.dispatch_secret.clone()),
        lifecycle.clone(),
        settings.repo_path.clone(),
    );
    let app = http_server::router(gateway);
    let (close, close_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = close_rx.await;
            })
            .await
            .context("HTTP server encountered an unrecoverable error")
    });

    lifecycle.mark_ready();
    info!(
        addr = %local_addr,
        capacity = settings.capacity,
        status = lifecycle.status().as_str(),
        "taskd ready"
    );

    Ok(RunningService {
        settings,
        local_addr,
        lifecycle,
        dispatcher,
        scheduler,
        close,
        server,
    })
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Block until shutdown is requested, then drain and exit cleanly.
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.lifecycle.wait_for_shutdown().await;
        self.shutdown().await
    }

    async fn shutdown(self) -> Result<()> {
        let cancelled = self.scheduler.cancel_all();
        debug!(timers = cancelled, "timers cancelled");

        drain(
            &self.dispatcher,
            self.settings.intervals.drain_poll,
            self.settings.intervals.drain_timeout,
        )
        .await;

        let snapshot = self.dispatcher.persist_snapshot().await;
        if let Err(err) = &snapshot {
            error!("failed to persist final snapshot: {err}");
        }

        let _ = self.close.send(());
        match self.server.await {
            Ok(result) => result?,
            Err(err) => warn!("HTTP server task ended abnormally: {err}"),
        }
        info!("taskd stopped");
        snapshot.context("Failed to persist final snapshot")
    }
}

/// Wait for active tasks to finish, polling the backend so completions are
/// recorded. Tasks still active at the ceiling are left for the next
/// startup's recovery.
pub async fn drain(dispatcher: &TaskDispatcher, poll: Duration, ceiling: Duration) -> usize {
    let started = Instant::now();
    loop {
        dispatcher.poll_tasks().await;
        let active = dispatcher.running_count().await;
        if active == 0 {
            info!("all tasks drained");
            return 0;
        }
        if started.elapsed() >= ceiling {
            warn!(active, "drain ceiling reached; leaving tasks for recovery");
            return active;
        }
        info!(active, "waiting for active tasks to finish");
        sleep(poll).await;
    }
}

async fn refresh_credential(dispatcher: &TaskDispatcher, lifecycle: &Lifecycle, settings: &Settings) {
    let margin = chrono::Duration::from_std(settings.intervals.refresh_margin)
        .unwrap_or_else(|_| chrono::Duration::minutes(10));
    let credentials = dispatcher.credentials();
    match credentials.refresh_if_needed(margin).await {
        Ok(_) => lifecycle.set_credential_health(true),
        Err(err) => {
            debug!("credential refresh tick failed: {err}");
            lifecycle.set_credential_health(credentials.is_valid(Utc::now()));
        }
    }
}

fn start_timers(
    settings: &Settings,
    dispatcher: &Arc<TaskDispatcher>,
    lifecycle: &Arc<Lifecycle>,
) -> Scheduler {
    let scheduler = Scheduler::new();

    {
        let dispatcher = dispatcher.clone();
        let lifecycle = lifecycle.clone();
        let settings = settings.clone();
        scheduler.every(
            "credential-refresh",
            settings.intervals.credential_refresh,
            move || {
                let dispatcher = dispatcher.clone();
                let lifecycle = lifecycle.clone();
                let settings = settings.clone();
                async move { refresh_credential(&dispatcher, &lifecycle, &settings).await }
            },
        );
    }

    {
        let dispatcher = dispatcher.clone();
        let lifecycle = lifecycle.clone();
        scheduler.every("webhook-retry", settings.intervals.webhook_retry, move || {
            let dispatcher = dispatcher.clone();
            let lifecycle = lifecycle.clone();
            async move {
                match dispatcher.webhooks().retry_pending().await {
                    Ok(summary) => {
                        if summary.attempted > 0 {
                            info!(
                                attempted = summary.attempted,
                                delivered = summary.delivered,
                                remaining = summary.remaining,
                                "webhook retry pass"
                            );
                        }
                        lifecycle.set_webhook_health(summary.remaining == 0);
                    }
                    Err(err) => {
                        error!("webhook retry pass failed: {err}");
                        lifecycle.set_webhook_health(false);
                    }
                }
            }
        });
    }

    {
        let dispatcher = dispatcher.clone();
        scheduler.every("task-poll", settings.intervals.task_poll, move || {
            let dispatcher = dispatcher.clone();
            async move {
                let report = dispatcher.poll_tasks().await;
                if report.completed + report.failed > 0 {
                    info!(
                        checked = report.checked,
                        completed = report.completed,
                        failed = report.failed,
                        "task poll"
                    );
                }
            }
        });
    }

    scheduler
}
