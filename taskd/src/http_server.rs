use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use taskd_orchestration::{DispatchError, TaskDispatcher, TaskRecord, TaskSubmission};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::DispatchAuthenticator,
    lifecycle::{Lifecycle, ServiceStatus},
};

#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayStateInner>,
}

struct GatewayStateInner {
    dispatcher: Arc<TaskDispatcher>,
    auth: DispatchAuthenticator,
    lifecycle: Arc<Lifecycle>,
    repo_path: PathBuf,
}

impl GatewayState {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        auth: DispatchAuthenticator,
        lifecycle: Arc<Lifecycle>,
        repo_path: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayStateInner {
                dispatcher,
                auth,
                lifecycle,
                repo_path,
            }),
        }
    }

    fn ensure_signed(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
        self.inner
            .auth
            .verify(headers, body, Utc::now().timestamp())
            .map_err(|err| {
                warn!("rejected dispatch request: {err}");
                ApiError::Unauthorized
            })
    }

    fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.inner.dispatcher
    }

    fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.inner.lifecycle
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound,
    Conflict(&'static str),
    Unavailable(&'static str),
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::AtCapacity { .. } => ApiError::Unavailable("at_capacity"),
            DispatchError::Validation(message) => ApiError::BadRequest(message),
            DispatchError::NotFound(_) => ApiError::NotFound,
            DispatchError::AlreadyCompleted { .. } => ApiError::Conflict("already_completed"),
            other @ DispatchError::Persistence(_) => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found".to_string()),
            ApiError::Conflict(code) => (StatusCode::CONFLICT, code.to_string()),
            ApiError::Unavailable(code) => (StatusCode::SERVICE_UNAVAILABLE, code.to_string()),
            ApiError::Internal(err) => {
                tracing::error!("HTTP handler error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/tasks/:task_id", get(get_task).delete(cancel_task))
        .route("/health", get(health))
        .route("/admin/shutdown", post(shutdown))
        .route("/admin/refresh-token", post(refresh_token))
        .route("/admin/webhooks", get(list_webhooks).delete(purge_webhooks))
        .route("/admin/worktrees/orphans", get(orphan_worktrees))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind taskd HTTP server to {addr}"))?;
    info!("taskd listening on {}", listener.local_addr().unwrap_or(addr));
    Ok(listener)
}

async fn submit_task(
    Extension(state): Extension<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.ensure_signed(&headers, &body)?;

    let lifecycle = state.lifecycle();
    if !lifecycle.accepting_tasks() {
        let code = if lifecycle.is_shutting_down() {
            "shutting_down"
        } else {
            "not_ready"
        };
        return Err(ApiError::Unavailable(code));
    }

    let submission: TaskSubmission = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid task submission: {err}")))?;
    let task_id = state.dispatcher().submit_task(submission).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "taskId": task_id, "status": "queued" })),
    )
        .into_response())
}

/// Every known task, oldest first.
async fn list_tasks(Extension(state): Extension<GatewayState>) -> Result<Json<Value>, ApiError> {
    let tasks = state
        .dispatcher()
        .list_tasks()
        .await
        .iter()
        .map(public_view)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn get_task(
    Extension(state): Extension<GatewayState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .dispatcher()
        .get_task(&task_id)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(public_view(&task)?))
}

/// A task record without its webhook secret.
fn public_view(task: &TaskRecord) -> Result<Value, ApiError> {
    let mut body = serde_json::to_value(task).map_err(ApiError::internal)?;
    if let Some(fields) = body.as_object_mut() {
        fields.remove("webhookSecret");
    }
    Ok(body)
}

async fn cancel_task(
    Extension(state): Extension<GatewayState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.ensure_signed(&headers, &body)?;
    let task = state.dispatcher().cancel_task(&task_id).await?;
    Ok(Json(json!({ "taskId": task.task_id, "status": task.status })))
}

async fn health(Extension(state): Extension<GatewayState>) -> Json<Value> {
    let dispatcher = state.dispatcher();
    let capacity = dispatcher.capacity();
    let running = dispatcher.running_count().await;
    let pending_webhooks = dispatcher.webhooks().pending_count().await;
    Json(json!({
        "status": state.lifecycle().status(),
        "capacity": capacity,
        "running": running,
        "available": capacity.saturating_sub(running),
        "credentialExpiresAt": dispatcher.credentials().expires_at(),
        "pendingWebhooks": pending_webhooks,
        "build": taskd_build_info::build_id(),
    }))
}

async fn shutdown(
    Extension(state): Extension<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.ensure_signed(&headers, &body)?;
    if !state.lifecycle().begin_shutdown() {
        info!("shutdown already in progress");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": ServiceStatus::ShuttingDown })),
    )
        .into_response())
}

async fn refresh_token(
    Extension(state): Extension<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.ensure_signed(&headers, &body)?;
    match state.dispatcher().credentials().refresh_token().await {
        Ok(credential) => {
            state.lifecycle().set_credential_health(true);
            Ok(Json(json!({ "tokenExpiresAt": credential.expires_at })))
        }
        Err(err) => {
            let valid = state.dispatcher().credentials().is_valid(Utc::now());
            state.lifecycle().set_credential_health(valid);
            Err(ApiError::internal(err))
        }
    }
}

async fn list_webhooks(Extension(state): Extension<GatewayState>) -> Json<Value> {
    let entries: Vec<Value> = state
        .dispatcher()
        .state()
        .read(|s| {
            s.pending_webhooks
                .iter()
                .map(|entry| {
                    json!({
                        "taskId": entry.task_id,
                        "status": entry.payload.status,
                        "attempts": entry.attempts,
                        "enqueuedAt": entry.enqueued_at,
                    })
                })
                .collect()
        })
        .await;
    Json(json!({ "pending": entries.len(), "entries": entries }))
}

async fn purge_webhooks(
    Extension(state): Extension<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.ensure_signed(&headers, &body)?;
    let purged = state
        .dispatcher()
        .webhooks()
        .purge_pending()
        .await
        .map_err(ApiError::internal)?;
    state.lifecycle().set_webhook_health(true);
    Ok(Json(json!({ "purged": purged })))
}

async fn orphan_worktrees(Extension(state): Extension<GatewayState>) -> Json<Value> {
    let orphans = state
        .dispatcher()
        .state()
        .store()
        .detect_orphan_worktrees(&state.inner.repo_path)
        .await;
    Json(json!({ "orphans": orphans }))
}
