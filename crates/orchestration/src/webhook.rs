//! Signed completion callbacks with a durable retry queue.
//!
//! A delivery that fails for any reason (transport error, timeout, non-2xx)
//! lands in `pendingWebhooks` and is retried on every retry tick until it
//! succeeds. There is no backoff and no attempt ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskd_common::signature::SignedHeaders;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::SharedState;
use crate::types::{WebhookDeliveryAttempt, WebhookPayload};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal HTTP client interface so delivery can be tested without sockets.
#[async_trait]
pub trait WebhookHttpClient: Send + Sync {
    /// Returns the response status code, or a transport error message.
    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<u16, String>;
}

#[derive(Clone, Default)]
pub struct ReqwestWebhookClient {
    client: reqwest::Client,
}

impl ReqwestWebhookClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookHttpClient for ReqwestWebhookClient {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        timeout_dur: Duration,
    ) -> Result<u16, String> {
        let mut req = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = timeout(timeout_dur, req.body(body).send())
            .await
            .map_err(|_| "webhook request timed out".to_string())?
            .map_err(|e| e.to_string())?;
        Ok(resp.status().as_u16())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Queued,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
}

pub struct WebhookDelivery {
    client: Arc<dyn WebhookHttpClient>,
    state: Arc<SharedState>,
    timeout: Duration,
}

impl WebhookDelivery {
    pub fn new(client: Arc<dyn WebhookHttpClient>, state: Arc<SharedState>) -> Self {
        Self {
            client,
            state,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deliver now, or queue the payload durably for the retry loop.
    /// Only a failure to persist the queue entry is an error.
    pub async fn send(
        &self,
        url: &str,
        secret: &str,
        payload: &WebhookPayload,
        task_id: &str,
    ) -> Result<DeliveryOutcome, StoreError> {
        match self.post(url, secret, payload).await {
            Ok(()) => {
                info!(task_id, status = ?payload.status, "webhook delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Err(reason) => {
                warn!(task_id, url, %reason, "webhook delivery failed, queued for retry");
                let attempt = WebhookDeliveryAttempt {
                    task_id: task_id.to_string(),
                    url: url.to_string(),
                    secret: secret.to_string(),
                    payload: payload.clone(),
                    enqueued_at: Utc::now(),
                    attempts: 1,
                };
                self.state
                    .update(|state| {
                        state.pending_webhooks.push(attempt);
                        Ok::<_, StoreError>(())
                    })
                    .await?;
                Ok(DeliveryOutcome::Queued)
            }
        }
    }

    /// One pass over the queue. Each entry is removed (and the removal
    /// persisted) as soon as it is delivered.
    pub async fn retry_pending(&self) -> Result<RetrySummary, StoreError> {
        let pending = self.state.read(|s| s.pending_webhooks.clone()).await;
        let mut summary = RetrySummary {
            attempted: pending.len(),
            ..RetrySummary::default()
        };

        for entry in pending {
            let delivered = match self.post(&entry.url, &entry.secret, &entry.payload).await {
                Ok(()) => true,
                Err(reason) => {
                    debug!(
                        task_id = %entry.task_id,
                        attempts = entry.attempts + 1,
                        %reason,
                        "webhook retry failed"
                    );
                    false
                }
            };

            self.state
                .update(|state| {
                    if delivered {
                        state.pending_webhooks.retain(|e| !e.same_entry(&entry));
                    } else if let Some(queued) = state
                        .pending_webhooks
                        .iter_mut()
                        .find(|e| e.same_entry(&entry))
                    {
                        queued.attempts += 1;
                    }
                    Ok::<_, StoreError>(())
                })
                .await?;

            if delivered {
                summary.delivered += 1;
                info!(task_id = %entry.task_id, "queued webhook delivered");
            }
        }

        summary.remaining = self.pending_count().await;
        Ok(summary)
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read(|s| s.pending_webhooks.len()).await
    }

    /// Drop every queued delivery. Returns how many were dropped.
    pub async fn purge_pending(&self) -> Result<usize, StoreError> {
        let purged = self
            .state
            .update(|state| Ok::<_, StoreError>(std::mem::take(&mut state.pending_webhooks).len()))
            .await?;
        if purged > 0 {
            warn!(purged, "pending webhooks purged");
        }
        Ok(purged)
    }

    async fn post(&self, url: &str, secret: &str, payload: &WebhookPayload) -> Result<(), String> {
        let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
        let signed =
            SignedHeaders::new(secret, Utc::now().timestamp(), &body).map_err(|e| e.to_string())?;
        let status = self
            .client
            .post(url, signed.pairs(), body, self.timeout)
            .await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(format!("endpoint answered {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::types::WebhookStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use taskd_common::signature::{self, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    struct RecordedRequest {
        url: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    /// Answers from a script; once it runs dry every call gets `fallback`.
    struct RecordingHttpClient {
        requests: Mutex<Vec<RecordedRequest>>,
        script: Mutex<VecDeque<Result<u16, String>>>,
        fallback: Result<u16, String>,
    }

    impl RecordingHttpClient {
        fn new(fallback: Result<u16, String>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
                fallback,
            }
        }

        fn then(self, reply: Result<u16, String>) -> Self {
            self.script.lock().unwrap().push_back(reply);
            self
        }

        fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookHttpClient for RecordingHttpClient {
        async fn post(
            &self,
            url: &str,
            headers: Vec<(String, String)>,
            body: Vec<u8>,
            _timeout: Duration,
        ) -> Result<u16, String> {
            self.requests.lock().unwrap().push(RecordedRequest {
                url: url.to_string(),
                headers,
                body,
            });
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn payload(task_id: &str) -> WebhookPayload {
        WebhookPayload {
            task_id: task_id.to_string(),
            status: WebhookStatus::Completed,
            result: Some(serde_json::json!({ "summary": "done" })),
            error: None,
            duration: Some(42_000),
        }
    }

    async fn shared(temp: &TempDir) -> Arc<SharedState> {
        let store = Arc::new(StateStore::new(temp.path().join("state.json")));
        Arc::new(SharedState::load(store).await.unwrap())
    }

    fn header<'a>(req: &'a RecordedRequest, name: &str) -> &'a str {
        req.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[tokio::test]
    async fn delivered_request_is_signed_with_task_secret() {
        let temp = TempDir::new().unwrap();
        let client = Arc::new(RecordingHttpClient::new(Ok(204)));
        let delivery = WebhookDelivery::new(client.clone(), shared(&temp).await);

        let outcome = delivery
            .send("https://caller.example/hook", "whsec_1", &payload("t1"), "t1")
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(delivery.pending_count().await, 0);

        let req = &client.requests()[0];
        assert_eq!(req.url, "https://caller.example/hook");
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["taskId"], "t1");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["duration"], 42_000);
        assert!(signature::verify(
            "whsec_1",
            header(req, TIMESTAMP_HEADER),
            header(req, NONCE_HEADER),
            &req.body,
            header(req, SIGNATURE_HEADER),
        ));
    }

    #[tokio::test]
    async fn failures_are_queued_and_persisted() {
        let temp = TempDir::new().unwrap();
        let state = shared(&temp).await;
        let client = Arc::new(
            RecordingHttpClient::new(Ok(200))
                .then(Ok(500))
                .then(Err("connection refused".into())),
        );
        let delivery = WebhookDelivery::new(client, state.clone());

        for id in ["t1", "t2"] {
            let outcome = delivery
                .send("https://caller.example/hook", "s", &payload(id), id)
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Queued);
        }
        assert_eq!(delivery.pending_count().await, 2);

        let on_disk = StateStore::new(state.store().path()).load().await.unwrap();
        let ids: Vec<_> = on_disk
            .pending_webhooks
            .iter()
            .map(|e| (e.task_id.as_str(), e.attempts))
            .collect();
        assert_eq!(ids, vec![("t1", 1), ("t2", 1)]);
    }

    #[tokio::test]
    async fn retry_removes_only_delivered_entries() {
        let temp = TempDir::new().unwrap();
        let state = shared(&temp).await;
        let client = Arc::new(
            RecordingHttpClient::new(Ok(200))
                .then(Ok(502))
                .then(Ok(502))
                // retry pass: t1 succeeds, t2 still failing
                .then(Ok(200))
                .then(Err("timeout".into())),
        );
        let delivery = WebhookDelivery::new(client.clone(), state.clone());
        delivery
            .send("https://a.example/hook", "s", &payload("t1"), "t1")
            .await
            .unwrap();
        delivery
            .send("https://b.example/hook", "s", &payload("t2"), "t2")
            .await
            .unwrap();

        let summary = delivery.retry_pending().await.unwrap();
        assert_eq!(
            summary,
            RetrySummary {
                attempted: 2,
                delivered: 1,
                remaining: 1
            }
        );

        let on_disk = StateStore::new(state.store().path()).load().await.unwrap();
        assert_eq!(on_disk.pending_webhooks.len(), 1);
        assert_eq!(on_disk.pending_webhooks[0].task_id, "t2");
        assert_eq!(on_disk.pending_webhooks[0].attempts, 2);

        let summary = delivery.retry_pending().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(delivery.pending_count().await, 0);
        assert_eq!(client.requests().len(), 5);
    }

    #[tokio::test]
    async fn purge_drops_everything() {
        let temp = TempDir::new().unwrap();
        let state = shared(&temp).await;
        let delivery = WebhookDelivery::new(Arc::new(RecordingHttpClient::new(Ok(503))), state);
        for id in ["t1", "t2", "t3"] {
            delivery
                .send("https://caller.example/hook", "s", &payload(id), id)
                .await
                .unwrap();
        }
        assert_eq!(delivery.purge_pending().await.unwrap(), 3);
        assert_eq!(delivery.pending_count().await, 0);
        assert_eq!(delivery.purge_pending().await.unwrap(), 0);
    }
}
