//! Process lifecycle shared by the HTTP handlers, the timers and the
//! shutdown sequence.
//!
//! ```text
//! initializing -> recovering -> ready <-> (degraded | auth_degraded) -> shutting_down
//! ```
//!
//! `shutting_down` is absorbing. Degradation is derived from two health
//! flags fed by the background jobs.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Initializing,
    Recovering,
    Ready,
    Degraded,
    AuthDegraded,
    ShuttingDown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Initializing => "initializing",
            ServiceStatus::Recovering => "recovering",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::AuthDegraded => "auth_degraded",
            ServiceStatus::ShuttingDown => "shutting_down",
        }
    }

    fn is_serving(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Ready | ServiceStatus::Degraded | ServiceStatus::AuthDegraded
        )
    }
}

pub struct Lifecycle {
    status: watch::Sender<ServiceStatus>,
    shutdown_requested: AtomicBool,
    credential_ok: AtomicBool,
    webhooks_ok: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ServiceStatus::Initializing);
        Self {
            status,
            shutdown_requested: AtomicBool::new(false),
            credential_ok: AtomicBool::new(true),
            webhooks_ok: AtomicBool::new(true),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.borrow()
    }

    /// New task submissions are only admitted while serving.
    pub fn accepting_tasks(&self) -> bool {
        self.status().is_serving()
    }

    pub fn begin_recovery(&self) -> bool {
        self.transition_from(&[ServiceStatus::Initializing], ServiceStatus::Recovering)
    }

    /// Leave recovery. The health flags decide between ready and degraded.
    pub fn mark_ready(&self) -> bool {
        let target = self.serving_status();
        self.transition_from(&[ServiceStatus::Recovering], target)
    }

    pub fn set_credential_health(&self, ok: bool) {
        self.credential_ok.store(ok, Ordering::SeqCst);
        self.refresh_serving_status();
    }

    pub fn set_webhook_health(&self, ok: bool) {
        self.webhooks_ok.store(ok, Ordering::SeqCst);
        self.refresh_serving_status();
    }

    /// Returns `true` only for the first caller; later requests are no-ops.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let previous = self.status.send_replace(ServiceStatus::ShuttingDown);
        info!(from = previous.as_str(), "shutdown requested");
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|status| *status == ServiceStatus::ShuttingDown).await;
    }

    fn serving_status(&self) -> ServiceStatus {
        if !self.credential_ok.load(Ordering::SeqCst) {
            ServiceStatus::AuthDegraded
        } else if !self.webhooks_ok.load(Ordering::SeqCst) {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Ready
        }
    }

    fn refresh_serving_status(&self) {
        let target = self.serving_status();
        self.transition_from(
            &[
                ServiceStatus::Ready,
                ServiceStatus::Degraded,
                ServiceStatus::AuthDegraded,
            ],
            target,
        );
    }

    fn transition_from(&self, allowed: &[ServiceStatus], to: ServiceStatus) -> bool {
        let mut from = None;
        self.status.send_if_modified(|status| {
            if !allowed.contains(status) || *status == to {
                return false;
            }
            from = Some(*status);
            *status = to;
            true
        });
        match from {
            Some(from) => {
                if to.is_serving() && from.is_serving() {
                    warn!(from = from.as_str(), to = to.as_str(), "service health changed");
                } else {
                    info!(from = from.as_str(), to = to.as_str(), "service status changed");
                }
                true
            }
            None => false,
        }
    }
}
