//! Crash-safe persistence of [`OrchestratorState`].
//!
//! The state file is rewritten wholesale on every save through a staging
//! file and an atomic rename. A file that is not valid JSON, or valid JSON of
//! the wrong shape, is moved aside to `<file>.corrupted.<timestamp>` and the
//! store starts over from the empty state.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use taskd_common::fs::write_json_atomic;
use taskd_common::{CommandRunner, TokioCommandRunner};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::types::OrchestratorState;
use crate::worktree;

pub struct StateStore {
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    // Last state read from or written to disk; orphan detection runs against it.
    last_known: Mutex<OrchestratorState>,
}

enum LoadOutcome {
    Missing,
    Loaded(OrchestratorState),
    Quarantined { backup: PathBuf, reason: String },
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            runner: Arc::new(TokioCommandRunner),
            last_known: Mutex::new(OrchestratorState::default()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Read the state file. A missing file and a corrupted file both yield
    /// the default state; any other I/O failure is returned.
    pub async fn load(&self) -> Result<OrchestratorState, StoreError> {
        let path = self.path.clone();
        let outcome = spawn_blocking(move || load_blocking(&path))
            .await
            .map_err(|err| StoreError::Worker(err.to_string()))??;

        let state = match outcome {
            LoadOutcome::Missing => {
                info!(path = %self.path.display(), "no state file yet, starting empty");
                OrchestratorState::default()
            }
            LoadOutcome::Loaded(state) => {
                debug!(
                    path = %self.path.display(),
                    tasks = state.tasks.len(),
                    pending_webhooks = state.pending_webhooks.len(),
                    "state loaded"
                );
                state
            }
            LoadOutcome::Quarantined { backup, reason } => {
                error!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    %reason,
                    "state file corrupted; preserved a backup and reset to empty state"
                );
                OrchestratorState::default()
            }
        };

        self.remember(&state);
        Ok(state)
    }

    /// Persist the full aggregate. Every save is atomic.
    pub async fn save(&self, state: &OrchestratorState) -> Result<(), StoreError> {
        self.save_atomic(state).await
    }

    /// Write to a staging file beside the canonical path, fsync, then rename
    /// over it. Parent directories are created on demand.
    pub async fn save_atomic(&self, state: &OrchestratorState) -> Result<(), StoreError> {
        let path = self.path.clone();
        let snapshot = state.clone();
        spawn_blocking(move || write_json_atomic(&path, &snapshot))
            .await
            .map_err(|err| StoreError::Worker(err.to_string()))?
            .map_err(|err| StoreError::io(&self.path, err))?;

        self.remember(state);
        Ok(())
    }

    /// Worktrees under `repo_path` that no active task in the last loaded or
    /// saved state owns. The repository's own checkout is never reported.
    /// Listing failures are logged and treated as "nothing found".
    pub async fn detect_orphan_worktrees(&self, repo_path: &Path) -> Vec<PathBuf> {
        let raw = match worktree::list_worktrees(self.runner.as_ref(), repo_path).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(
                    repo = %repo_path.display(),
                    "failed to list worktrees: {:#}",
                    err
                );
                return Vec::new();
            }
        };

        let active = match self.last_known.lock() {
            Ok(state) => state.active_worktrees(),
            Err(_) => {
                warn!("last known state poisoned; skipping orphan detection");
                return Vec::new();
            }
        };

        let main_checkout = repo_path.to_path_buf();
        match spawn_blocking(move || worktree::find_orphans(&raw, &active, &main_checkout)).await {
            Ok(orphans) => orphans,
            Err(err) => {
                error!("orphan detection worker failed: {err}");
                Vec::new()
            }
        }
    }

    fn remember(&self, state: &OrchestratorState) {
        if let Ok(mut last) = self.last_known.lock() {
            *last = state.clone();
        }
    }
}

fn load_blocking(path: &Path) -> Result<LoadOutcome, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
        Err(err) => return Err(StoreError::io(path, err)),
    };

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => return quarantine(path, format!("invalid JSON: {err}")),
    };

    match serde_json::from_value::<OrchestratorState>(value) {
        Ok(state) => Ok(LoadOutcome::Loaded(state)),
        Err(err) => quarantine(path, format!("unexpected state shape: {err}")),
    }
}

fn quarantine(path: &Path, reason: String) -> Result<LoadOutcome, StoreError> {
    let backup = corrupted_backup_path(path);
    std::fs::rename(path, &backup).map_err(|err| StoreError::io(path, err))?;
    Ok(LoadOutcome::Quarantined { backup, reason })
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    path.with_file_name(format!("{name}.corrupted.{stamp}"))
}
