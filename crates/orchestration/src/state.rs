//! In-memory owner of the orchestrator aggregate.
//!
//! Every mutation goes through [`SharedState::update`]: the closure runs
//! against a copy, the copy is persisted, and only then does it replace the
//! in-memory state. A failed save leaves memory untouched.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::StateStore;
use crate::types::OrchestratorState;

pub struct SharedState {
    store: Arc<StateStore>,
    inner: Mutex<OrchestratorState>,
}

impl SharedState {
    pub fn new(store: Arc<StateStore>, initial: OrchestratorState) -> Self {
        Self {
            store,
            inner: Mutex::new(initial),
        }
    }

    /// Load from the store and wrap the result.
    pub async fn load(store: Arc<StateStore>) -> Result<Self, StoreError> {
        let initial = store.load().await?;
        Ok(Self::new(store, initial))
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub async fn read<R>(&self, f: impl FnOnce(&OrchestratorState) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    pub async fn snapshot(&self) -> OrchestratorState {
        self.inner.lock().await.clone()
    }

    /// Mutate, persist, commit. The closure may reject the change by
    /// returning an error, in which case nothing is written.
    pub async fn update<R, E>(
        &self,
        f: impl FnOnce(&mut OrchestratorState) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.inner.lock().await;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.store.save(&draft).await?;
        *guard = draft;
        Ok(out)
    }

    /// Write the current state as-is.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let guard = self.inner.lock().await;
        self.store.save(&guard).await
    }
}
