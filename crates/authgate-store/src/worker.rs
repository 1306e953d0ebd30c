//! Bounded blocking pool in front of a [`CredentialStore`].
//!
//! Store calls block on disk or network I/O. Running them on the game
//! thread would stall every player, so the auth layer goes through a
//! [`StorageWorker`] instead:
//!
//! ```text
//!   game thread                 StorageWorker               store
//!   ───────────                 ─────────────               ─────
//!   worker.get_secret(p) ──→  acquire permit (≤ N in flight)
//!        .await                spawn_blocking ───────────→ get_secret(p)
//!          ⋮                                  ←─────────── Ok(Some(..))
//!   ←── Ok(Some(..))           release permit
//! ```
//!
//! The semaphore caps how many blocking threads one node can tie up in
//! the store, which matters for SQL backends with a small connection
//! budget.

use std::sync::Arc;

use authgate_protocol::PlayerId;
use tokio::sync::Semaphore;

use crate::{Credential, CredentialStore, StoreError};

/// Runs [`CredentialStore`] calls on tokio's blocking pool, at most
/// `workers` at a time. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct StorageWorker {
    store: Arc<dyn CredentialStore>,
    permits: Arc<Semaphore>,
}

impl StorageWorker {
    /// Wraps `store`. A `workers` of zero is treated as one.
    pub fn new(store: Arc<dyn CredentialStore>, workers: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// The wrapped store, for callers that are already off the game thread.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Runs `f` against the store on a blocking thread.
    ///
    /// # Errors
    /// Whatever `f` returns, or [`StoreError::WorkerStopped`] if the
    /// worker was shut down or the blocking task panicked.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CredentialStore) -> Result<T, StoreError> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::WorkerStopped)?;
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(store.as_ref())
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "storage task panicked");
            StoreError::WorkerStopped
        })?
    }

    /// Creates tables if needed. Failures are logged and returned; the
    /// backends retry lazily on the next access.
    pub async fn init(&self) -> Result<(), StoreError> {
        let result = self.run(|store| store.init()).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "credential store init failed, will retry lazily");
        }
        result
    }

    pub async fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.run(move |store| store.get_secret(player_id)).await
    }

    pub async fn set_secret(
        &self,
        player_id: PlayerId,
        secret: impl Into<String>,
    ) -> Result<String, StoreError> {
        let secret = secret.into();
        self.run(move |store| store.set_secret(player_id, &secret)).await
    }

    pub async fn has_secret(&self, player_id: PlayerId) -> Result<bool, StoreError> {
        self.run(move |store| store.has_secret(player_id)).await
    }

    pub async fn remove_secret(&self, player_id: PlayerId) -> Result<(), StoreError> {
        self.run(move |store| store.remove_secret(player_id)).await
    }

    pub async fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.run(move |store| store.get_address(player_id)).await
    }

    pub async fn set_address(
        &self,
        player_id: PlayerId,
        address: impl Into<String>,
    ) -> Result<String, StoreError> {
        let address = address.into();
        self.run(move |store| store.set_address(player_id, &address)).await
    }

    pub async fn credential(&self, player_id: PlayerId) -> Result<Option<Credential>, StoreError> {
        self.run(move |store| store.credential(player_id)).await
    }

    /// Stops accepting work. Calls already holding a permit finish;
    /// later calls fail with [`StoreError::WorkerStopped`].
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl std::fmt::Debug for StorageWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWorker")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}
