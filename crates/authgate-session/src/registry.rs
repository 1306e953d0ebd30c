//! The registry: which players are connected and what state they are in.
//!
//! One [`AuthRegistry`] exists per running node. It is created when the
//! node starts, handed to the [`AuthMachine`](crate::AuthMachine) and
//! anything else that needs it, and dropped when the node stops. Tests
//! build their own, so no two tests share state.
//!
//! # Concurrency
//!
//! The map itself sits behind an `RwLock` that is only held long enough
//! to clone an `Arc<PlayerEntry>` out. Each entry then has:
//!
//! - `state`: an `AtomicU8`, so a gate check is a single load and never
//!   waits behind a transition in progress;
//! - `transition`: a `Mutex<()>` that a writer holds from raising the
//!   event until listeners have been told about the commit;
//! - `operation`: an async mutex held by a service operation (connect,
//!   enroll, verify, reset) across its store round trips, so a check it
//!   made before awaiting the store still holds when it commits.
//!
//! A reader therefore sees either the old state or the new one, never
//! anything in between, and two writers for the same player queue up
//! instead of interleaving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use authgate_protocol::{AuthState, PlayerId};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

fn encode(state: AuthState) -> u8 {
    match state {
        AuthState::Unregistered => 0,
        AuthState::Pending => 1,
        AuthState::Verified => 2,
    }
}

fn decode(raw: u8) -> AuthState {
    match raw {
        1 => AuthState::Pending,
        2 => AuthState::Verified,
        // Only `encode` writes this field; fail closed on anything else.
        _ => AuthState::Unregistered,
    }
}

/// One connected player's slot in the registry.
#[derive(Debug)]
pub(crate) struct PlayerEntry {
    state: AtomicU8,
    transition: Mutex<()>,
    operation: AsyncMutex<()>,
    failures: AtomicU32,
    address: Option<String>,
}

impl PlayerEntry {
    fn new(address: Option<String>) -> Self {
        Self {
            state: AtomicU8::new(encode(AuthState::Unregistered)),
            transition: Mutex::new(()),
            operation: AsyncMutex::new(()),
            failures: AtomicU32::new(0),
            address,
        }
    }

    pub(crate) fn state(&self) -> AuthState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Callers must hold the guard from [`lock`](Self::lock).
    pub(crate) fn commit(&self, _guard: &MutexGuard<'_, ()>, state: AuthState) {
        self.state.store(encode(state), Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for any other store-backed operation on this player to
    /// finish. Never held while a gate check reads the state.
    pub(crate) async fn exclusive(&self) -> AsyncMutexGuard<'_, ()> {
        self.operation.lock().await
    }

    pub(crate) fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub(crate) fn reset_failures(&self) {
        self.failures.store(0, Ordering::Release);
    }
}

/// A connected player as captured by [`AuthRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub player_id: PlayerId,
    pub state: AuthState,
    pub address: Option<String>,
}

/// Lifecycle-scoped map from connected player to auth state.
#[derive(Debug, Default)]
pub struct AuthRegistry {
    players: RwLock<HashMap<PlayerId, Arc<PlayerEntry>>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player in the `Unregistered` state, replacing any entry
    /// left over from an earlier connection.
    pub(crate) fn connect(
        &self,
        player_id: PlayerId,
        address: Option<String>,
    ) -> Arc<PlayerEntry> {
        let entry = Arc::new(PlayerEntry::new(address));
        let previous = self
            .players
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player_id, Arc::clone(&entry));
        if previous.is_some() {
            tracing::debug!(%player_id, "replaced stale registry entry");
        }
        entry
    }

    /// Adds a player in the `Unregistered` state without consulting any
    /// store. Backends behind a proxy use this and then take their state
    /// from the proxy.
    pub fn register(&self, player_id: PlayerId, address: Option<String>) {
        self.connect(player_id, address);
    }

    /// Removes the player. Returns `false` if they weren't connected.
    pub fn disconnect(&self, player_id: PlayerId) -> bool {
        self.players
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&player_id)
            .is_some()
    }

    pub(crate) fn entry(&self, player_id: PlayerId) -> Option<Arc<PlayerEntry>> {
        self.players
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player_id)
            .cloned()
    }

    /// `true` if `entry` is still the live entry for `player_id`, i.e.
    /// the player hasn't disconnected or reconnected since it was made.
    pub(crate) fn is_current(&self, player_id: PlayerId, entry: &Arc<PlayerEntry>) -> bool {
        self.entry(player_id)
            .is_some_and(|live| Arc::ptr_eq(&live, entry))
    }

    /// The player's state, or `None` if they aren't connected.
    pub fn state(&self, player_id: PlayerId) -> Option<AuthState> {
        self.entry(player_id).map(|entry| entry.state())
    }

    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.entry(player_id).is_some()
    }

    /// Every connected player with their current state and address.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.players
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(player_id, entry)| SessionSnapshot {
                player_id: *player_id,
                state: entry.state(),
                address: entry.address.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
