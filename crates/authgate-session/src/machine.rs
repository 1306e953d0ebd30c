//! The raw transition primitive.
//!
//! [`AuthMachine::change_state`] is the only code path that writes a
//! player's state after connect. It does not judge whether an edge makes
//! sense; that is [`AuthService`](crate::AuthService)'s job. Remote state
//! pushed by a proxy goes straight through here.
//!
//! ```text
//!   change_state(p, new)
//!     │
//!     ├─ lock p's transition mutex ─── (other writers for p wait here)
//!     ├─ old != expected? → Err(StateChanged)   (transition_from only)
//!     ├─ old == new?  → return, no event
//!     ├─ on_transition(&mut event) for each listener
//!     ├─ cancelled?   → unlock, Err(TransitionVetoed)
//!     ├─ commit new
//!     ├─ on_committed(&event) for each listener
//!     └─ unlock, Ok(old)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use authgate_protocol::{AuthState, PlayerId};

use crate::registry::PlayerEntry;
use crate::{AuthRegistry, SessionError, StateTransitionEvent, TransitionListener};

/// Handle returned by [`AuthMachine::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-player state transitions with synchronous listener veto.
pub struct AuthMachine {
    registry: Arc<AuthRegistry>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TransitionListener>)>>,
    next_listener: AtomicU64,
}

impl AuthMachine {
    pub fn new(registry: Arc<AuthRegistry>) -> Self {
        Self {
            registry,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<AuthRegistry> {
        &self.registry
    }

    /// Registers a listener. Listeners are called in registration order.
    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns `false` if `id` wasn't registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// The player's current state. `Unregistered` for anyone this process
    /// doesn't know about. Never blocks on a transition in progress.
    pub fn get_state(&self, player_id: PlayerId) -> AuthState {
        self.registry.state(player_id).unwrap_or_default()
    }

    /// Calls `f` with the player's state while holding their transition
    /// lock, so no transition commits (or reaches `on_committed`) until
    /// `f` returns. `f` must not block or change state. Unknown players
    /// are passed `Unregistered`.
    pub fn inspect<R>(&self, player_id: PlayerId, f: impl FnOnce(AuthState) -> R) -> R {
        match self.registry.entry(player_id) {
            Some(entry) => {
                let _guard = entry.lock();
                f(entry.state())
            }
            None => f(AuthState::Unregistered),
        }
    }

    /// Moves the player to `new_state` unless a listener vetoes.
    ///
    /// Returns the state the player was in before. Asking for the state
    /// the player is already in is a no-op: no event, `Ok(new_state)`.
    ///
    /// # Errors
    /// - [`SessionError::NotConnected`]: no registry entry.
    /// - [`SessionError::TransitionVetoed`]: a listener cancelled.
    pub fn change_state(
        &self,
        player_id: PlayerId,
        new_state: AuthState,
    ) -> Result<AuthState, SessionError> {
        let entry = self
            .registry
            .entry(player_id)
            .ok_or(SessionError::NotConnected(player_id))?;
        self.transition(player_id, &entry, new_state)
    }

    pub(crate) fn transition(
        &self,
        player_id: PlayerId,
        entry: &PlayerEntry,
        new_state: AuthState,
    ) -> Result<AuthState, SessionError> {
        self.apply(player_id, entry, None, new_state)
    }

    /// Like [`transition`](Self::transition), but only if the player is
    /// still in `expected` once the per-identity lock is held.
    pub(crate) fn transition_from(
        &self,
        player_id: PlayerId,
        entry: &PlayerEntry,
        expected: AuthState,
        new_state: AuthState,
    ) -> Result<AuthState, SessionError> {
        self.apply(player_id, entry, Some(expected), new_state)
    }

    fn apply(
        &self,
        player_id: PlayerId,
        entry: &PlayerEntry,
        expected: Option<AuthState>,
        new_state: AuthState,
    ) -> Result<AuthState, SessionError> {
        let guard = entry.lock();
        let old_state = entry.state();
        if let Some(expected) = expected.filter(|&expected| expected != old_state) {
            tracing::debug!(%player_id, %expected, found = %old_state, "state moved, not committing");
            return Err(SessionError::StateChanged {
                player_id,
                expected,
                found: old_state,
            });
        }
        if old_state == new_state {
            return Ok(old_state);
        }

        // Clone the list out so a listener may add or remove listeners
        // without deadlocking on `self.listeners`.
        let listeners: Vec<Arc<dyn TransitionListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut event = StateTransitionEvent::new(player_id, old_state, new_state);
        for listener in &listeners {
            listener.on_transition(&mut event);
        }

        if event.is_cancelled() {
            tracing::warn!(
                %player_id,
                from = %old_state,
                to = %new_state,
                "state transition vetoed"
            );
            return Err(SessionError::TransitionVetoed {
                player_id,
                from: old_state,
                to: new_state,
            });
        }

        entry.commit(&guard, new_state);
        tracing::debug!(%player_id, from = %old_state, to = %new_state, "state committed");

        for listener in &listeners {
            listener.on_committed(&event);
        }
        drop(guard);

        Ok(old_state)
    }
}

// =========================================================================
// Tests
// =========================================================================
