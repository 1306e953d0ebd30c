//! Transition events and the listener hook.

use authgate_protocol::{AuthState, PlayerId};

/// Raised before every state change and handed to each listener.
///
/// Only the old/new pair is carried; there is no single-state form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionEvent {
    player_id: PlayerId,
    old_state: AuthState,
    new_state: AuthState,
    cancelled: bool,
}

impl StateTransitionEvent {
    pub fn new(player_id: PlayerId, old_state: AuthState, new_state: AuthState) -> Self {
        Self {
            player_id,
            old_state,
            new_state,
            cancelled: false,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn old_state(&self) -> AuthState {
        self.old_state
    }

    pub fn new_state(&self) -> AuthState {
        self.new_state
    }

    /// Vetoes the transition. Later listeners still see the event.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Lifts an earlier veto.
    pub fn uncancel(&mut self) {
        self.cancelled = false;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Observes, and may veto, state transitions.
///
/// # Call order
///
/// For one transition, every listener's [`on_transition`] runs first, in
/// registration order. If the event is still not cancelled, the new state
/// is committed and every listener's [`on_committed`] runs.
///
/// Both callbacks run synchronously on the thread that requested the
/// change, while it holds that player's transition lock, so committed
/// notifications for one player arrive in commit order. Listeners must
/// therefore be quick (a channel send, a log line) and must not request
/// another transition for the same player from inside a callback.
/// Reading state with [`AuthMachine::get_state`](crate::AuthMachine::get_state)
/// is fine; it never takes the transition lock.
///
/// [`on_transition`]: Self::on_transition
/// [`on_committed`]: Self::on_committed
pub trait TransitionListener: Send + Sync + 'static {
    /// Called before the change is committed. Call
    /// [`StateTransitionEvent::cancel`] to veto.
    fn on_transition(&self, event: &mut StateTransitionEvent) {
        let _ = event;
    }

    /// Called after the change is committed.
    fn on_committed(&self, event: &StateTransitionEvent) {
        let _ = event;
    }
}
