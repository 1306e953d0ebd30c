//! Error types for the session layer.

use authgate_protocol::{AuthState, PlayerId};
use authgate_store::StoreError;
use authgate_totp::TotpError;

/// Errors from state changes and the operations built on them.
///
/// None of these are fatal. A wrong code is not an error at all; see
/// [`VerifyOutcome`](crate::VerifyOutcome).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The credential store couldn't answer. The player keeps whatever
    /// state they had, which is never upgraded on this path.
    #[error("credential storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    /// `enroll` was called for a player who already has a secret.
    #[error("player {0} is already enrolled")]
    AlreadyEnrolled(PlayerId),

    /// A [`TransitionListener`](crate::TransitionListener) cancelled the
    /// change. The stored state is unchanged.
    #[error("transition {from} -> {to} vetoed for player {player_id}")]
    TransitionVetoed {
        player_id: PlayerId,
        from: AuthState,
        to: AuthState,
    },

    /// The player has no live entry in this process's registry.
    #[error("player {0} is not connected")]
    NotConnected(PlayerId),

    /// Marking a player `Verified` requires a non-empty secret.
    #[error("player {0} has no secret on file")]
    NotEnrolled(PlayerId),

    /// The player's state moved away from `expected` before the change
    /// could be committed. Nothing was written.
    #[error("player {player_id} is {found}, expected {expected}")]
    StateChanged {
        player_id: PlayerId,
        expected: AuthState,
        found: AuthState,
    },

    /// The TOTP settings couldn't produce a provisioning URI.
    #[error(transparent)]
    Totp(#[from] TotpError),

    /// The requested edge isn't part of the state machine.
    #[error("illegal transition {from} -> {to} for player {player_id}")]
    IllegalTransition {
        player_id: PlayerId,
        from: AuthState,
        to: AuthState,
    },
}
