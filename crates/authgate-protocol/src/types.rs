//! Core protocol types for Authgate.
//!
//! This module defines every type that crosses a process boundary: the
//! player identity, the auth state enum, and the messages a proxy and its
//! backend servers exchange to keep that state converged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sync protocol version. A backend whose `Hello` carries a different
/// version is rejected by the proxy.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A player's stable, unique identity (a 128-bit UUID).
///
/// Newtype over [`Uuid`] so a player id can't be confused with any other
/// UUID floating around (credential rows, node ids). Serialized as the
/// plain hyphenated string thanks to `#[serde(transparent)]`, which is
/// also the form the SQL store writes into its `uuid` column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Generates a random (v4) player id. Mostly useful in tests and demos;
    /// real identities come from the game platform.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for PlayerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// AuthState
// ---------------------------------------------------------------------------

/// Where a player stands with respect to their second factor.
///
/// ```text
///   Unregistered ──(enroll)──→ Pending ──(verify)──→ Verified
///        ↑                       ↑                      │
///        │                       └──────(reconnect)─────┘
///        └──────────────(reset, from any state)─────────┘
/// ```
///
/// - **Unregistered**: no secret on file. Also the answer for any player
///   the process doesn't know about, and the fail-closed answer when the
///   credential store can't be reached.
/// - **Pending**: a secret exists, but this connection hasn't proven it.
/// - **Verified**: this connection submitted a valid code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "PascalCase")]
pub enum AuthState {
    #[default]
    Unregistered,
    Pending,
    Verified,
}

impl AuthState {
    /// Returns `true` only for [`AuthState::Verified`].
    pub fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Returns `true` if a locally-initiated change from `self` to
    /// `target` is a legal edge of the state machine.
    ///
    /// Resets are legal from anywhere; the only forward edges are
    /// `Unregistered → Pending` and `Pending → Verified`, plus the
    /// explicit downgrade `Verified → Pending`. Self-loops are not
    /// transitions.
    pub fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (a, b) if a == b => false,
            (_, Self::Unregistered) => true,
            (Self::Unregistered, Self::Pending) => true,
            (Self::Pending, Self::Verified) => true,
            (Self::Verified, Self::Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "Unregistered"),
            Self::Pending => write!(f, "Pending"),
            Self::Verified => write!(f, "Verified"),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncMessage
// ---------------------------------------------------------------------------

/// Why the proxy is pushing a state to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum UpdateReason {
    /// The proxy's state for this player just changed.
    Changed,
    /// The player was just routed to this backend.
    Switch,
    /// Part of the full snapshot sent right after `HelloAck`.
    Snapshot,
}

/// Messages exchanged between a proxy and its backend servers.
///
/// Internally tagged, so a push looks like
/// `{ "type": "StateUpdate", "player_id": "…", "state": "Verified", "reason": "Changed" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // -- Connection lifecycle --
    /// Backend → Proxy: first message on a new connection.
    Hello { version: u32, node: String },

    /// Proxy → Backend: the backend is registered.
    HelloAck { version: u32 },

    // -- State propagation --
    /// Proxy → Backend: authoritative state for one player.
    StateUpdate {
        player_id: PlayerId,
        state: AuthState,
        reason: UpdateReason,
    },

    /// Backend → Proxy: "what do you have for this player?"
    /// Sent when a backend's view has gone stale.
    Query { player_id: PlayerId },

    /// Proxy → Backend: answer to a `Query`. `state` is `None` when the
    /// player isn't connected through the proxy.
    QueryReply {
        player_id: PlayerId,
        state: Option<AuthState>,
    },

    // -- Keep-alive --
    Heartbeat,
    HeartbeatAck,

    // -- Errors --
    /// Either direction. `code` follows HTTP conventions (400 = bad
    /// request, 409 = conflict).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level wire wrapper. Every message between nodes is an Envelope.
///
/// `seq` is per-sender and monotonically increasing. A `QueryReply`
/// reuses the `seq` of the `Query` it answers so the backend can match
/// replies to in-flight requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,

    /// Milliseconds since the sending node started.
    pub timestamp: u64,

    pub payload: SyncMessage,
}

// =========================================================================
// Tests
// =========================================================================
