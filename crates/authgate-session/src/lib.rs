//! The per-player auth state machine for Authgate.
//!
//! This crate decides, for every connected player, whether they are
//! `Unregistered`, `Pending` or `Verified`, and moves them between those
//! states:
//!
//! 1. **Registry** ([`AuthRegistry`]): who is connected to this process
//!    and what state they are in. Owned by whoever starts the node and
//!    passed in, never a global.
//! 2. **Machine** ([`AuthMachine`]): the raw transition primitive. Raises
//!    a [`StateTransitionEvent`], lets [`TransitionListener`]s veto it,
//!    commits, then notifies.
//! 3. **Service** ([`AuthService`]): the operations players and admins
//!    trigger (connect, enroll, verify, reset), built on the machine, the
//!    credential store and the TOTP engine.
//!
//! # How it fits in the stack
//!
//! ```text
//! Gate / Sync (above)   ← ask "may this player act?", push state to backends
//!     ↕
//! Session (this crate)  ← owns per-player state and its transitions
//!     ↕
//! Store / TOTP (below)  ← secrets on disk, code checks
//! ```

mod error;
mod event;
mod machine;
mod registry;
mod service;
mod source;

pub use error::SessionError;
pub use event::{StateTransitionEvent, TransitionListener};
pub use machine::{AuthMachine, ListenerId};
pub use registry::{AuthRegistry, SessionSnapshot};
pub use service::{AuthService, Enrollment, SessionConfig, VerifyOutcome};
pub use source::StateSource;
