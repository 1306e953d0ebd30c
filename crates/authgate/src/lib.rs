//! # Authgate
//!
//! Two-factor authentication for Minecraft servers and proxy networks.
//!
//! Players enroll a TOTP secret with `/2fa`, and until they type a valid
//! code each session, the [`Gate`] holds back movement, chat, commands
//! and server switches. On a proxy network the proxy owns every player's
//! state and pushes it to the backend servers, which fail closed when
//! they lose contact.
//!
//! This crate ties the layers together behind one [`AuthNode`]:
//!
//! ```text
//! host events → AuthNode → Gate ─→ StateSource (AuthService | SyncClient)
//!                  │
//!                  └→ AuthService → AuthMachine + StorageWorker + Totp
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authgate::prelude::*;
//!
//! # async fn run(player: PlayerId) -> Result<(), AuthGateError> {
//! authgate::telemetry::init("authgate=info");
//! let node = AuthNode::from_path("plugins/authgate/config.json").await?;
//!
//! node.player_join(player, Some("203.0.113.7".into())).await;
//! if !node.check(player, Action::Chat).await.is_allowed() {
//!     // cancel the chat event and prompt for a code
//! }
//! # Ok(())
//! # }
//! ```

pub mod commands;
mod config;
mod error;
mod gate;
mod node;
pub mod telemetry;

pub use commands::{Command, CommandOutcome, CommandSender};
pub use config::{
    AuthGateConfig, GateConfig, ReplayConfig, StorageBackend, StorageConfig, SyncConfig, SyncRole,
};
pub use error::AuthGateError;
pub use gate::{
    Action, CODE_COMMAND, CODE_COMMAND_ALIASES, CodeResult, Decision, Gate, is_code_command,
};
pub use node::{AuthNode, NodeSource};

pub use authgate_protocol as protocol;
pub use authgate_session as session;
pub use authgate_store as store;
pub use authgate_sync as sync;
pub use authgate_totp as totp;
pub use authgate_transport as transport;

/// Everything a host adapter usually needs.
pub mod prelude {
    pub use crate::commands::{Command, CommandOutcome, CommandSender};
    pub use crate::{
        Action, AuthGateConfig, AuthGateError, AuthNode, CodeResult, Decision, Gate, GateConfig,
    };
    pub use authgate_protocol::{AuthState, PlayerId};
    pub use authgate_session::{
        AuthMachine, AuthService, StateSource, StateTransitionEvent, TransitionListener,
    };
}
