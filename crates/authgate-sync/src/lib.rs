//! Cross-node auth state sync for Authgate networks.
//!
//! On a proxy network a player authenticates once, at the proxy, and then
//! hops between backend servers. Every backend must agree with the proxy
//! about whether that player is verified. This crate keeps them agreeing:
//!
//! - [`SyncHub`] runs on the proxy. It listens to the proxy's
//!   [`AuthMachine`](authgate_session::AuthMachine) and pushes every
//!   committed change to the backend the player is on.
//! - [`SyncClient`] runs on each backend. It mirrors pushed state into the
//!   backend's own machine and implements
//!   [`StateSource`](authgate_session::StateSource), so a gate can ask it
//!   directly.
//!
//! # Consistency
//!
//! A backend trusts a pushed state for [`ClientConfig::staleness_secs`]
//! and re-queries after that. If the proxy can't be reached in time the
//! backend fails closed: nothing it reports is more permissive than
//! `Pending`.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Sync (hub / client) → Gate
//! ```

mod client;
mod config;
mod error;
mod hub;
mod link;

pub use client::SyncClient;
pub use config::{ClientConfig, HubConfig};
pub use error::SyncError;
pub use hub::SyncHub;
