//! Wire protocol for Authgate.
//!
//! This crate defines the vocabulary every other Authgate crate shares:
//!
//! - **Identity & state** ([`PlayerId`], [`AuthState`]): who a player is
//!   and whether they have proven their second factor.
//! - **Sync messages** ([`Envelope`], [`SyncMessage`]): what a proxy and
//!   its backend servers say to each other to keep auth state converged.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages are
//!   converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and the sync
//! layer (proxy hub / backend client). It doesn't know about connections
//! or credentials: it only knows how to serialize and deserialize.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Sync (hub / client)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    AuthState, Envelope, PlayerId, SyncMessage, UpdateReason, PROTOCOL_VERSION,
};
