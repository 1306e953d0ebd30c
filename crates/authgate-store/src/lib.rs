//! Credential storage for Authgate.
//!
//! A credential is a player's TOTP secret plus the last address they
//! verified from. This crate defines the [`CredentialStore`] contract and
//! three backends for it:
//!
//! - [`MemoryStore`]: a map in memory. Tests and throwaway servers.
//! - [`SqliteStore`]: one row per player in a `<prefix>players` table
//!   with `uuid`, `key` and `ip` columns (`sqlite` feature, default).
//! - [`FileStore`]: a single JSON document on disk.
//!
//! Every backend call is synchronous and may block on I/O, so callers on
//! the game thread go through a [`StorageWorker`], which runs the call on
//! a bounded pool of blocking threads and hands the result back as a
//! future.
//!
//! # Conventions shared by all backends
//!
//! - An empty secret means "not enrolled". Disabling 2FA writes `""`
//!   instead of deleting the row so the address history survives.
//! - Setters upsert: a missing row is inserted, an existing one is
//!   updated in place. Secret and address are independent columns.
//! - Getters map an empty column to `None`.

mod credential;
mod error;
mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;
mod worker;

pub use credential::Credential;
pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::CredentialStore;
pub use worker::StorageWorker;
