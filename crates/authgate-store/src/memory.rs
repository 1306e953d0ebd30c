//! In-memory credential store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use authgate_protocol::PlayerId;

use crate::{CredentialStore, StoreError};

#[derive(Debug, Clone, Default)]
struct Row {
    secret: String,
    address: String,
}

/// A [`CredentialStore`] backed by a `HashMap`.
///
/// Nothing survives a restart. [`set_available`](Self::set_available)
/// lets tests simulate the database going away.
#[derive(Debug)]
pub struct MemoryStore {
    rows: RwLock<HashMap<PlayerId, Row>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggles simulated availability. While unavailable every call
    /// returns [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of rows, including rows whose secret was cleared.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn read_column(
        &self,
        player_id: PlayerId,
        column: impl Fn(&Row) -> &String,
    ) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(&player_id)
            .map(|row| column(row))
            .filter(|value| !value.is_empty())
            .cloned())
    }

    fn write_column(
        &self,
        player_id: PlayerId,
        value: &str,
        column: impl Fn(&mut Row) -> &mut String,
    ) -> Result<String, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let row = rows.entry(player_id).or_default();
        *column(row) = value.to_string();
        Ok(value.to_string())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryStore {
    fn init(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.read_column(player_id, |row| &row.secret)
    }

    fn set_secret(
        &self,
        player_id: PlayerId,
        secret: &str,
    ) -> Result<String, StoreError> {
        self.write_column(player_id, secret, |row| &mut row.secret)
    }

    fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.read_column(player_id, |row| &row.address)
    }

    fn set_address(
        &self,
        player_id: PlayerId,
        address: &str,
    ) -> Result<String, StoreError> {
        self.write_column(player_id, address, |row| &mut row.address)
    }
}
