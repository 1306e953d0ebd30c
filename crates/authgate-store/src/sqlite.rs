//! SQL credential store backed by SQLite.
//!
//! Schema: one row per player in `<prefix>players`:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "2fa_players" (
//!     "uuid" varchar(64), "key" varchar(64), "ip" varchar(64)
//! );
//! ```
//!
//! `key` and `ip` hold empty strings rather than NULL when unset.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use authgate_protocol::PlayerId;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{CredentialStore, StoreError};

/// Which column an upsert targets. The other column is written as `""`
/// when a row has to be inserted.
#[derive(Debug, Clone, Copy)]
enum Column {
    Key,
    Ip,
}

impl Column {
    fn name(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Ip => "ip",
        }
    }
}

/// A [`CredentialStore`] over a single SQLite connection.
///
/// The connection sits behind a `Mutex`; SQLite serializes writers
/// anyway, and the [`StorageWorker`](crate::StorageWorker) keeps the
/// game thread from ever waiting on it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    table: String,
    table_ready: AtomicBool,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    /// Fails if the file can't be opened or `table_prefix` contains
    /// characters other than ASCII letters, digits and `_`. Failing to
    /// create the table is *not* an error; it is retried on first use.
    pub fn open(
        path: impl AsRef<Path>,
        table_prefix: &str,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, table_prefix)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(table_prefix: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, table_prefix)
    }

    /// Wraps an existing connection.
    pub fn from_connection(
        conn: Connection,
        table_prefix: &str,
    ) -> Result<Self, StoreError> {
        let valid = table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::InvalidTablePrefix(table_prefix.to_string()));
        }

        let store = Self {
            conn: Mutex::new(conn),
            table: format!("{table_prefix}players"),
            table_ready: AtomicBool::new(false),
        };
        if let Err(e) = store.ensure_table() {
            tracing::warn!(
                table = %store.table,
                error = %e,
                "could not create credentials table, will retry on first access"
            );
        }
        Ok(store)
    }

    /// The fully prefixed table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn ensure_table(&self) -> Result<(), StoreError> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" \
                 (\"uuid\" varchar(64), \"key\" varchar(64), \"ip\" varchar(64))",
                self.table
            ),
            [],
        )?;
        self.table_ready.store(true, Ordering::Release);
        tracing::debug!(table = %self.table, "credentials table ready");
        Ok(())
    }

    fn select(
        &self,
        player_id: PlayerId,
        column: Column,
    ) -> Result<Option<String>, StoreError> {
        self.ensure_table()?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT \"{}\" FROM \"{}\" WHERE \"uuid\" = ?1",
                    column.name(),
                    self.table
                ),
                params![player_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(value.filter(|v| !v.is_empty()))
    }

    fn upsert(
        &self,
        player_id: PlayerId,
        column: Column,
        value: &str,
    ) -> Result<String, StoreError> {
        self.ensure_table()?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let uuid = player_id.to_string();

        let exists = tx
            .query_row(
                &format!("SELECT 1 FROM \"{}\" WHERE \"uuid\" = ?1", self.table),
                params![uuid],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if exists {
            tx.execute(
                &format!(
                    "UPDATE \"{}\" SET \"{}\" = ?1 WHERE \"uuid\" = ?2",
                    self.table,
                    column.name()
                ),
                params![value, uuid],
            )?;
        } else {
            let (key, ip) = match column {
                Column::Key => (value, ""),
                Column::Ip => ("", value),
            };
            tx.execute(
                &format!(
                    "INSERT INTO \"{}\" (\"uuid\", \"key\", \"ip\") VALUES (?1, ?2, ?3)",
                    self.table
                ),
                params![uuid, key, ip],
            )?;
        }

        tx.commit()?;
        Ok(value.to_string())
    }
}

impl CredentialStore for SqliteStore {
    fn init(&self) -> Result<(), StoreError> {
        self.ensure_table()
    }

    fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.select(player_id, Column::Key)
    }

    fn set_secret(
        &self,
        player_id: PlayerId,
        secret: &str,
    ) -> Result<String, StoreError> {
        self.upsert(player_id, Column::Key, secret)
    }

    fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.select(player_id, Column::Ip)
    }

    fn set_address(
        &self,
        player_id: PlayerId,
        address: &str,
    ) -> Result<String, StoreError> {
        self.upsert(player_id, Column::Ip, address)
    }
}
