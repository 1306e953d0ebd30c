//! Flat-file credential store.
//!
//! The whole table lives in one pretty-printed JSON document keyed by
//! player id. It is read once on open and rewritten after every change
//! (write to `<file>.tmp`, then rename over the original).

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use authgate_protocol::PlayerId;
use serde::{Deserialize, Serialize};

use crate::{CredentialStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    #[serde(default)]
    key: String,
    #[serde(default)]
    ip: String,
}

/// A [`CredentialStore`] persisted as a JSON file.
///
/// Suited to small servers that don't want a database. Every write
/// rewrites the file, so write throughput is bounded by the disk.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<PlayerId, Entry>>,
}

impl FileStore {
    /// Opens the store at `path`. A missing file is an empty store; the
    /// file is created on the first write.
    ///
    /// # Errors
    /// [`StoreError::Io`] if the file exists but can't be read,
    /// [`StoreError::Corrupt`] if it isn't valid JSON.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), players = entries.len(), "loaded credentials file");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<PlayerId, Entry>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read(
        &self,
        player_id: PlayerId,
        column: impl Fn(&Entry) -> &String,
    ) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&player_id)
            .map(column)
            .filter(|v| !v.is_empty())
            .cloned())
    }

    fn write(
        &self,
        player_id: PlayerId,
        value: &str,
        column: impl Fn(&mut Entry) -> &mut String,
    ) -> Result<String, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.get(&player_id).cloned();
        *column(entries.entry(player_id).or_default()) = value.to_string();

        if let Err(e) = self.flush(&entries) {
            // Keep memory in step with what is on disk.
            match previous {
                Some(entry) => entries.insert(player_id, entry),
                None => entries.remove(&player_id),
            };
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write credentials file");
            return Err(e);
        }
        Ok(value.to_string())
    }
}

impl CredentialStore for FileStore {
    fn init(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            return Ok(());
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush(&entries)
    }

    fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.read(player_id, |e| &e.key)
    }

    fn set_secret(
        &self,
        player_id: PlayerId,
        secret: &str,
    ) -> Result<String, StoreError> {
        self.write(player_id, secret, |e| &mut e.key)
    }

    fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.read(player_id, |e| &e.ip)
    }

    fn set_address(
        &self,
        player_id: PlayerId,
        address: &str,
    ) -> Result<String, StoreError> {
        self.write(player_id, address, |e| &mut e.ip)
    }
}
