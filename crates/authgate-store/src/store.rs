//! The credential store contract.

use authgate_protocol::PlayerId;

use crate::{Credential, StoreError};

/// Durable mapping from player identity to TOTP secret and last address.
///
/// # Trait bounds
///
/// - `Send + Sync` → one store is shared by every worker thread in the
///   [`StorageWorker`](crate::StorageWorker) pool.
/// - `'static` → the store lives as long as the node that owns it.
///
/// The trait is object safe; the auth layer holds an
/// `Arc<dyn CredentialStore>` so the backend can be chosen from config.
///
/// # Example
///
/// ```rust
/// use authgate_protocol::PlayerId;
/// use authgate_store::{CredentialStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// let player = PlayerId::random();
///
/// assert_eq!(store.get_secret(player).unwrap(), None);
/// store.set_secret(player, "JBSWY3DPEHPK3PXP").unwrap();
/// assert!(store.has_secret(player).unwrap());
///
/// // Disabling keeps the row, it only blanks the secret.
/// store.remove_secret(player).unwrap();
/// assert_eq!(store.get_secret(player).unwrap(), None);
/// ```
pub trait CredentialStore: Send + Sync + 'static {
    /// Prepares the backing storage ("create table if not exists").
    ///
    /// Must be idempotent. Backends that fail here are expected to retry
    /// lazily on the next access rather than refuse to start.
    fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Returns the player's secret, or `None` if there is no row or the
    /// secret is empty.
    fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError>;

    /// Upserts the player's secret and returns the committed value.
    /// Writing `""` disables 2FA for the player.
    fn set_secret(
        &self,
        player_id: PlayerId,
        secret: &str,
    ) -> Result<String, StoreError>;

    /// Returns the last verified address, or `None` if unknown.
    fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError>;

    /// Upserts the last verified address and returns the committed value.
    /// Leaves the secret column untouched.
    fn set_address(
        &self,
        player_id: PlayerId,
        address: &str,
    ) -> Result<String, StoreError>;

    /// Returns `true` if the player has a non-empty secret.
    fn has_secret(&self, player_id: PlayerId) -> Result<bool, StoreError> {
        Ok(self.get_secret(player_id)?.is_some())
    }

    /// Blanks the player's secret. Idempotent.
    fn remove_secret(&self, player_id: PlayerId) -> Result<(), StoreError> {
        self.set_secret(player_id, "").map(|_| ())
    }

    /// Reads secret and address together. `None` if neither is set.
    fn credential(
        &self,
        player_id: PlayerId,
    ) -> Result<Option<Credential>, StoreError> {
        let secret = self.get_secret(player_id)?;
        let address = self.get_address(player_id)?;
        if secret.is_none() && address.is_none() {
            return Ok(None);
        }
        Ok(Some(Credential {
            player_id,
            secret: secret.unwrap_or_default(),
            address,
        }))
    }
}
