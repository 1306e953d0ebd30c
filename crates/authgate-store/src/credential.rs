use authgate_protocol::PlayerId;
use serde::{Deserialize, Serialize};

/// Everything the store knows about one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub player_id: PlayerId,

    /// Base32 TOTP secret. Empty when 2FA is disabled.
    pub secret: String,

    /// Address of the last connection that passed verification.
    pub address: Option<String>,
}

impl Credential {
    /// Returns `true` if this credential enrolls the player.
    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }
}
