//! Unified error type for Authgate.

use std::path::PathBuf;

use authgate_protocol::ProtocolError;
use authgate_session::SessionError;
use authgate_store::StoreError;
use authgate_sync::SyncError;
use authgate_totp::TotpError;
use authgate_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// Host adapters deal with this one type instead of importing errors from
/// each sub-crate. The `#[from]` conversions let `?` do the wrapping.
#[derive(Debug, thiserror::Error)]
pub enum AuthGateError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Totp(#[from] TotpError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The config file couldn't be read or written.
    #[error("config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file isn't valid JSON for [`AuthGateConfig`](crate::AuthGateConfig).
    #[error("config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The operation belongs to a different node role, e.g. submitting a
    /// code on a backend that defers to its proxy.
    #[error("not available on a {0} node")]
    WrongRole(&'static str),
}

#[cfg(test)]
mod tests {
    use authgate_protocol::PlayerId;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let gate_err: AuthGateError = err.into();
        assert!(matches!(gate_err, AuthGateError::Transport(_)));
        assert!(gate_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let gate_err: AuthGateError = err.into();
        assert!(matches!(gate_err, AuthGateError::Protocol(_)));
    }

    #[test]
    fn test_from_store_error() {
        let gate_err: AuthGateError = StoreError::Unavailable("db down".into()).into();
        assert!(matches!(gate_err, AuthGateError::Store(_)));
        assert!(gate_err.to_string().contains("db down"));
    }

    #[test]
    fn test_from_session_error() {
        let player = PlayerId::random();
        let gate_err: AuthGateError = SessionError::AlreadyEnrolled(player).into();
        assert!(matches!(gate_err, AuthGateError::Session(_)));
        assert!(gate_err.to_string().contains(&player.to_string()));
    }

    #[test]
    fn test_from_sync_and_totp_errors() {
        let sync: AuthGateError = SyncError::Unavailable.into();
        assert!(matches!(sync, AuthGateError::Sync(_)));

        let totp: AuthGateError = TotpError::InvalidDigits(9).into();
        assert!(matches!(totp, AuthGateError::Totp(_)));
    }
}
