//! Error types for the sync layer.

use authgate_protocol::ProtocolError;
use authgate_transport::TransportError;

/// Errors from the proxy hub and the backend client.
///
/// [`Unavailable`](Self::Unavailable) is the one gates care about: the
/// backend can't reach the proxy and falls back to a fail-closed answer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No live link to the proxy.
    #[error("sync channel unavailable")]
    Unavailable,

    /// The proxy didn't answer a query in time.
    #[error("sync query timed out")]
    Timeout,

    /// The peer rejected or botched the Hello exchange.
    #[error("sync handshake failed: {0}")]
    Handshake(String),
}
