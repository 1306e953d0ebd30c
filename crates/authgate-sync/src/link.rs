//! Envelope plumbing shared by the hub and the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use authgate_protocol::{Codec, Envelope, SyncMessage};
use authgate_transport::Connection;

use crate::SyncError;

/// Outbound envelopes a link buffers beyond its initial snapshot. Pushes
/// past this are dropped; the backend catches up by re-querying.
pub(crate) const OUTBOUND_QUEUE: usize = 256;

/// Per-node sequence counter and clock for stamping envelopes.
#[derive(Debug)]
pub(crate) struct Stamp {
    start: Instant,
    seq: AtomicU64,
}

impl Stamp {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            seq: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub(crate) fn envelope(&self, payload: SyncMessage) -> Envelope {
        self.reply(self.next_seq(), payload)
    }

    /// An envelope that reuses `seq`, for answers to a request.
    pub(crate) fn reply(&self, seq: u64, payload: SyncMessage) -> Envelope {
        Envelope {
            seq,
            timestamp: self.now_ms(),
            payload,
        }
    }
}

pub(crate) async fn send<Conn: Connection, C: Codec>(
    conn: &Conn,
    codec: &C,
    envelope: &Envelope,
) -> Result<(), SyncError> {
    let bytes = codec.encode(envelope)?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Next envelope from `conn`.
///
/// `Ok(None)` when the peer closed, [`SyncError::Timeout`] if nothing
/// arrived within `timeout`, [`SyncError::Protocol`] for bytes that don't
/// decode.
pub(crate) async fn recv<Conn: Connection, C: Codec>(
    conn: &Conn,
    codec: &C,
    timeout: Duration,
) -> Result<Option<Envelope>, SyncError> {
    match tokio::time::timeout(timeout, conn.recv()).await {
        Ok(Ok(Some(bytes))) => Ok(Some(codec.decode(&bytes)?)),
        Ok(Ok(None)) => Ok(None),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SyncError::Timeout),
    }
}
