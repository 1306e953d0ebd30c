//! In-process transport: a pair of channels dressed up as a connection.
//!
//! Used to wire a proxy hub and a backend client together inside one
//! process (tests, single-binary deployments) without opening a socket.

use tokio::sync::{Mutex, mpsc};

use crate::{Connection, ConnectionId, Connector, Transport, TransportError};

/// One end of an in-memory duplex channel.
pub struct MemoryConnection {
    id: ConnectionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Creates two connected ends. Bytes sent on one arrive on the other.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemoryConnection {
        id: ConnectionId::next(),
        outbound: Mutex::new(Some(a_tx)),
        inbound: Mutex::new(b_rx),
    };
    let b = MemoryConnection {
        id: ConnectionId::next(),
        outbound: Mutex::new(Some(b_tx)),
        inbound: Mutex::new(a_rx),
    };
    (a, b)
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().await;
        let tx = outbound
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionClosed("closed locally".into()))?;
        tx.send(data.to_vec())
            .map_err(|_| TransportError::ConnectionClosed("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping our sender ends the peer's `recv` with `None`.
        self.outbound.lock().await.take();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Creates a listener/dialer pair. Every [`MemoryConnector::connect`]
/// hands one end of a fresh [`pair`] to the [`MemoryTransport`].
pub fn listener() -> (MemoryTransport, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryTransport { incoming: rx }, MemoryConnector { listener: tx })
}

/// Accept side of [`listener`].
pub struct MemoryTransport {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Dial side of [`listener`]. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    listener: mpsc::UnboundedSender<MemoryConnection>,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let (local, remote) = pair();
        self.listener.send(remote).map_err(|_| {
            TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory listener dropped",
            ))
        })?;
        Ok(local)
    }
}
