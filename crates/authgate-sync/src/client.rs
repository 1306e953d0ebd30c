//! Backend side: mirror the proxy's state and answer gate checks.
//!
//! Each backend keeps its own [`AuthMachine`] with a local copy of every
//! player's state. The copy is fed by the proxy's pushes and trusted for
//! [`ClientConfig::staleness_secs`]. A gate check on an older copy
//! re-queries the proxy first. If the link is down or the query times
//! out, the answer fails closed: a `Verified` copy is reported as
//! `Pending` so nothing privileged slips through.
//!
//! ```text
//!   proxy ──StateUpdate──→ run() ──apply──→ AuthMachine (local copy)
//!                                                 ↑
//!   Gate ──query_state──→ resolve(): fresh? ──yes─┘
//!                                  │ no
//!                                  └──Query──→ proxy ──QueryReply──→ apply
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use authgate_protocol::{
    AuthState, Codec, Envelope, JsonCodec, PROTOCOL_VERSION, PlayerId, SyncMessage, UpdateReason,
};
use authgate_session::{AuthMachine, StateSource};
use authgate_transport::{Connection, Connector};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::link::{self, Stamp};
use crate::{ClientConfig, SyncError};

type PendingQueries = HashMap<u64, oneshot::Sender<Option<AuthState>>>;

struct ClientState<C: Codec> {
    machine: Arc<AuthMachine>,
    codec: C,
    config: ClientConfig,
    stamp: Stamp,
    /// Sender into the live connection's outbound queue, if connected.
    link: Mutex<Option<mpsc::Sender<Envelope>>>,
    pending: Mutex<PendingQueries>,
    /// When each player's copy was last confirmed by the proxy.
    confirmed: Mutex<HashMap<PlayerId, Instant>>,
    shutdown: watch::Sender<bool>,
}

/// The backend's end of cross-node sync. Cheap to clone; clones share
/// the same link and local copy.
pub struct SyncClient<C: Codec = JsonCodec> {
    state: Arc<ClientState<C>>,
}

impl<C: Codec> Clone for SyncClient<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl SyncClient<JsonCodec> {
    pub fn new(machine: Arc<AuthMachine>, config: ClientConfig) -> Self {
        Self::with_codec(machine, JsonCodec, config)
    }
}

impl<C: Codec> SyncClient<C> {
    pub fn with_codec(machine: Arc<AuthMachine>, codec: C, config: ClientConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ClientState {
                machine,
                codec,
                config,
                stamp: Stamp::new(),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                confirmed: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn machine(&self) -> &Arc<AuthMachine> {
        &self.state.machine
    }

    pub fn config(&self) -> &ClientConfig {
        &self.state.config
    }

    /// `true` while a handshaken link to the proxy is up.
    pub fn is_connected(&self) -> bool {
        self.state
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// A player joined this backend. They start `Unregistered` locally
    /// until the proxy's `Switch` push (or a query) says otherwise.
    pub fn player_joined(&self, player_id: PlayerId, address: Option<String>) {
        let registry = self.state.machine.registry();
        if !registry.contains(player_id) {
            registry.register(player_id, address);
        }
    }

    pub fn player_left(&self, player_id: PlayerId) {
        self.state.machine.registry().disconnect(player_id);
        self.confirmed().remove(&player_id);
    }

    /// The local copy, without any freshness check.
    pub fn local_state(&self, player_id: PlayerId) -> AuthState {
        self.state.machine.get_state(player_id)
    }

    /// The state a gate on this backend should act on.
    ///
    /// Returns the local copy while it is fresh. Otherwise asks the
    /// proxy, applies the answer and returns it. A player the proxy
    /// doesn't know is `Unregistered`. Without an answer the local copy
    /// is returned with `Verified` downgraded to `Pending`.
    pub async fn resolve(&self, player_id: PlayerId) -> AuthState {
        let local = self.local_state(player_id);
        if self.is_fresh(player_id) {
            return local;
        }

        match self.query(player_id).await {
            Ok(Some(remote)) => {
                if self.apply(player_id, remote, true) {
                    remote
                } else {
                    fail_closed(self.local_state(player_id))
                }
            }
            Ok(None) => {
                tracing::debug!(%player_id, "proxy doesn't know player");
                AuthState::Unregistered
            }
            Err(e) => {
                tracing::warn!(%player_id, error = %e, "sync unavailable, failing closed");
                fail_closed(local)
            }
        }
    }

    /// Asks the proxy for a player's state. `Ok(None)` means the proxy
    /// has no such player.
    pub async fn query(&self, player_id: PlayerId) -> Result<Option<AuthState>, SyncError> {
        let sender = self
            .state
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SyncError::Unavailable)?;

        let seq = self.state.stamp.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(seq, tx);

        let envelope = self
            .state
            .stamp
            .reply(seq, SyncMessage::Query { player_id });
        if let Err(e) = sender.try_send(envelope) {
            self.pending().remove(&seq);
            if matches!(e, TrySendError::Full(_)) {
                tracing::warn!(%player_id, "sync queue full, query not sent");
            }
            return Err(SyncError::Unavailable);
        }

        match tokio::time::timeout(self.state.config.query_timeout(), rx).await {
            Ok(Ok(answer)) => Ok(answer),
            // Sender dropped: the link went down while we waited.
            Ok(Err(_)) => Err(SyncError::Unavailable),
            Err(_) => {
                self.pending().remove(&seq);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Keeps a link to the proxy up until [`shutdown`](Self::shutdown),
    /// reconnecting after every drop.
    pub async fn run<K: Connector>(&self, connector: K) -> Result<(), SyncError> {
        let mut stop = self.state.shutdown.subscribe();
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            match connector.connect().await {
                Ok(conn) => {
                    let result = self.session(&conn, &mut stop).await;
                    self.link_down();
                    let _ = conn.close().await;
                    match result {
                        Ok(()) => tracing::info!(node = %self.state.config.node, "sync link closed"),
                        Err(e) => {
                            tracing::warn!(node = %self.state.config.node, error = %e, "sync link lost")
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not reach proxy");
                }
            }

            if *stop.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.state.config.reconnect_delay()) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// Stops [`run`](Self::run) and closes the link.
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    // -- internals --

    async fn session<Conn: Connection>(
        &self,
        conn: &Conn,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let state = &self.state;
        let hello = state.stamp.envelope(SyncMessage::Hello {
            version: PROTOCOL_VERSION,
            node: state.config.node.clone(),
        });
        link::send(conn, &state.codec, &hello).await?;

        let heartbeat = state.config.heartbeat_interval();
        let deadline = heartbeat * 3;
        let ack = link::recv(conn, &state.codec, deadline)
            .await?
            .ok_or_else(|| SyncError::Handshake("proxy closed during handshake".into()))?;
        match ack.payload {
            SyncMessage::HelloAck { version } if version == PROTOCOL_VERSION => {}
            SyncMessage::HelloAck { version } => {
                return Err(SyncError::Handshake(format!(
                    "proxy speaks version {version}"
                )));
            }
            SyncMessage::Error { code, message } => {
                return Err(SyncError::Handshake(format!("{code}: {message}")));
            }
            other => {
                return Err(SyncError::Handshake(format!("unexpected {other:?}")));
            }
        }

        let (outbound, mut rx) = mpsc::channel(link::OUTBOUND_QUEUE);
        *state.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound);
        tracing::info!(node = %state.config.node, "sync link up");

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        let mut last_inbound = tokio::time::Instant::now();

        loop {
            tokio::select! {
                queued = rx.recv() => match queued {
                    Some(envelope) => link::send(conn, &state.codec, &envelope).await?,
                    None => return Ok(()),
                },
                inbound = conn.recv() => match inbound? {
                    Some(bytes) => {
                        last_inbound = tokio::time::Instant::now();
                        self.handle_inbound(conn, &bytes).await?;
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    if last_inbound.elapsed() >= deadline {
                        return Err(SyncError::Timeout);
                    }
                    let beat = state.stamp.envelope(SyncMessage::Heartbeat);
                    link::send(conn, &state.codec, &beat).await?;
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }

    async fn handle_inbound<Conn: Connection>(
        &self,
        conn: &Conn,
        bytes: &[u8],
    ) -> Result<(), SyncError> {
        let envelope: Envelope = match self.state.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable message from proxy");
                return Ok(());
            }
        };

        match envelope.payload {
            SyncMessage::StateUpdate {
                player_id,
                state,
                reason,
            } => {
                // A `Changed` push for someone who isn't here is noise;
                // `Switch` and `Snapshot` announce the player.
                self.apply(player_id, state, reason != UpdateReason::Changed);
            }
            SyncMessage::QueryReply { state, .. } => {
                if let Some(waiter) = self.pending().remove(&envelope.seq) {
                    let _ = waiter.send(state);
                }
            }
            SyncMessage::Heartbeat => {
                let ack = self
                    .state
                    .stamp
                    .reply(envelope.seq, SyncMessage::HeartbeatAck);
                link::send(conn, &self.state.codec, &ack).await?;
            }
            SyncMessage::HeartbeatAck => {}
            SyncMessage::Error { code, message } => {
                tracing::warn!(code, %message, "proxy reported error");
            }
            other => {
                tracing::debug!(message = ?other, "ignoring unexpected message");
            }
        }
        Ok(())
    }

    /// Writes the proxy's answer into the local copy. The local machine
    /// is a mirror, so any transition the proxy made is taken as-is.
    fn apply(&self, player_id: PlayerId, state: AuthState, register: bool) -> bool {
        let registry = self.state.machine.registry();
        if !registry.contains(player_id) {
            if !register {
                return false;
            }
            registry.register(player_id, None);
        }

        match self.state.machine.change_state(player_id, state) {
            Ok(_) => {
                self.confirmed().insert(player_id, Instant::now());
                true
            }
            Err(e) => {
                tracing::warn!(%player_id, %state, error = %e, "could not apply proxy state");
                false
            }
        }
    }

    fn is_fresh(&self, player_id: PlayerId) -> bool {
        let staleness = self.state.config.staleness();
        self.confirmed()
            .get(&player_id)
            .is_some_and(|at| at.elapsed() < staleness)
    }

    fn link_down(&self) {
        self.state
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the senders wakes every waiting query with `Unavailable`.
        self.pending().clear();
        // Nothing the proxy said can be trusted past a disconnect.
        self.confirmed().clear();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingQueries> {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn confirmed(&self) -> std::sync::MutexGuard<'_, HashMap<PlayerId, Instant>> {
        self.state
            .confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Codec> StateSource for SyncClient<C> {
    async fn query_state(&self, player_id: PlayerId) -> AuthState {
        self.resolve(player_id).await
    }
}

fn fail_closed(state: AuthState) -> AuthState {
    match state {
        AuthState::Verified => AuthState::Pending,
        other => other,
    }
}
