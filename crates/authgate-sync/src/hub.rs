//! Proxy side: push state to the backend each player is routed to.
//!
//! The proxy's [`AuthMachine`] is the source of truth. [`SyncHub`] hooks
//! into it as a [`TransitionListener`] and, for every committed change,
//! queues a `StateUpdate` to whichever backend currently hosts the
//! player. Backends also ask (`Query`) when their copy goes stale.
//!
//! ```text
//!   AuthMachine ──on_committed──→ HubListener ──→ routes[player] = "lobby-1"
//!                                                       │
//!                                  nodes["lobby-1"].outbound (mpsc)
//!                                                       │
//!                         node task: select! { outbound → conn.send,
//!                                              conn.recv → Query / Heartbeat }
//! ```
//!
//! Pushes are best-effort: a player routed to a backend that isn't
//! connected, or whose outbound queue is full, is simply skipped, and the
//! backend re-queries later.
//!
//! Every push reads the state and queues it under the player's
//! transition lock (it runs from `on_committed`, or through
//! [`AuthMachine::inspect`]), so a backend receives a player's updates
//! in commit order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use authgate_protocol::{
    AuthState, Codec, Envelope, JsonCodec, PROTOCOL_VERSION, PlayerId, SyncMessage, UpdateReason,
};
use authgate_session::{AuthMachine, ListenerId, StateTransitionEvent, TransitionListener};
use authgate_transport::{Connection, ConnectionId, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::link::{self, Stamp};
use crate::{HubConfig, SyncError};

#[derive(Debug, Clone)]
struct NodeLink {
    conn_id: ConnectionId,
    outbound: mpsc::Sender<Envelope>,
}

struct HubState<C: Codec> {
    machine: Arc<AuthMachine>,
    codec: C,
    config: HubConfig,
    stamp: Stamp,
    nodes: RwLock<HashMap<String, NodeLink>>,
    routes: RwLock<HashMap<PlayerId, String>>,
}

impl<C: Codec> HubState<C> {
    /// Queues a state update for the player's backend. Returns `false` if
    /// the player isn't routed anywhere or their backend is offline.
    fn push(&self, player_id: PlayerId, state: AuthState, reason: UpdateReason) -> bool {
        let Some(node) = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player_id)
            .cloned()
        else {
            return false;
        };
        let Some(link) = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .cloned()
        else {
            tracing::debug!(%player_id, %node, "backend offline, update not pushed");
            return false;
        };

        let envelope = self.stamp.envelope(SyncMessage::StateUpdate {
            player_id,
            state,
            reason,
        });
        match link.outbound.try_send(envelope) {
            Ok(()) => {
                tracing::debug!(%player_id, %node, %state, ?reason, "state pushed");
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%player_id, %node, %state, ?reason, "backend queue full, update dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn attach(&self, node: &str, link: NodeLink) {
        let previous = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.to_string(), link);
        if previous.is_some() {
            tracing::info!(%node, "backend reconnected, replacing old link");
        }
    }

    /// Removes the node's link, unless a newer connection already
    /// replaced it.
    fn detach(&self, node: &str, conn_id: ConnectionId) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.get(node).is_some_and(|link| link.conn_id == conn_id) {
            nodes.remove(node);
            tracing::info!(%node, "backend disconnected");
        }
    }

    fn routed_to(&self, node: &str) -> Vec<PlayerId> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, routed)| routed.as_str() == node)
            .map(|(player_id, _)| *player_id)
            .collect()
    }
}

/// Forwards committed transitions to the hub. Holds a `Weak` so the
/// machine doesn't keep a dropped hub alive.
struct HubListener<C: Codec> {
    state: Weak<HubState<C>>,
}

impl<C: Codec> TransitionListener for HubListener<C> {
    fn on_committed(&self, event: &StateTransitionEvent) {
        if let Some(state) = self.state.upgrade() {
            state.push(event.player_id(), event.new_state(), UpdateReason::Changed);
        }
    }
}

// ---------------------------------------------------------------------------
// SyncHub
// ---------------------------------------------------------------------------

/// The proxy's end of cross-node sync.
///
/// Share it behind an `Arc`: one task runs [`serve`](Self::serve), the
/// proxy's event handlers call [`player_switch`](Self::player_switch) and
/// [`player_left`](Self::player_left). Dropping the hub unregisters its
/// listener from the machine.
pub struct SyncHub<C: Codec = JsonCodec> {
    state: Arc<HubState<C>>,
    listener: ListenerId,
}

impl SyncHub<JsonCodec> {
    pub fn new(machine: Arc<AuthMachine>, config: HubConfig) -> Self {
        Self::with_codec(machine, JsonCodec, config)
    }
}

impl<C: Codec> SyncHub<C> {
    pub fn with_codec(machine: Arc<AuthMachine>, codec: C, config: HubConfig) -> Self {
        let state = Arc::new(HubState {
            machine: Arc::clone(&machine),
            codec,
            config,
            stamp: Stamp::new(),
            nodes: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
        });
        let listener = machine.add_listener(Arc::new(HubListener {
            state: Arc::downgrade(&state),
        }));
        Self { state, listener }
    }

    /// Records that `player_id` now plays on `node` and sends that
    /// backend the player's current state. Returns `true` if the update
    /// was queued (the backend is connected).
    pub fn player_switch(&self, player_id: PlayerId, node: impl Into<String>) -> bool {
        let node = node.into();
        tracing::debug!(%player_id, %node, "player switched server");
        self.state
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player_id, node);
        self.state.machine.inspect(player_id, |current| {
            self.state.push(player_id, current, UpdateReason::Switch)
        })
    }

    /// Stops routing updates for a player who left the network.
    pub fn player_left(&self, player_id: PlayerId) {
        self.state
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&player_id);
    }

    /// The backend a player is routed to, if any.
    pub fn route(&self, player_id: PlayerId) -> Option<String> {
        self.state
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player_id)
            .cloned()
    }

    /// Names of the backends currently connected.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .state
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_node_connected(&self, node: &str) -> bool {
        self.state
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node)
    }

    /// Accepts backend connections until the transport shuts down. Each
    /// backend is served on its own task.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<(), SyncError> {
        tracing::info!("sync hub accepting backends");
        loop {
            match transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_node(conn, state).await {
                            tracing::debug!(error = %e, "backend link ended with error");
                        }
                    });
                }
                Err(TransportError::Shutdown) => {
                    tracing::info!("sync hub stopped");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

impl<C: Codec> Drop for SyncHub<C> {
    fn drop(&mut self) {
        self.state.machine.remove_listener(self.listener);
    }
}

// ---------------------------------------------------------------------------
// Per-backend task
// ---------------------------------------------------------------------------

async fn handle_node<Conn, C>(conn: Conn, state: Arc<HubState<C>>) -> Result<(), SyncError>
where
    Conn: Connection,
    C: Codec,
{
    let conn_id = conn.id();
    let node = match handshake(&conn, &state).await {
        Ok(node) => node,
        Err(e) => {
            tracing::warn!(%conn_id, error = %e, "backend handshake failed");
            let _ = conn.close().await;
            return Err(e);
        }
    };
    tracing::info!(%conn_id, %node, "backend registered");

    let routed = state.routed_to(&node);
    let (outbound, mut rx) = mpsc::channel(routed.len() + link::OUTBOUND_QUEUE);
    state.attach(
        &node,
        NodeLink {
            conn_id,
            outbound: outbound.clone(),
        },
    );

    // Bring the backend up to date on everyone already routed to it. The
    // link is attached first, so a change committed after a player's
    // snapshot entry is queued behind it rather than lost.
    for player_id in routed {
        state.machine.inspect(player_id, |current| {
            let _ = outbound.try_send(state.stamp.envelope(SyncMessage::StateUpdate {
                player_id,
                state: current,
                reason: UpdateReason::Snapshot,
            }));
        });
    }
    // Only the registry holds a sender now, so replacing the link ends
    // this loop.
    drop(outbound);

    let idle = state.config.idle_timeout();
    let mut last_inbound = Instant::now();

    let result = loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(envelope) => {
                    if let Err(e) = link::send(&conn, &state.codec, &envelope).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            inbound = conn.recv() => match inbound {
                Ok(Some(bytes)) => {
                    last_inbound = Instant::now();
                    if let Err(e) = handle_inbound(&conn, &state, &node, &bytes).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            },
            _ = tokio::time::sleep_until(last_inbound + idle) => {
                tracing::warn!(%node, "backend idle, dropping link");
                break Err(SyncError::Timeout);
            }
        }
    };

    state.detach(&node, conn_id);
    let _ = conn.close().await;
    result
}

/// Waits for `Hello`, checks the version, answers `HelloAck`.
async fn handshake<Conn: Connection, C: Codec>(
    conn: &Conn,
    state: &HubState<C>,
) -> Result<String, SyncError> {
    let envelope = link::recv(conn, &state.codec, state.config.handshake_timeout())
        .await?
        .ok_or_else(|| SyncError::Handshake("closed before Hello".into()))?;

    let (version, node) = match envelope.payload {
        SyncMessage::Hello { version, node } => (version, node),
        _ => {
            send_error(conn, state, 400, "expected Hello").await?;
            return Err(SyncError::Handshake("first message must be Hello".into()));
        }
    };

    if version != PROTOCOL_VERSION {
        let message = format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}");
        send_error(conn, state, 400, &message).await?;
        return Err(SyncError::Handshake(message));
    }

    let ack = state.stamp.reply(
        envelope.seq,
        SyncMessage::HelloAck {
            version: PROTOCOL_VERSION,
        },
    );
    link::send(conn, &state.codec, &ack).await?;
    Ok(node)
}

async fn handle_inbound<Conn: Connection, C: Codec>(
    conn: &Conn,
    state: &HubState<C>,
    node: &str,
    bytes: &[u8],
) -> Result<(), SyncError> {
    let envelope: Envelope = match state.codec.decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(%node, error = %e, "undecodable message from backend");
            return send_error(conn, state, 400, "malformed envelope").await;
        }
    };

    match envelope.payload {
        SyncMessage::Query { player_id } => {
            let answer = state.machine.registry().state(player_id);
            tracing::debug!(%node, %player_id, state = ?answer, "answering query");
            let reply = state.stamp.reply(
                envelope.seq,
                SyncMessage::QueryReply {
                    player_id,
                    state: answer,
                },
            );
            link::send(conn, &state.codec, &reply).await
        }
        SyncMessage::Heartbeat => {
            let ack = state.stamp.reply(envelope.seq, SyncMessage::HeartbeatAck);
            link::send(conn, &state.codec, &ack).await
        }
        SyncMessage::HeartbeatAck => Ok(()),
        SyncMessage::Hello { .. } => send_error(conn, state, 409, "already registered").await,
        SyncMessage::Error { code, message } => {
            tracing::warn!(%node, code, %message, "backend reported error");
            Ok(())
        }
        other => {
            tracing::debug!(%node, message = ?other, "ignoring unexpected message");
            Ok(())
        }
    }
}

async fn send_error<Conn: Connection, C: Codec>(
    conn: &Conn,
    state: &HubState<C>,
    code: u16,
    message: &str,
) -> Result<(), SyncError> {
    let envelope = state.stamp.envelope(SyncMessage::Error {
        code,
        message: message.to_string(),
    });
    link::send(conn, &state.codec, &envelope).await
}
