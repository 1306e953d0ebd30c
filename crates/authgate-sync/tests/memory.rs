//! Proxy ↔ backend sync over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use authgate_protocol::{
    AuthState, Codec, Envelope, JsonCodec, PROTOCOL_VERSION, PlayerId, SyncMessage, UpdateReason,
};
use authgate_session::{AuthMachine, AuthRegistry, AuthService, SessionConfig, StateSource};
use authgate_store::{MemoryStore, StorageWorker};
use authgate_sync::{ClientConfig, HubConfig, SyncClient, SyncHub};
use authgate_totp::{Totp, TotpConfig, unix_now};
use authgate_transport::memory::{self, MemoryConnection, MemoryConnector, MemoryTransport};
use authgate_transport::{Connection, Connector, Transport};

// -- Helpers --------------------------------------------------------------

fn machine() -> Arc<AuthMachine> {
    Arc::new(AuthMachine::new(Arc::new(AuthRegistry::new())))
}

fn client_config(staleness_secs: u64) -> ClientConfig {
    ClientConfig {
        node: "lobby".into(),
        staleness_secs,
        query_timeout_ms: 500,
        reconnect_delay_ms: 50,
        heartbeat_interval_ms: 200,
    }
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

struct Network {
    proxy: Arc<AuthMachine>,
    hub: Arc<SyncHub>,
    backend: SyncClient,
    connector: MemoryConnector,
}

/// Starts a hub on a fresh memory listener. The backend client is built
/// but not yet running.
fn network(staleness_secs: u64) -> Network {
    let proxy = machine();
    let hub = Arc::new(SyncHub::new(proxy.clone(), HubConfig::default()));
    let (transport, connector) = memory::listener();
    let serving = hub.clone();
    tokio::spawn(async move { serving.serve(transport).await });
    let backend = SyncClient::new(machine(), client_config(staleness_secs));
    Network {
        proxy,
        hub,
        backend,
        connector,
    }
}

impl Network {
    async fn start_backend(&self) {
        let client = self.backend.clone();
        let connector = self.connector.clone();
        tokio::spawn(async move { client.run(connector).await });
        assert!(eventually(|| self.backend.is_connected() && self.hub.is_node_connected("lobby")).await);
    }

    fn proxy_set(&self, player: PlayerId, state: AuthState) {
        if !self.proxy.registry().contains(player) {
            self.proxy.registry().register(player, None);
        }
        self.proxy.change_state(player, state).unwrap();
    }
}

fn encode(seq: u64, payload: SyncMessage) -> Vec<u8> {
    JsonCodec
        .encode(&Envelope {
            seq,
            timestamp: 0,
            payload,
        })
        .unwrap()
}

async fn next_envelope(conn: &MemoryConnection) -> Option<Envelope> {
    let bytes = tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("peer should answer")
        .unwrap()?;
    Some(JsonCodec.decode(&bytes).unwrap())
}

// =========================================================================
// Pushes
// =========================================================================

#[tokio::test]
async fn test_verify_on_proxy_is_pushed_to_backend() {
    let net = network(60);
    net.start_backend().await;

    let store = Arc::new(MemoryStore::new());
    let totp = Totp::new(TotpConfig::default()).unwrap();
    let service = AuthService::new(
        net.proxy.clone(),
        StorageWorker::new(store, 1),
        totp.clone(),
        SessionConfig::default(),
    );

    let player = PlayerId::random();
    service.on_connect(player, None).await;
    let enrollment = service.enroll(player).await.unwrap();
    assert!(net.hub.player_switch(player, "lobby"));
    assert!(eventually(|| net.backend.local_state(player) == AuthState::Pending).await);

    let now = unix_now();
    let code = totp.generate(&enrollment.secret, now).unwrap();
    assert!(service.verify_at(player, &code, now).await.unwrap().is_accepted());

    assert!(eventually(|| net.backend.local_state(player) == AuthState::Verified).await);
    assert_eq!(net.backend.query_state(player).await, AuthState::Verified);
}

#[tokio::test]
async fn test_player_switch_while_backend_offline_is_not_queued() {
    let net = network(60);
    let player = PlayerId::random();
    net.proxy_set(player, AuthState::Pending);

    assert!(!net.hub.player_switch(player, "lobby"));
    assert_eq!(net.hub.route(player).as_deref(), Some("lobby"));
}

#[tokio::test]
async fn test_backend_receives_snapshot_on_connect() {
    let net = network(60);
    let verified = PlayerId::random();
    let pending = PlayerId::random();
    net.proxy_set(verified, AuthState::Verified);
    net.proxy_set(pending, AuthState::Pending);
    net.hub.player_switch(verified, "lobby");
    net.hub.player_switch(pending, "lobby");

    net.start_backend().await;

    assert!(eventually(|| {
        net.backend.local_state(verified) == AuthState::Verified
            && net.backend.local_state(pending) == AuthState::Pending
    })
    .await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_during_backend_attach_ends_on_latest_state() {
    let net = network(60);
    let player = PlayerId::random();
    net.proxy_set(player, AuthState::Pending);
    net.hub.player_switch(player, "lobby");

    let client = net.backend.clone();
    let connector = net.connector.clone();
    tokio::spawn(async move { client.run(connector).await });
    while !net.hub.is_node_connected("lobby") {
        tokio::task::yield_now().await;
    }
    net.proxy_set(player, AuthState::Verified);

    assert!(eventually(|| net.backend.local_state(player) == AuthState::Verified).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(net.backend.local_state(player), AuthState::Verified);
}

#[tokio::test]
async fn test_snapshot_precedes_later_changes_on_the_wire() {
    let proxy = machine();
    let hub = Arc::new(SyncHub::new(proxy.clone(), HubConfig::default()));
    let (transport, connector) = memory::listener();
    let serving = hub.clone();
    tokio::spawn(async move { serving.serve(transport).await });

    let player = PlayerId::random();
    proxy.registry().register(player, None);
    proxy.change_state(player, AuthState::Pending).unwrap();
    hub.player_switch(player, "lobby");

    let conn = connector.connect().await.unwrap();
    conn.send(&encode(
        1,
        SyncMessage::Hello {
            version: PROTOCOL_VERSION,
            node: "lobby".into(),
        },
    ))
    .await
    .unwrap();
    next_envelope(&conn).await.unwrap();
    assert!(eventually(|| hub.is_node_connected("lobby")).await);
    proxy.change_state(player, AuthState::Verified).unwrap();

    let mut states = Vec::new();
    while states.last() != Some(&AuthState::Verified) {
        if let SyncMessage::StateUpdate { state, .. } = next_envelope(&conn).await.unwrap().payload {
            states.push(state);
        }
    }
    assert!(
        states == [AuthState::Pending, AuthState::Verified] || states == [AuthState::Verified],
        "unexpected order {states:?}"
    );
}

#[tokio::test]
async fn test_player_left_stops_routing() {
    let net = network(60);
    net.start_backend().await;
    let player = PlayerId::random();
    net.proxy_set(player, AuthState::Pending);
    net.hub.player_switch(player, "lobby");
    assert!(eventually(|| net.backend.local_state(player) == AuthState::Pending).await);

    net.hub.player_left(player);
    net.proxy.change_state(player, AuthState::Verified).unwrap();

    assert_eq!(net.hub.route(player), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(net.backend.local_state(player), AuthState::Pending);
}

// =========================================================================
// Queries
// =========================================================================

#[tokio::test]
async fn test_resolve_requeries_when_stale() {
    let net = network(0);
    net.start_backend().await;
    let player = PlayerId::random();
    net.backend.player_joined(player, None);
    // Known to the proxy but never pushed.
    net.proxy_set(player, AuthState::Verified);

    assert_eq!(net.backend.local_state(player), AuthState::Unregistered);
    assert_eq!(net.backend.resolve(player).await, AuthState::Verified);
    assert_eq!(net.backend.local_state(player), AuthState::Verified);
}

#[tokio::test]
async fn test_resolve_player_unknown_to_proxy_is_unregistered() {
    let net = network(0);
    net.start_backend().await;
    let player = PlayerId::random();
    net.backend.player_joined(player, None);

    assert_eq!(net.backend.query(player).await.unwrap(), None);
    assert_eq!(net.backend.resolve(player).await, AuthState::Unregistered);
}

#[tokio::test]
async fn test_resolve_without_link_fails_closed() {
    let backend = SyncClient::new(machine(), client_config(0));
    let player = PlayerId::random();
    backend.player_joined(player, None);
    backend.machine().change_state(player, AuthState::Verified).unwrap();

    assert_eq!(backend.resolve(player).await, AuthState::Pending);
    // The local copy itself is left alone.
    assert_eq!(backend.local_state(player), AuthState::Verified);
}

#[tokio::test]
async fn test_link_drop_fails_closed() {
    let (mut transport, connector) = memory::listener();
    let backend = SyncClient::new(machine(), client_config(60));
    let running = backend.clone();
    tokio::spawn(async move { running.run(connector).await });

    // Play the proxy by hand so the link can be cut at will.
    let conn = transport.accept().await.unwrap();
    let hello = next_envelope(&conn).await.unwrap();
    assert!(matches!(hello.payload, SyncMessage::Hello { .. }));
    let player = PlayerId::random();
    conn.send(&encode(1, SyncMessage::HelloAck { version: PROTOCOL_VERSION }))
        .await
        .unwrap();
    conn.send(&encode(
        2,
        SyncMessage::StateUpdate {
            player_id: player,
            state: AuthState::Verified,
            reason: UpdateReason::Switch,
        },
    ))
    .await
    .unwrap();
    assert!(eventually(|| backend.local_state(player) == AuthState::Verified).await);
    assert_eq!(backend.resolve(player).await, AuthState::Verified);

    conn.close().await.unwrap();
    drop(conn);
    assert!(eventually(|| !backend.is_connected()).await);

    assert_eq!(backend.resolve(player).await, AuthState::Pending);
    backend.shutdown();
    drop(transport);
}

#[tokio::test]
async fn test_changed_push_for_absent_player_is_ignored() {
    let (mut transport, connector) = memory::listener();
    let backend = SyncClient::new(machine(), client_config(60));
    let running = backend.clone();
    tokio::spawn(async move { running.run(connector).await });

    let conn = transport.accept().await.unwrap();
    next_envelope(&conn).await.unwrap();
    conn.send(&encode(1, SyncMessage::HelloAck { version: PROTOCOL_VERSION }))
        .await
        .unwrap();
    let stranger = PlayerId::random();
    let guest = PlayerId::random();
    for (seq, player_id, reason) in [
        (2, stranger, UpdateReason::Changed),
        (3, guest, UpdateReason::Snapshot),
    ] {
        conn.send(&encode(
            seq,
            SyncMessage::StateUpdate {
                player_id,
                state: AuthState::Pending,
                reason,
            },
        ))
        .await
        .unwrap();
    }

    assert!(eventually(|| backend.machine().registry().contains(guest)).await);
    assert!(!backend.machine().registry().contains(stranger));
    backend.shutdown();
}

// =========================================================================
// Hub handshake
// =========================================================================

/// A hub plus one raw connection to it. The connector is returned so the
/// listener stays open for the length of the test.
async fn raw_backend() -> (Arc<SyncHub>, MemoryConnection, MemoryConnector) {
    let hub = Arc::new(SyncHub::new(machine(), HubConfig::default()));
    let (transport, connector) = memory::listener();
    let serving = hub.clone();
    tokio::spawn(async move { serving.serve(transport).await });
    let conn = connector.connect().await.unwrap();
    (hub, conn, connector)
}

#[tokio::test]
async fn test_hub_rejects_version_mismatch() {
    let (hub, conn, _guard) = raw_backend().await;
    conn.send(&encode(
        1,
        SyncMessage::Hello {
            version: PROTOCOL_VERSION + 98,
            node: "lobby".into(),
        },
    ))
    .await
    .unwrap();

    let reply = next_envelope(&conn).await.unwrap();
    assert!(matches!(reply.payload, SyncMessage::Error { code: 400, .. }));
    assert!(next_envelope(&conn).await.is_none());
    assert!(!hub.is_node_connected("lobby"));
}

#[tokio::test]
async fn test_hub_requires_hello_first() {
    let (_hub, conn, _guard) = raw_backend().await;
    conn.send(&encode(1, SyncMessage::Heartbeat)).await.unwrap();

    let reply = next_envelope(&conn).await.unwrap();
    assert!(matches!(reply.payload, SyncMessage::Error { code: 400, .. }));
}

#[tokio::test]
async fn test_hub_answers_heartbeat_and_query_with_same_seq() {
    let (hub, conn, _guard) = raw_backend().await;
    conn.send(&encode(
        1,
        SyncMessage::Hello {
            version: PROTOCOL_VERSION,
            node: "survival".into(),
        },
    ))
    .await
    .unwrap();
    let ack = next_envelope(&conn).await.unwrap();
    assert_eq!(ack.seq, 1);
    assert_eq!(ack.payload, SyncMessage::HelloAck { version: PROTOCOL_VERSION });
    assert!(eventually(|| hub.nodes() == vec!["survival".to_string()]).await);

    conn.send(&encode(7, SyncMessage::Heartbeat)).await.unwrap();
    let beat = next_envelope(&conn).await.unwrap();
    assert_eq!(beat.seq, 7);
    assert_eq!(beat.payload, SyncMessage::HeartbeatAck);

    let player = PlayerId::random();
    conn.send(&encode(8, SyncMessage::Query { player_id: player }))
        .await
        .unwrap();
    let reply = next_envelope(&conn).await.unwrap();
    assert_eq!(reply.seq, 8);
    assert_eq!(
        reply.payload,
        SyncMessage::QueryReply {
            player_id: player,
            state: None,
        }
    );

    conn.close().await.unwrap();
    assert!(eventually(|| !hub.is_node_connected("survival")).await);
}

#[tokio::test]
async fn test_hub_malformed_message_gets_error_and_link_survives() {
    let (hub, conn, _guard) = raw_backend().await;
    conn.send(&encode(
        1,
        SyncMessage::Hello {
            version: PROTOCOL_VERSION,
            node: "lobby".into(),
        },
    ))
    .await
    .unwrap();
    next_envelope(&conn).await.unwrap();

    conn.send(b"{ not json").await.unwrap();
    let reply = next_envelope(&conn).await.unwrap();
    assert!(matches!(reply.payload, SyncMessage::Error { code: 400, .. }));
    assert!(hub.is_node_connected("lobby"));
}

#[tokio::test]
async fn test_serve_returns_when_listener_closes() {
    let hub = SyncHub::new(machine(), HubConfig::default());
    let (transport, connector): (MemoryTransport, MemoryConnector) = memory::listener();
    drop(connector);
    assert!(hub.serve(transport).await.is_ok());
}
