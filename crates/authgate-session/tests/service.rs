//! End-to-end tests for `AuthService` over an in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use authgate_protocol::{AuthState, PlayerId};
use authgate_session::{
    AuthMachine, AuthRegistry, AuthService, SessionConfig, SessionError, StateSource,
    StateTransitionEvent, TransitionListener, VerifyOutcome,
};
use authgate_store::{CredentialStore, MemoryStore, StorageWorker, StoreError};
use authgate_totp::{MemoryReplayCache, Totp, TotpConfig, unix_now};

// -- Helpers --------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    service: AuthService,
    events: Arc<EventLog>,
}

#[derive(Default)]
struct EventLog {
    veto: AtomicBool,
    seen: Mutex<Vec<StateTransitionEvent>>,
}

impl TransitionListener for EventLog {
    fn on_transition(&self, event: &mut StateTransitionEvent) {
        if self.veto.load(Ordering::SeqCst) {
            event.cancel();
        }
        self.seen.lock().unwrap().push(event.clone());
    }
}

fn harness_with(config: SessionConfig, replay: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let machine = Arc::new(AuthMachine::new(Arc::new(AuthRegistry::new())));
    let events = Arc::new(EventLog::default());
    machine.add_listener(events.clone());

    let totp = Totp::new(TotpConfig::default()).unwrap();
    let mut service = AuthService::new(
        machine,
        StorageWorker::new(store.clone(), 2),
        totp.clone(),
        config,
    );
    if replay {
        service = service.with_replay_cache(Arc::new(MemoryReplayCache::for_config(totp.config())));
    }
    Harness {
        store,
        service,
        events,
    }
}

fn harness() -> Harness {
    harness_with(SessionConfig::default(), true)
}

impl Harness {
    fn secret(&self, player: PlayerId) -> String {
        self.store.get_secret(player).unwrap().expect("enrolled")
    }

    fn code(&self, player: PlayerId, unix: u64) -> String {
        self.service.totp().generate(&self.secret(player), unix).unwrap()
    }

    fn event_count(&self) -> usize {
        self.events.seen.lock().unwrap().len()
    }
}

/// A memory store whose `get_secret` blocks while the gate is closed, to
/// hold an operation in the middle of its store round trip.
struct GatedStore {
    inner: MemoryStore,
    closed: Mutex<bool>,
    opened: Condvar,
    parked: AtomicUsize,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            closed: Mutex::new(false),
            opened: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.opened.notify_all();
    }

    async fn wait_parked(&self, count: usize) {
        for _ in 0..500 {
            if self.parked.load(Ordering::SeqCst) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no store call parked");
    }
}

impl CredentialStore for GatedStore {
    fn get_secret(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            self.parked.fetch_add(1, Ordering::SeqCst);
        }
        while *closed {
            closed = self.opened.wait(closed).unwrap();
        }
        drop(closed);
        self.inner.get_secret(player_id)
    }

    fn set_secret(&self, player_id: PlayerId, secret: &str) -> Result<String, StoreError> {
        self.inner.set_secret(player_id, secret)
    }

    fn get_address(&self, player_id: PlayerId) -> Result<Option<String>, StoreError> {
        self.inner.get_address(player_id)
    }

    fn set_address(&self, player_id: PlayerId, address: &str) -> Result<String, StoreError> {
        self.inner.set_address(player_id, address)
    }
}

fn gated_service() -> (Arc<GatedStore>, Arc<AuthService>) {
    let store = Arc::new(GatedStore::new());
    let machine = Arc::new(AuthMachine::new(Arc::new(AuthRegistry::new())));
    let service = AuthService::new(
        machine,
        StorageWorker::new(store.clone(), 4),
        Totp::new(TotpConfig::default()).unwrap(),
        SessionConfig::default(),
    );
    (store, Arc::new(service))
}

// =========================================================================
// on_connect()
// =========================================================================

#[tokio::test]
async fn test_on_connect_without_credential_is_unregistered() {
    let h = harness();
    let player = PlayerId::random();

    let state = h.service.on_connect(player, None).await;

    assert_eq!(state, AuthState::Unregistered);
    assert_eq!(h.service.get_state(player), AuthState::Unregistered);
}

#[tokio::test]
async fn test_on_connect_with_secret_is_pending() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, &Totp::generate_secret()).unwrap();

    assert_eq!(h.service.on_connect(player, None).await, AuthState::Pending);
}

#[tokio::test]
async fn test_on_connect_storage_down_fails_closed() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, &Totp::generate_secret()).unwrap();
    h.store.set_available(false);

    assert_eq!(h.service.on_connect(player, None).await, AuthState::Unregistered);
}

#[tokio::test]
async fn test_on_connect_remembered_address_is_verified() {
    let h = harness_with(SessionConfig { remember_address: true }, true);
    let player = PlayerId::random();
    h.store.set_secret(player, &Totp::generate_secret()).unwrap();
    h.store.set_address(player, "10.0.0.5").unwrap();

    assert_eq!(
        h.service.on_connect(player, Some("10.0.0.5".into())).await,
        AuthState::Verified
    );
    h.service.on_disconnect(player);
    assert_eq!(
        h.service.on_connect(player, Some("10.0.0.6".into())).await,
        AuthState::Pending
    );
}

#[tokio::test]
async fn test_on_connect_address_ignored_when_not_remembering() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, &Totp::generate_secret()).unwrap();
    h.store.set_address(player, "10.0.0.5").unwrap();

    assert_eq!(
        h.service.on_connect(player, Some("10.0.0.5".into())).await,
        AuthState::Pending
    );
}

#[tokio::test]
async fn test_on_disconnect_then_get_state_is_unregistered() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, &Totp::generate_secret()).unwrap();
    h.service.on_connect(player, None).await;

    h.service.on_disconnect(player);

    assert_eq!(h.service.get_state(player), AuthState::Unregistered);
    assert_eq!(h.service.query_state(player).await, AuthState::Unregistered);
}

// =========================================================================
// enroll()
// =========================================================================

#[tokio::test]
async fn test_enroll_moves_to_pending_and_stores_secret() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;

    let enrollment = h.service.enroll(player).await.unwrap();

    assert_eq!(h.service.get_state(player), AuthState::Pending);
    assert_eq!(h.secret(player), enrollment.secret);
    assert!(enrollment.uri.starts_with("otpauth://totp/"));
    assert!(enrollment.uri.contains(&enrollment.secret));
}

#[tokio::test]
async fn test_enroll_twice_already_enrolled_and_state_unchanged() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    let first = h.service.enroll(player).await.unwrap();

    let result = h.service.enroll(player).await;

    assert!(matches!(result, Err(SessionError::AlreadyEnrolled(p)) if p == player));
    assert_eq!(h.service.get_state(player), AuthState::Pending);
    assert_eq!(h.secret(player), first.secret);
}

#[tokio::test]
async fn test_enroll_vetoed_rolls_back_secret() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.events.veto.store(true, Ordering::SeqCst);

    let result = h.service.enroll(player).await;

    assert!(matches!(result, Err(SessionError::TransitionVetoed { .. })));
    assert_eq!(h.service.get_state(player), AuthState::Unregistered);
    assert_eq!(h.store.get_secret(player).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enroll_concurrent_calls_second_already_enrolled() {
    let (store, service) = gated_service();
    let player = PlayerId::random();
    service.on_connect(player, None).await;
    store.close();

    let first = tokio::spawn({
        let service = service.clone();
        async move { service.enroll(player).await }
    });
    let second = tokio::spawn({
        let service = service.clone();
        async move { service.enroll(player).await }
    });
    store.wait_parked(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.open();

    let results = [first.await.unwrap(), second.await.unwrap()];
    let enrolled: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(enrolled.len(), 1, "{results:?}");
    assert!(results.iter().any(|r| matches!(r, Err(SessionError::AlreadyEnrolled(p)) if *p == player)));
    assert_eq!(store.inner.get_secret(player).unwrap().as_ref(), Some(&enrolled[0].secret));
    assert_eq!(service.get_state(player), AuthState::Pending);
}

#[tokio::test]
async fn test_enroll_not_connected_fails() {
    let h = harness();
    let player = PlayerId::random();
    assert!(matches!(
        h.service.enroll(player).await,
        Err(SessionError::NotConnected(_))
    ));
    assert_eq!(h.store.get_secret(player).unwrap(), None);
}

#[tokio::test]
async fn test_enroll_storage_down_reports_unavailable() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.store.set_available(false);

    assert!(matches!(
        h.service.enroll(player).await,
        Err(SessionError::StorageUnavailable(_))
    ));
    assert_eq!(h.service.get_state(player), AuthState::Unregistered);
}

// =========================================================================
// verify()
// =========================================================================

#[tokio::test]
async fn test_verify_unregistered_always_rejected() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;

    let outcome = h.service.verify(player, "123456").await.unwrap();

    assert_eq!(outcome, VerifyOutcome::Rejected { consecutive_failures: 1 });
    assert_eq!(h.event_count(), 0);
}

#[tokio::test]
async fn test_verify_unknown_player_rejected() {
    let h = harness();
    let outcome = h.service.verify(PlayerId::random(), "123456").await.unwrap();
    assert!(!outcome.is_accepted());
}

#[tokio::test]
async fn test_verify_current_code_verifies_exactly_once() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    let events_before = h.event_count();

    assert_eq!(h.service.verify_at(player, &code, now).await.unwrap(), VerifyOutcome::Accepted);
    assert_eq!(h.service.get_state(player), AuthState::Verified);
    assert_eq!(h.event_count(), events_before + 1);

    // Already verified: accepted again but no second transition.
    assert_eq!(h.service.verify_at(player, &code, now).await.unwrap(), VerifyOutcome::Accepted);
    assert_eq!(h.event_count(), events_before + 1);
}

#[tokio::test]
async fn test_verify_replayed_code_rejected_after_reconnect() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    h.service.verify_at(player, &code, now).await.unwrap();

    // New connection, same window, same code.
    h.service.on_disconnect(player);
    assert_eq!(h.service.on_connect(player, None).await, AuthState::Pending);
    let outcome = h.service.verify_at(player, &code, now).await.unwrap();

    assert_eq!(outcome, VerifyOutcome::Rejected { consecutive_failures: 1 });
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

#[tokio::test]
async fn test_verify_without_replay_cache_accepts_reuse() {
    let h = harness_with(SessionConfig::default(), false);
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    h.service.verify_at(player, &code, now).await.unwrap();

    h.service.on_disconnect(player);
    h.service.on_connect(player, None).await;

    assert!(h.service.verify_at(player, &code, now).await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_verify_code_two_windows_away_rejected() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = 1_800_000_000;
    let stale = h.code(player, now - 60);
    let near: Vec<String> = [now - 30, now, now + 30].iter().map(|t| h.code(player, *t)).collect();
    if near.contains(&stale) {
        return;
    }

    let outcome = h.service.verify_at(player, &stale, now).await.unwrap();

    assert!(!outcome.is_accepted());
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

#[tokio::test]
async fn test_verify_failures_count_up_and_reset_on_success() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let good = h.code(player, now);
    let bad = if good == "000000" { "111111" } else { "000000" };

    assert_eq!(
        h.service.verify_at(player, bad, now).await.unwrap(),
        VerifyOutcome::Rejected { consecutive_failures: 1 }
    );
    assert_eq!(
        h.service.verify_at(player, bad, now).await.unwrap(),
        VerifyOutcome::Rejected { consecutive_failures: 2 }
    );
    assert_eq!(h.service.failures(player), 2);

    assert!(h.service.verify_at(player, &good, now).await.unwrap().is_accepted());
    assert_eq!(h.service.failures(player), 0);
}

#[tokio::test]
async fn test_verify_saves_connection_address() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, Some("172.16.0.9".into())).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);

    h.service.verify_at(player, &code, now).await.unwrap();

    assert_eq!(h.store.get_address(player).unwrap().as_deref(), Some("172.16.0.9"));
}

#[tokio::test]
async fn test_verify_storage_down_is_error_and_not_verified() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    h.store.set_available(false);

    let result = h.service.verify_at(player, &code, now).await;

    assert!(matches!(result, Err(SessionError::StorageUnavailable(_))));
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_verify_racing_reset_never_verifies_without_secret() {
    let (store, service) = gated_service();
    let player = PlayerId::random();
    service.on_connect(player, None).await;
    let enrollment = service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = service.totp().generate(&enrollment.secret, now).unwrap();
    store.close();

    let verifying = tokio::spawn({
        let service = service.clone();
        async move { service.verify_at(player, &code, now).await }
    });
    store.wait_parked(1).await;
    let resetting = tokio::spawn({
        let service = service.clone();
        async move { service.reset(player).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.open();

    verifying.await.unwrap().unwrap();
    resetting.await.unwrap().unwrap();
    assert_eq!(store.inner.get_secret(player).unwrap(), None);
    assert_eq!(service.get_state(player), AuthState::Unregistered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_verify_state_moved_during_lookup_not_committed() {
    let (store, service) = gated_service();
    let player = PlayerId::random();
    service.on_connect(player, None).await;
    let enrollment = service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = service.totp().generate(&enrollment.secret, now).unwrap();
    store.close();

    let verifying = tokio::spawn({
        let service = service.clone();
        async move { service.verify_at(player, &code, now).await }
    });
    store.wait_parked(1).await;
    // A raw write that doesn't wait for the operation in flight.
    service.machine().change_state(player, AuthState::Unregistered).unwrap();
    store.open();

    let outcome = verifying.await.unwrap().unwrap();
    assert_eq!(outcome, VerifyOutcome::Rejected { consecutive_failures: 0 });
    assert_eq!(service.get_state(player), AuthState::Unregistered);
}

#[tokio::test]
async fn test_verify_vetoed_stays_pending() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    h.events.veto.store(true, Ordering::SeqCst);

    let result = h.service.verify_at(player, &code, now).await;

    assert!(matches!(result, Err(SessionError::TransitionVetoed { .. })));
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

// =========================================================================
// reset()
// =========================================================================

#[tokio::test]
async fn test_reset_twice_is_idempotent() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();

    h.service.reset(player).await.unwrap();
    h.service.reset(player).await.unwrap();

    assert_eq!(h.service.get_state(player), AuthState::Unregistered);
    assert_eq!(h.store.get_secret(player).unwrap(), None);
}

#[tokio::test]
async fn test_reset_from_verified_then_enroll_again() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;
    h.service.enroll(player).await.unwrap();
    let now = unix_now();
    let code = h.code(player, now);
    h.service.verify_at(player, &code, now).await.unwrap();

    h.service.reset(player).await.unwrap();
    assert_eq!(h.service.get_state(player), AuthState::Unregistered);

    let again = h.service.enroll(player).await.unwrap();
    assert_eq!(h.service.get_state(player), AuthState::Pending);
    assert_eq!(h.secret(player), again.secret);
}

#[tokio::test]
async fn test_reset_offline_player_clears_secret() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, "JBSWY3DPEHPK3PXP").unwrap();

    h.service.reset(player).await.unwrap();

    assert_eq!(h.store.get_secret(player).unwrap(), None);
}

// =========================================================================
// change_state()
// =========================================================================

#[tokio::test]
async fn test_change_state_verified_without_secret_not_enrolled() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, "JBSWY3DPEHPK3PXP").unwrap();
    h.service.on_connect(player, None).await;
    h.store.remove_secret(player).unwrap();

    let result = h.service.change_state(player, AuthState::Verified).await;

    assert!(matches!(result, Err(SessionError::NotEnrolled(_))));
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

#[tokio::test]
async fn test_change_state_unregistered_to_verified_illegal() {
    let h = harness();
    let player = PlayerId::random();
    h.service.on_connect(player, None).await;

    let result = h.service.change_state(player, AuthState::Verified).await;

    assert!(matches!(result, Err(SessionError::IllegalTransition { .. })));
}

#[tokio::test]
async fn test_change_state_verified_to_pending_allowed() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, "JBSWY3DPEHPK3PXP").unwrap();
    h.service.on_connect(player, None).await;
    h.service.change_state(player, AuthState::Verified).await.unwrap();

    let old = h.service.change_state(player, AuthState::Pending).await.unwrap();

    assert_eq!(old, AuthState::Verified);
    assert_eq!(h.service.get_state(player), AuthState::Pending);
}

// =========================================================================
// snapshot() / restore()
// =========================================================================

#[tokio::test]
async fn test_restore_keeps_live_states_without_events() {
    let h = harness();
    let a = PlayerId::random();
    let b = PlayerId::random();
    for p in [a, b] {
        h.store.set_secret(p, "JBSWY3DPEHPK3PXP").unwrap();
        h.service.on_connect(p, None).await;
    }
    h.service.change_state(a, AuthState::Verified).await.unwrap();
    let snapshot = h.service.snapshot();
    h.events.seen.lock().unwrap().clear();

    let kept = h.service.restore(&snapshot).await;

    assert_eq!(kept, 2);
    assert_eq!(h.service.get_state(a), AuthState::Verified);
    assert_eq!(h.service.get_state(b), AuthState::Pending);
    assert_eq!(h.event_count(), 0);
}

#[tokio::test]
async fn test_restore_follows_credentials_the_store_no_longer_has() {
    let h = harness();
    let gone = PlayerId::random();
    let added = PlayerId::random();
    h.store.set_secret(gone, "JBSWY3DPEHPK3PXP").unwrap();
    h.service.on_connect(gone, None).await;
    h.service.change_state(gone, AuthState::Verified).await.unwrap();
    h.service.on_connect(added, None).await;
    let snapshot = h.service.snapshot();

    h.store.remove_secret(gone).unwrap();
    h.store.set_secret(added, "JBSWY3DPEHPK3PXP").unwrap();
    let kept = h.service.restore(&snapshot).await;

    assert_eq!(kept, 0);
    assert_eq!(h.service.get_state(gone), AuthState::Unregistered);
    assert_eq!(h.service.get_state(added), AuthState::Pending);
    assert!(h.events.seen.lock().unwrap().iter().all(|e| !e.is_cancelled()));
}

#[tokio::test]
async fn test_restore_storage_down_keeps_state() {
    let h = harness();
    let player = PlayerId::random();
    h.store.set_secret(player, "JBSWY3DPEHPK3PXP").unwrap();
    h.service.on_connect(player, None).await;
    h.service.change_state(player, AuthState::Verified).await.unwrap();
    let snapshot = h.service.snapshot();
    h.store.set_available(false);

    assert_eq!(h.service.restore(&snapshot).await, 1);
    assert_eq!(h.service.get_state(player), AuthState::Verified);
}
