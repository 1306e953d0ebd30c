//! Player-facing auth operations: connect, enroll, verify, reset.
//!
//! [`AuthService`] sits on top of the [`AuthMachine`] and adds the rules
//! the machine deliberately doesn't know:
//!
//! - which edges are legal ([`AuthState::can_transition_to`]);
//! - `Verified` requires a secret on file;
//! - storage failures fail closed (never toward `Verified`);
//! - codes are checked by the TOTP engine and, optionally, a replay cache.
//!
//! Every store access goes through the [`StorageWorker`], so the calling
//! task only awaits; it never blocks a thread on I/O. While a lookup is
//! in flight the player stays in whatever state they were in before.
//!
//! Operations on the same player run one at a time: each holds the
//! player's operation lock from its first store read until it commits,
//! and commits with a compare-and-set against the state it started from.

use std::sync::Arc;

use authgate_protocol::{AuthState, PlayerId};
use authgate_store::StorageWorker;
use authgate_totp::{ReplayCache, Totp, TotpError, unix_now};
use serde::{Deserialize, Serialize};

use crate::registry::PlayerEntry;
use crate::{AuthMachine, SessionError, SessionSnapshot, StateSource};

// ---------------------------------------------------------------------------
// Config and results
// ---------------------------------------------------------------------------

/// Session behaviour knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Start a returning player as `Verified` when they connect from the
    /// same address they last verified from.
    ///
    /// Default: `false`.
    pub remember_address: bool,
}

/// What `enroll` hands back to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    /// Base32 secret to type into an authenticator app.
    pub secret: String,

    /// `otpauth://` URI for QR rendering.
    pub uri: String,
}

/// Result of a code submission. A wrong code is a normal outcome, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The player is now (or already was) `Verified`.
    Accepted,

    /// The code was wrong, replayed, or the player has nothing to verify
    /// against. The count lets the gate kick after N misses.
    Rejected { consecutive_failures: u32 },
}

impl VerifyOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Enrollment and verification on top of an [`AuthMachine`].
pub struct AuthService {
    machine: Arc<AuthMachine>,
    storage: StorageWorker,
    totp: Totp,
    replay: Option<Arc<dyn ReplayCache>>,
    config: SessionConfig,
}

impl AuthService {
    pub fn new(
        machine: Arc<AuthMachine>,
        storage: StorageWorker,
        totp: Totp,
        config: SessionConfig,
    ) -> Self {
        Self {
            machine,
            storage,
            totp,
            replay: None,
            config,
        }
    }

    /// Rejects any (player, step) the cache has already seen.
    pub fn with_replay_cache(mut self, cache: Arc<dyn ReplayCache>) -> Self {
        self.replay = Some(cache);
        self
    }

    pub fn machine(&self) -> &Arc<AuthMachine> {
        &self.machine
    }

    pub fn storage(&self) -> &StorageWorker {
        &self.storage
    }

    pub fn totp(&self) -> &Totp {
        &self.totp
    }

    pub fn get_state(&self, player_id: PlayerId) -> AuthState {
        self.machine.get_state(player_id)
    }

    /// Consecutive wrong codes since the last success. 0 if not connected.
    pub fn failures(&self, player_id: PlayerId) -> u32 {
        self.machine
            .registry()
            .entry(player_id)
            .map_or(0, |entry| entry.failures())
    }

    // -- Connection lifecycle ---------------------------------------------

    /// Registers a new connection and sets its initial state from the
    /// credential store.
    ///
    /// The player is `Unregistered` until the lookup returns. With a
    /// secret on file they become `Pending`, or `Verified` straight away
    /// if `remember_address` is on and `address` matches the last
    /// verified one. A failed lookup leaves them `Unregistered`.
    ///
    /// If the player disconnects (or reconnects) while the lookup is in
    /// flight, the result is dropped.
    pub async fn on_connect(&self, player_id: PlayerId, address: Option<String>) -> AuthState {
        let entry = self.machine.registry().connect(player_id, address.clone());
        let _op = entry.exclusive().await;
        tracing::info!(%player_id, "player connected");

        let initial = match self.storage.credential(player_id).await {
            Ok(Some(credential)) if credential.has_secret() => {
                let remembered = self.config.remember_address
                    && address.is_some()
                    && credential.address == address;
                if remembered {
                    tracing::info!(%player_id, "known address, skipping verification");
                    AuthState::Verified
                } else {
                    AuthState::Pending
                }
            }
            Ok(_) => AuthState::Unregistered,
            Err(e) => {
                tracing::warn!(%player_id, error = %e, "credential lookup failed, treating as unregistered");
                AuthState::Unregistered
            }
        };

        if !self.machine.registry().is_current(player_id, &entry) {
            tracing::debug!(%player_id, "connection superseded during lookup");
            return self.get_state(player_id);
        }
        match self
            .machine
            .transition_from(player_id, &entry, AuthState::Unregistered, initial)
        {
            Ok(_) => initial,
            Err(e) => {
                tracing::warn!(%player_id, error = %e, "initial state rejected");
                entry.state()
            }
        }
    }

    /// Forgets the player. Their next connection starts from a fresh
    /// lookup.
    pub fn on_disconnect(&self, player_id: PlayerId) {
        if self.machine.registry().disconnect(player_id) {
            tracing::info!(%player_id, "player disconnected");
        }
    }

    // -- State changes ----------------------------------------------------

    /// Requests a legal transition.
    ///
    /// Asking for the current state is a no-op. `Verified` is only
    /// granted if the store confirms a secret.
    ///
    /// # Errors
    /// [`SessionError::IllegalTransition`], [`SessionError::NotEnrolled`],
    /// [`SessionError::StorageUnavailable`], or whatever
    /// [`AuthMachine::change_state`] returns.
    pub async fn change_state(
        &self,
        player_id: PlayerId,
        new_state: AuthState,
    ) -> Result<AuthState, SessionError> {
        let entry = self
            .machine
            .registry()
            .entry(player_id)
            .ok_or(SessionError::NotConnected(player_id))?;
        let _op = entry.exclusive().await;
        let current = entry.state();
        if current == new_state {
            return Ok(current);
        }
        if !current.can_transition_to(new_state) {
            return Err(SessionError::IllegalTransition {
                player_id,
                from: current,
                to: new_state,
            });
        }
        if new_state == AuthState::Verified && !self.storage.has_secret(player_id).await? {
            return Err(SessionError::NotEnrolled(player_id));
        }
        self.machine
            .transition_from(player_id, &entry, current, new_state)
    }

    /// Issues a new secret and moves the player to `Pending`.
    ///
    /// If the transition is vetoed the secret is cleared again, so a
    /// vetoed enrollment leaves nothing behind.
    ///
    /// # Errors
    /// - [`SessionError::NotConnected`] if the player isn't connected.
    /// - [`SessionError::AlreadyEnrolled`] if a secret already exists.
    /// - [`SessionError::StorageUnavailable`] if the store can't answer.
    /// - [`SessionError::TransitionVetoed`] if a listener cancels.
    pub async fn enroll(&self, player_id: PlayerId) -> Result<Enrollment, SessionError> {
        let entry = self
            .machine
            .registry()
            .entry(player_id)
            .ok_or(SessionError::NotConnected(player_id))?;
        let _op = entry.exclusive().await;
        let before = entry.state();
        if self.storage.get_secret(player_id).await?.is_some() {
            return Err(SessionError::AlreadyEnrolled(player_id));
        }

        let secret = Totp::generate_secret();
        let uri = self.totp.provisioning_uri(&secret, &player_id.to_string())?;
        let secret = self.storage.set_secret(player_id, secret).await?;

        if let Err(e) = self
            .machine
            .transition_from(player_id, &entry, before, AuthState::Pending)
        {
            if let Err(rollback) = self.storage.remove_secret(player_id).await {
                tracing::error!(%player_id, error = %rollback, "failed to roll back secret after rejected enrollment");
            }
            return Err(e);
        }

        tracing::info!(%player_id, "player enrolled");
        Ok(Enrollment { secret, uri })
    }

    /// Clears the player's secret and moves them to `Unregistered`.
    ///
    /// Works whether or not the player is connected, and calling it again
    /// is harmless.
    ///
    /// # Errors
    /// [`SessionError::StorageUnavailable`] if the secret couldn't be
    /// cleared (state is left alone), or
    /// [`SessionError::TransitionVetoed`].
    pub async fn reset(&self, player_id: PlayerId) -> Result<(), SessionError> {
        let entry = self.machine.registry().entry(player_id);
        let _op = match &entry {
            Some(entry) => Some(entry.exclusive().await),
            None => None,
        };
        self.storage.remove_secret(player_id).await?;
        if let Some(replay) = &self.replay {
            replay.forget(player_id);
        }
        if let Some(entry) = &entry {
            entry.reset_failures();
            self.machine.transition(player_id, entry, AuthState::Unregistered)?;
        }
        tracing::info!(%player_id, "2FA reset");
        Ok(())
    }

    // -- Verification -----------------------------------------------------

    /// Checks a submitted code at the current time.
    pub async fn verify(&self, player_id: PlayerId, code: &str) -> Result<VerifyOutcome, SessionError> {
        self.verify_at(player_id, code, unix_now()).await
    }

    /// Checks a submitted code as if the clock read `unix_secs`.
    ///
    /// - Not connected or `Unregistered`: rejected without touching the
    ///   TOTP engine.
    /// - Already `Verified`: accepted, no event.
    /// - Otherwise the code must match one of the three windows around
    ///   `unix_secs` and (if a replay cache is set) not have been used.
    /// - If the player stopped being `Pending` while the secret was
    ///   being checked, nothing is committed and the code is rejected
    ///   without counting as a failure.
    ///
    /// On success the failure counter resets and the connection address
    /// is saved for `remember_address`.
    ///
    /// # Errors
    /// [`SessionError::StorageUnavailable`] if the secret can't be read;
    /// [`SessionError::TransitionVetoed`] if a listener blocks the
    /// upgrade.
    pub async fn verify_at(
        &self,
        player_id: PlayerId,
        code: &str,
        unix_secs: u64,
    ) -> Result<VerifyOutcome, SessionError> {
        let Some(entry) = self.machine.registry().entry(player_id) else {
            return Ok(VerifyOutcome::Rejected {
                consecutive_failures: 0,
            });
        };
        let _op = entry.exclusive().await;

        match entry.state() {
            AuthState::Verified => return Ok(VerifyOutcome::Accepted),
            AuthState::Unregistered => return Ok(self.reject(player_id, &entry, "not enrolled")),
            AuthState::Pending => {}
        }

        let Some(secret) = self.storage.get_secret(player_id).await? else {
            return Ok(self.reject(player_id, &entry, "secret missing"));
        };

        let step = match self.totp.verify(&secret, code, unix_secs) {
            Ok(Some(step)) => step,
            Ok(None) => return Ok(self.reject(player_id, &entry, "wrong code")),
            Err(TotpError::InvalidSecret) => {
                tracing::warn!(%player_id, "stored secret is unusable");
                return Ok(self.reject(player_id, &entry, "unusable secret"));
            }
            Err(e) => {
                tracing::warn!(%player_id, error = %e, "code check failed");
                return Ok(self.reject(player_id, &entry, "code check failed"));
            }
        };

        if let Some(replay) = &self.replay {
            if !replay.check_and_insert(player_id, step) {
                return Ok(self.reject(player_id, &entry, "code already used"));
            }
        }

        match self
            .machine
            .transition_from(player_id, &entry, AuthState::Pending, AuthState::Verified)
        {
            Ok(_) => {}
            Err(SessionError::StateChanged {
                found: AuthState::Verified,
                ..
            }) => return Ok(VerifyOutcome::Accepted),
            Err(SessionError::StateChanged { found, .. }) => {
                tracing::info!(%player_id, state = %found, "state changed during verification, code not applied");
                return Ok(VerifyOutcome::Rejected {
                    consecutive_failures: entry.failures(),
                });
            }
            Err(e) => return Err(e),
        }
        entry.reset_failures();
        tracing::info!(%player_id, "player verified");

        if let Some(address) = entry.address() {
            if let Err(e) = self.storage.set_address(player_id, address).await {
                tracing::warn!(%player_id, error = %e, "could not save verified address");
            }
        }
        Ok(VerifyOutcome::Accepted)
    }

    fn reject(&self, player_id: PlayerId, entry: &PlayerEntry, reason: &str) -> VerifyOutcome {
        let consecutive_failures = entry.record_failure();
        tracing::info!(%player_id, reason, consecutive_failures, "code rejected");
        VerifyOutcome::Rejected {
            consecutive_failures,
        }
    }

    // -- Reload support ---------------------------------------------------

    /// Every connected player and their state, for [`restore`](Self::restore).
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.machine.registry().snapshot()
    }

    /// Re-checks the players captured by `snapshot` against this
    /// service's store after a reload.
    ///
    /// Live registry entries are kept; nobody is reconnected, so a player
    /// whose credential is still on file keeps their state without any
    /// transition event. Only what the new store contradicts changes:
    ///
    /// - `Pending` or `Verified` with no secret any more: `Unregistered`.
    /// - `Unregistered` with a secret on file: `Pending`.
    ///
    /// A player whose state moved since the snapshot keeps the newer
    /// state, and a store error leaves the player as they are. Returns
    /// how many players kept the state they were snapshotted in.
    pub async fn restore(&self, snapshot: &[SessionSnapshot]) -> usize {
        let mut kept = 0;
        for saved in snapshot {
            let player_id = saved.player_id;
            let Some(entry) = self.machine.registry().entry(player_id) else {
                continue;
            };
            let _op = entry.exclusive().await;
            let current = entry.state();
            if current != saved.state {
                tracing::debug!(%player_id, saved = %saved.state, %current, "state moved since snapshot");
                continue;
            }

            let has_secret = match self.storage.has_secret(player_id).await {
                Ok(has_secret) => has_secret,
                Err(e) => {
                    tracing::warn!(%player_id, error = %e, "credential check failed after reload, keeping state");
                    kept += 1;
                    continue;
                }
            };
            let target = match (current, has_secret) {
                (AuthState::Unregistered, true) => AuthState::Pending,
                (AuthState::Pending | AuthState::Verified, false) => AuthState::Unregistered,
                _ => {
                    kept += 1;
                    continue;
                }
            };

            tracing::warn!(%player_id, from = %current, to = %target, "credential changed across reload");
            if let Err(e) = self
                .machine
                .transition_from(player_id, &entry, current, target)
            {
                tracing::warn!(%player_id, error = %e, "could not apply reloaded credential state");
            }
        }
        tracing::info!(kept, total = snapshot.len(), "re-checked player states");
        kept
    }
}

impl StateSource for AuthService {
    async fn query_state(&self, player_id: PlayerId) -> AuthState {
        self.get_state(player_id)
    }
}
