//! Replay protection for accepted codes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use authgate_protocol::PlayerId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::TotpConfig;

/// Remembers which (player, step) pairs have already been spent.
///
/// A TOTP code is reusable for as long as its window is accepted. The
/// verifier passes every step it matches through
/// [`check_and_insert`](Self::check_and_insert) and rejects the code if
/// that returns `false`.
pub trait ReplayCache: Send + Sync + 'static {
    /// Records `(player_id, step)` and returns `true` if it was not seen
    /// before. Must be atomic: two concurrent calls with the same pair
    /// can't both return `true`.
    fn check_and_insert(&self, player_id: PlayerId, step: u64) -> bool;

    /// Drops everything remembered for one player.
    fn forget(&self, player_id: PlayerId);
}

/// TTL-bounded in-memory [`ReplayCache`].
///
/// Entries expire after `ttl`, which should cover every window a code
/// can be accepted in (`step × 3`). Expired entries are ignored on
/// lookup and swept every 256 inserts.
pub struct MemoryReplayCache {
    seen: DashMap<(PlayerId, u64), Instant>,
    ttl: Duration,
    inserts: AtomicU64,
}

impl MemoryReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            inserts: AtomicU64::new(0),
        }
    }

    /// TTL covering every window `config` accepts a code in.
    pub fn for_config(config: &TotpConfig) -> Self {
        let windows = 2 * config.skew_steps.min(1) + 1;
        Self::new(Duration::from_secs(config.step_secs * windows))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < self.ttl);
    }
}

impl ReplayCache for MemoryReplayCache {
    fn check_and_insert(&self, player_id: PlayerId, step: u64) -> bool {
        let now = Instant::now();
        let fresh = match self.seen.entry((player_id, step)) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.ttl {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        };

        if fresh && self.inserts.fetch_add(1, Ordering::Relaxed) % 256 == 255 {
            self.cleanup_expired();
        }
        if !fresh {
            tracing::debug!(%player_id, step, "replayed code rejected");
        }
        fresh
    }

    fn forget(&self, player_id: PlayerId) {
        self.seen.retain(|(id, _), _| *id != player_id);
    }
}
