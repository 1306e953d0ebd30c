//! Time-based one-time codes (RFC 6238) for Authgate.
//!
//! [`Totp`] answers one question: does this code match this secret at
//! this time? It evaluates exactly three windows (previous, current,
//! next) and compares in constant time. It does **not** remember codes
//! it has accepted; a TOTP code stays valid for its whole window, so
//! callers that care about replays pass the matched step to a
//! [`ReplayCache`].
//!
//! ```rust
//! use authgate_totp::{MemoryReplayCache, ReplayCache, Totp, TotpConfig};
//! use authgate_protocol::PlayerId;
//!
//! let totp = Totp::new(TotpConfig::default()).unwrap();
//! let secret = Totp::generate_secret();
//! let now = 1_700_000_000;
//!
//! let code = totp.generate(&secret, now).unwrap();
//! let step = totp.verify(&secret, &code, now).unwrap().expect("valid code");
//!
//! let cache = MemoryReplayCache::for_config(totp.config());
//! let player = PlayerId::random();
//! assert!(cache.check_and_insert(player, step));
//! assert!(!cache.check_and_insert(player, step)); // replay
//! ```

mod code;
mod config;
mod engine;
mod error;
mod replay;

pub use code::normalize_code;
pub use config::TotpConfig;
pub use engine::{Totp, unix_now};
pub use error::TotpError;
pub use replay::{MemoryReplayCache, ReplayCache};
