use std::future::Future;
use std::sync::Arc;

use authgate_protocol::{AuthState, PlayerId};

/// Anything that can tell a gate what state a player is in.
///
/// A standalone server or proxy answers from its own
/// [`AuthService`](crate::AuthService). A backend behind a proxy answers
/// through the sync client, which may have to ask the proxy first. The
/// gate doesn't need to know which.
///
/// Implementations must fail closed: when unsure, answer something other
/// than `Verified`.
pub trait StateSource: Send + Sync + 'static {
    fn query_state(&self, player_id: PlayerId) -> impl Future<Output = AuthState> + Send;
}

impl<T: StateSource> StateSource for Arc<T> {
    fn query_state(&self, player_id: PlayerId) -> impl Future<Output = AuthState> + Send {
        T::query_state(self, player_id)
    }
}
