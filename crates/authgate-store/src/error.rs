//! Error types for the credential store.

/// Errors that can occur while opening a store or reading and writing
/// credentials.
///
/// Once a store is open, every variant means the same thing to the auth
/// layer: the store could not give a trustworthy answer, so the player
/// must be treated as if no credential exists.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend refused the operation (connection lost, table missing,
    /// store marked offline).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The configured table prefix contains characters other than ASCII
    /// letters, digits and `_`. Only raised when opening a store.
    #[error("invalid table prefix {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidTablePrefix(String),

    /// The SQL backend returned an error.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Reading or writing the credentials file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The credentials file exists but isn't valid JSON.
    #[error("corrupt credentials file: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The blocking worker pool was shut down or a worker panicked.
    #[error("storage worker stopped")]
    WorkerStopped,
}
