use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The vault is locked and the operation requires an unlocked vault.
    /// Storing and retrieving secrets never auto-unlocks; the caller must
    /// call `ensure_unlocked` first.
    #[error("credential store is locked")]
    Locked,

    #[error("credential store locked out after repeated failures; retry in {remaining_seconds} seconds")]
    LockedOut { remaining_seconds: u64 },

    #[error("failed to unlock credential store: {0}")]
    UnlockFailed(String),

    #[error("credential integrity violation: {0}")]
    Security(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential id and secret must be non-empty")]
    EmptyInput,

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("credential store error: {0}")]
    Manager(String),

    #[error("vault lock conflict: already locked by pid {pid} on {hostname}")]
    LockConflict { pid: u32, hostname: String },
}
