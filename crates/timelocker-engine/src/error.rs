use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository is not initialized")]
    NotInitialized,

    #[error("repository not found")]
    NotFound,

    #[error("wrong repository password")]
    BadPassword,

    #[error("repository is locked by another process")]
    RepositoryLocked,

    #[error("engine binary '{0}' not found on PATH")]
    BinaryNotFound(String),

    #[error("engine version {found} is below the required minimum {minimum}")]
    VersionBelowMinimum { found: String, minimum: String },

    #[error("could not parse engine version from output: {0}")]
    VersionUnparsable(String),

    #[error("engine command timed out after {0} seconds")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("engine exited with code {code}: {stderr}")]
    Engine { code: i32, stderr: String },

    #[error("io error running engine: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid engine output: {0}")]
    InvalidOutput(String),
}

impl EngineError {
    /// Whether an orchestrator retry loop may swallow this error. Lock
    /// contention, timeouts, and plain I/O hiccups clear on their own;
    /// everything else needs operator attention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RepositoryLocked | EngineError::Timeout(_) | EngineError::Io(_)
        )
    }

    /// Classify a non-zero exit by substring-matching the engine's stderr.
    pub fn classify_exit(code: i32, stderr: &str) -> Self {
        let text = stderr.to_lowercase();
        if text.contains("repository does not exist") {
            EngineError::NotInitialized
        } else if text.contains("unable to open config file") {
            EngineError::NotFound
        } else if text.contains("wrong password") {
            EngineError::BadPassword
        } else if text.contains("repository is locked") || text.contains("unable to create lock") {
            EngineError::RepositoryLocked
        } else {
            EngineError::Engine { code, stderr: stderr.trim().to_string() }
        }
    }
}
