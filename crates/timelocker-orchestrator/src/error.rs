use std::path::PathBuf;

use thiserror::Error;

/// Internal error currency of both orchestrators. Public entry points fold
/// these into failure-shaped results; only programmer errors escape as
/// panics.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid backup configuration: {0}")]
    InvalidConfiguration(String),

    #[error("restore target path is not set")]
    NoTargetPath,

    #[error("restore target {0} exists and is not a directory")]
    TargetNotDirectory(PathBuf),

    #[error("insufficient space: restore needs {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("permission denied on {0}")]
    RestorePermission(PathBuf),

    #[error("post-backup verification failed: {0}")]
    VerificationFailed(String),

    #[error("hook script {script} failed: {detail}")]
    HookFailed { script: String, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] timelocker_config::ConfigError),

    #[error(transparent)]
    Repo(#[from] timelocker_repo::RepoError),

    #[error(transparent)]
    Engine(#[from] timelocker_engine::EngineError),

    #[error(transparent)]
    Security(#[from] timelocker_security::SecurityError),
}

impl OrchestratorError {
    /// Whether the retry loop may swallow this failure. Engine lock
    /// contention and I/O hiccups are retryable; configuration problems,
    /// bad passwords, and unsupported schemes are fatal immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Engine(e) => e.is_transient(),
            OrchestratorError::Repo(timelocker_repo::RepoError::Engine(e)) => e.is_transient(),
            OrchestratorError::Repo(timelocker_repo::RepoError::Io { .. }) => true,
            OrchestratorError::VerificationFailed(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelocker_engine::EngineError;
    use timelocker_repo::RepoError;

    #[test]
    fn transient_classification() {
        assert!(OrchestratorError::Engine(EngineError::RepositoryLocked).is_transient());
        assert!(OrchestratorError::Repo(RepoError::Engine(EngineError::RepositoryLocked))
            .is_transient());
        assert!(!OrchestratorError::Engine(EngineError::BadPassword).is_transient());
        assert!(!OrchestratorError::Repo(RepoError::UnsupportedScheme("ftp".into()))
            .is_transient());
        assert!(!OrchestratorError::InvalidConfiguration("x".into()).is_transient());
        assert!(!OrchestratorError::Cancelled.is_transient());
    }
}
