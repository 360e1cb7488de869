use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("repository '{0}' is not encrypted and strict mode refuses to back up into it")]
    UnencryptedRepository(String),

    #[error("repository integrity check failed before restore: {0}")]
    IntegrityGateFailed(String),

    #[error("emergency lockdown is active: {0}")]
    LockdownActive(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("audit record error: {0}")]
    Serialization(#[from] serde_json::Error),
}
