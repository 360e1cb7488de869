use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("unsupported repository scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid repository uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("'{uri}' looks like a bare filesystem path; local repositories need an explicit scheme, e.g. file://{uri}")]
    BarePath { uri: String },

    #[error("no password available for repository '{0}': provide one explicitly, store it in the vault, or set TIMELOCKER_PASSWORD")]
    MissingPassword(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot id prefix '{0}' matches more than one snapshot")]
    AmbiguousSnapshotId(String),

    #[error("snapshot {0} is currently mounted; unmount it first")]
    SnapshotMounted(String),

    #[error("snapshot {0} is already mounted")]
    AlreadyMounted(String),

    #[error("snapshot {0} is not mounted")]
    NotMounted(String),

    #[error("could not parse engine output: {0}")]
    Parse(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] timelocker_engine::EngineError),

    #[error(transparent)]
    Vault(#[from] timelocker_vault::VaultError),

    #[error(transparent)]
    Domain(#[from] timelocker_domain::DomainError),
}
