use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("backup target not found: {0}")]
    TargetNotFound(String),

    #[error("backup target already exists: {0}")]
    TargetExists(String),

    #[error("repository '{repository}' is still referenced by target '{target}'")]
    RepositoryInUse { repository: String, target: String },

    #[error("domain error: {0}")]
    Domain(#[from] timelocker_domain::DomainError),
}
