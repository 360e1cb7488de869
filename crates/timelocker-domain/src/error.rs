use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid repository name '{0}': must be non-empty and contain no path separators")]
    InvalidRepositoryName(String),

    #[error("invalid backup target name '{0}': must be non-empty and contain no path separators")]
    InvalidTargetName(String),

    #[error("invalid snapshot id '{0}': expected 4-64 lowercase hex characters")]
    InvalidSnapshotId(String),

    #[error("invalid repository uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("file selection has no include roots")]
    EmptySelection,

    #[error("retention policy specifies no retention periods")]
    EmptyRetentionPolicy,
}
