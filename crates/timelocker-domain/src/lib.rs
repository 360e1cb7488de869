pub mod error;
pub mod ids;
pub mod status;
pub mod types;


pub use error::DomainError;
pub use ids::{validate_snapshot_id, RepositoryId};
pub use status::{
    BackupResult, OperationOutcome, OperationState, OperationStatus, OperationType,
    RestoreResult, SecurityEvent, SecurityLevel,
};
pub use types::{
    uri_scheme, BackendCredentials, BackendKind, BackupTargetDescriptor, ConflictResolution,
    FileSelection, ProgressCallback, RepositoryDescriptor, RepositoryHealth, RestoreOptions,
    RetentionPolicy, Snapshot, SnapshotDiff, SnapshotFilter,
};
