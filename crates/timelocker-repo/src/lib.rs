pub mod backend;
pub mod error;
pub mod repository;
pub mod service;
pub mod snapshots;
pub mod uri;

pub use backend::{BackendProvider, BackendRegistry};
pub use error::RepoError;
pub use repository::{Repository, RepositoryFactory};
pub use service::{
    IntegrityReport, LocalInitState, RepositoryService, RepositoryStats, READ_DATA_TIMEOUT,
};
pub use snapshots::{
    ContentsEntry, MountEntry, SearchKind, SearchMatch, SnapshotService, LIST_CACHE_TTL,
};
pub use uri::{ensure_explicit_scheme, parse_repository_uri, ParsedUri};
