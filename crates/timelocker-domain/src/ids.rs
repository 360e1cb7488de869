use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DomainError;

// ── RepositoryId ──────────────────────────────────────────────────────────────

/// Stable identifier for a repository, independent of its configured name.
///
/// Derived as the first 16 hex characters of SHA-256 over the repository URI,
/// so the same URI yields the same id across processes and machines. Used to
/// key vault entries and to correlate status events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId(pub String);

impl RepositoryId {
    pub fn from_uri(uri: &str) -> Self {
        let digest = Sha256::digest(uri.as_bytes());
        let hex = format!("{:x}", digest);
        RepositoryId(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Snapshot id validation ────────────────────────────────────────────────────

/// Validate a snapshot id or unique prefix: 4 to 64 lowercase hex characters.
///
/// Applied at the entry of every snapshot, backup, and restore operation that
/// accepts an id, so malformed ids never reach the engine.
pub fn validate_snapshot_id(id: &str) -> Result<(), DomainError> {
    let hex = id.len() >= 4
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if hex {
        Ok(())
    } else {
        Err(DomainError::InvalidSnapshotId(id.to_string()))
    }
}
