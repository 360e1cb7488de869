use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Backend kind ──────────────────────────────────────────────────────────────

/// The storage backend family a repository URI resolves to.
///
/// Each variant knows which URI schemes select it; the engine receives the
/// backend's credentials through environment variables only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    B2,
    Sftp,
    Rest,
    Rclone,
    Swift,
    Azure,
    Gcs,
}

impl BackendKind {
    /// Resolve a URI scheme to a backend kind. An empty scheme is a bare
    /// filesystem path and maps to `Local`.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "" | "file" | "local" => Some(BackendKind::Local),
            "s3" => Some(BackendKind::S3),
            "b2" => Some(BackendKind::B2),
            "sftp" => Some(BackendKind::Sftp),
            "rest" => Some(BackendKind::Rest),
            "rclone" => Some(BackendKind::Rclone),
            "swift" => Some(BackendKind::Swift),
            "azure" => Some(BackendKind::Azure),
            "gs" => Some(BackendKind::Gcs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::B2 => "b2",
            BackendKind::Sftp => "sftp",
            BackendKind::Rest => "rest",
            BackendKind::Rclone => "rclone",
            BackendKind::Swift => "swift",
            BackendKind::Azure => "azure",
            BackendKind::Gcs => "gs",
        }
    }

    /// All schemes with a built-in backend, for validation messages.
    pub fn known_schemes() -> &'static [&'static str] {
        &["file", "local", "s3", "b2", "sftp", "rest", "rclone", "swift", "azure", "gs"]
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extract the scheme of a repository URI, or `""` for a bare path.
///
/// Engine-style URIs use a single-colon form (`s3:host/bucket`) as well as
/// the standard `scheme://` form. A single leading character before `:` is
/// treated as a Windows drive letter, not a scheme.
pub fn uri_scheme(uri: &str) -> &str {
    match uri.find(':') {
        Some(idx) if idx > 1 => {
            let candidate = &uri[..idx];
            if candidate.bytes().all(|b| b.is_ascii_alphanumeric()) {
                candidate
            } else {
                ""
            }
        }
        _ => "",
    }
}

// ── Persisted descriptors ─────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// A named repository as stored in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    /// Repository URI, e.g. `file:///backups/main` or `s3:s3.amazonaws.com/bucket`.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Whether backend credentials for this repository exist in the vault.
    #[serde(default)]
    pub has_backend_credentials: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl RepositoryDescriptor {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            description: None,
            tags: Vec::new(),
            has_backend_credentials: false,
            enabled: true,
            read_only: false,
        }
    }

    /// Repository names key the config map and appear in file paths derived
    /// from them, so they must be non-empty and separator-free.
    pub fn validate_name(name: &str) -> Result<(), DomainError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(DomainError::InvalidRepositoryName(name.to_string()));
        }
        Ok(())
    }
}

/// A named "what to back up" descriptor as stored in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTargetDescriptor {
    pub name: String,
    /// Name of the repository this target backs up into. Must resolve in the
    /// same configuration document.
    pub repository: String,
    /// Include roots. Individual paths may be missing at configuration time;
    /// that is a validation warning, not an error.
    pub paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
    /// Marker filenames: directories containing one of these are skipped
    /// (`--exclude-if-present`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// 5-field cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_script: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BackupTargetDescriptor {
    pub fn new(name: impl Into<String>, repository: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            paths,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            exclude_files: Vec::new(),
            tags: Vec::new(),
            schedule: None,
            pre_script: None,
            post_script: None,
            enabled: true,
        }
    }

    pub fn validate_name(name: &str) -> Result<(), DomainError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(DomainError::InvalidTargetName(name.to_string()));
        }
        Ok(())
    }
}

// ── File selection ────────────────────────────────────────────────────────────

/// Fully materialised backup selection, built per run from one or more
/// targets. Materialised before the engine is invoked so a dry run and a real
/// run see the same root set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSelection {
    pub includes: Vec<PathBuf>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_paths: Vec<PathBuf>,
    pub exclude_if_present: Vec<String>,
}

impl FileSelection {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.includes.is_empty() {
            return Err(DomainError::EmptySelection);
        }
        Ok(())
    }

    /// Merge another selection into this one, deduplicating roots and
    /// patterns while preserving first-seen order.
    pub fn merge(&mut self, other: &FileSelection) {
        for p in &other.includes {
            if !self.includes.contains(p) {
                self.includes.push(p.clone());
            }
        }
        for (dst, src) in [
            (&mut self.include_patterns, &other.include_patterns),
            (&mut self.exclude_patterns, &other.exclude_patterns),
            (&mut self.exclude_if_present, &other.exclude_if_present),
        ] {
            for s in src {
                if !dst.contains(s) {
                    dst.push(s.clone());
                }
            }
        }
        for p in &other.exclude_paths {
            if !self.exclude_paths.contains(p) {
                self.exclude_paths.push(p.clone());
            }
        }
    }
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// An engine-produced, immutable record of one backup run.
///
/// Holds identifiers and metadata only, never a reference back to its
/// repository. Operations take the repository handle explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Short hex id as reported by the engine.
    pub id: String,
    /// Full hex id.
    pub long_id: String,
    /// Snapshot creation time, RFC 3339 with timezone.
    pub timestamp: DateTime<FixedOffset>,
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
}

/// Criteria for narrowing a snapshot listing.
///
/// Tags are a disjunction within one filter; `date_from`/`date_to` are
/// inclusive bounds; `max_results` applies after sorting newest-first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    pub tags: Vec<String>,
    pub host: Option<String>,
    pub paths: Vec<PathBuf>,
    pub date_from: Option<DateTime<FixedOffset>>,
    pub date_to: Option<DateTime<FixedOffset>>,
    pub max_results: Option<usize>,
}

impl SnapshotFilter {
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if !self.tags.is_empty() && !self.tags.iter().any(|t| snapshot.tags.contains(t)) {
            return false;
        }
        if let Some(host) = &self.host {
            if &snapshot.hostname != host {
                return false;
            }
        }
        if !self.paths.is_empty() && !self.paths.iter().any(|p| snapshot.paths.contains(p)) {
            return false;
        }
        if let Some(from) = &self.date_from {
            if snapshot.timestamp < *from {
                return false;
            }
        }
        if let Some(to) = &self.date_to {
            if snapshot.timestamp > *to {
                return false;
            }
        }
        true
    }
}

/// Parsed output of an engine snapshot diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
    /// Net byte change between the two snapshots, when size metadata was
    /// requested and parsable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_delta: Option<i64>,
}

// ── Retention ─────────────────────────────────────────────────────────────────

/// Which snapshots to keep when applying retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
}

impl RetentionPolicy {
    /// At least one retention period must be specified before the policy may
    /// be applied; an empty policy would forget everything.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.keep_last.is_none()
            && self.keep_daily.is_none()
            && self.keep_weekly.is_none()
            && self.keep_monthly.is_none()
            && self.keep_yearly.is_none()
        {
            return Err(DomainError::EmptyRetentionPolicy);
        }
        Ok(())
    }
}

// ── Repository health ─────────────────────────────────────────────────────────

/// Structured result of a comprehensive repository health check. Each probe
/// is reported individually rather than collapsed into one boolean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryHealth {
    pub directory_exists: bool,
    pub directory_writable: bool,
    pub repository_initialized: bool,
    pub password_available: bool,
    pub engine_accessible: bool,
}

impl RepositoryHealth {
    pub fn is_healthy(&self) -> bool {
        self.directory_exists
            && self.directory_writable
            && self.repository_initialized
            && self.password_available
            && self.engine_accessible
    }
}

// ── Restore options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Leave existing files in place.
    #[default]
    Skip,
    Overwrite,
    /// Restore alongside with a suffixed name.
    KeepBoth,
    /// Surface the conflict count to the caller and let it decide.
    Prompt,
}

/// Progress hook: (phase, current, total).
pub type ProgressCallback = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Options for a restore run, built with `with_*` chaining.
#[derive(Clone, Default)]
pub struct RestoreOptions {
    pub target_path: Option<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub exclude_paths: Vec<PathBuf>,
    pub conflict_resolution: ConflictResolution,
    pub verify_after_restore: bool,
    pub create_target_directory: bool,
    pub preserve_permissions: bool,
    pub dry_run: bool,
    pub progress: Option<ProgressCallback>,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self {
            preserve_permissions: true,
            ..Default::default()
        }
    }

    pub fn with_target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn with_include_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.include_paths = paths;
        self
    }

    pub fn with_exclude_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.exclude_paths = paths;
        self
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_after_restore = verify;
        self
    }

    pub fn with_create_target_directory(mut self, create: bool) -> Self {
        self.create_target_directory = create;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl std::fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("target_path", &self.target_path)
            .field("include_paths", &self.include_paths)
            .field("exclude_paths", &self.exclude_paths)
            .field("conflict_resolution", &self.conflict_resolution)
            .field("verify_after_restore", &self.verify_after_restore)
            .field("create_target_directory", &self.create_target_directory)
            .field("preserve_permissions", &self.preserve_permissions)
            .field("dry_run", &self.dry_run)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

// ── Backend credentials ───────────────────────────────────────────────────────

/// Opaque per-backend credential map, e.g. for S3: `access_key_id`,
/// `secret_access_key`, optional `region`, optional `insecure_tls`.
/// Only ever persisted inside the encrypted vault.
pub type BackendCredentials = HashMap<String, String>;
