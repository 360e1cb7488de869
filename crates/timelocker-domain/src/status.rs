use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ── Operation lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Backup,
    Restore,
    Verify,
    Check,
    Prune,
    Forget,
    Mount,
    Unmount,
    Init,
    Stats,
    Migrate,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::Backup => "backup",
            OperationType::Restore => "restore",
            OperationType::Verify => "verify",
            OperationType::Check => "check",
            OperationType::Prune => "prune",
            OperationType::Forget => "forget",
            OperationType::Mount => "mount",
            OperationType::Unmount => "unmount",
            OperationType::Init => "init",
            OperationType::Stats => "stats",
            OperationType::Migrate => "migrate",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of one operation.
///
/// Transitions: Pending → Running → one terminal state. The bus guarantees at
/// least one event per terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Pending,
    Running,
    Success,
    Warning,
    Error,
    Critical,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Pending | OperationState::Running)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Success => "success",
            OperationState::Warning => "warning",
            OperationState::Error => "error",
            OperationState::Critical => "critical",
            OperationState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One status event as published on the bus and persisted in the status
/// store. Metadata never carries secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: Uuid,
    pub operation_type: OperationType,
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl OperationStatus {
    pub fn new(
        operation_id: Uuid,
        operation_type: OperationType,
        state: OperationState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation_id,
            operation_type,
            state,
            repository_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Terminal outcome of an orchestrated backup or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    #[default]
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationOutcome::Completed => "completed",
            OperationOutcome::Failed => "failed",
            OperationOutcome::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Result of one backup run. Returned synchronously from the orchestrator;
/// expected failures land in `errors`, never as a thrown error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    pub operation_id: Uuid,
    pub repository: String,
    pub status: OperationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    /// Wall-clock seconds as reported by the engine summary.
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Raw engine summary plus orchestrator bookkeeping (e.g. `attempts`).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl BackupResult {
    pub fn new(operation_id: Uuid, repository: impl Into<String>) -> Self {
        Self {
            operation_id,
            repository: repository.into(),
            status: OperationOutcome::Failed,
            snapshot_id: None,
            files_new: 0,
            files_changed: 0,
            files_unmodified: 0,
            data_added: 0,
            total_files_processed: 0,
            total_duration: 0.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// Result of one restore run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub operation_id: Uuid,
    pub snapshot_id: String,
    pub status: OperationOutcome,
    #[serde(default)]
    pub files_restored: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl RestoreResult {
    pub fn new(operation_id: Uuid, snapshot_id: impl Into<String>) -> Self {
        Self {
            operation_id,
            snapshot_id: snapshot_id.into(),
            status: OperationOutcome::Failed,
            files_restored: 0,
            duration_seconds: 0.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

// ── Security events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub level: SecurityLevel,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SecurityEvent {
    pub fn new(
        event_type: impl Into<String>,
        level: SecurityLevel,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            level,
            description: description.into(),
            repository_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }
}
