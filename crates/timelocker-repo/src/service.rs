use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use timelocker_domain::{validate_snapshot_id, RepositoryHealth, RetentionPolicy};
use timelocker_engine::{EngineClient, EngineError};

use crate::error::RepoError;
use crate::repository::Repository;

/// Default ceiling for `check --read-data`; reading every pack is slow and
/// a stuck remote should not hang the caller forever.
pub const READ_DATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Initialization state of a local repository path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInitState {
    /// Parent directory missing: initialization would fail.
    AbsentParent,
    /// Directory missing or empty: eligible for `init`.
    EmptyDir,
    /// Contains the engine's `config` object: initialized.
    DirWithConfig,
    /// Non-empty but without `config`: usable, not initialized.
    DirWithoutConfig,
}

/// Structured result of an integrity check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrityReport {
    pub success: bool,
    pub checks_performed: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parsed `stats` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryStats {
    pub total_size: u64,
    pub total_file_count: u64,
    pub snapshots_count: u64,
    pub raw: Map<String, Value>,
}

/// Operations on one repository: thin typed wrappers around engine
/// subcommands.
pub struct RepositoryService {
    engine: Arc<dyn EngineClient>,
}

impl RepositoryService {
    pub fn new(engine: Arc<dyn EngineClient>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Arc<dyn EngineClient> {
        self.engine.clone()
    }

    /// Initialize the repository. Idempotent: a repository that already has
    /// a `config` object reports success without re-initialising.
    /// Returns whether an `init` actually ran.
    pub async fn initialize(&self, repo: &Repository) -> Result<bool, RepoError> {
        match self.engine.run(repo.request("cat")?.arg("config")).await {
            Ok(_) => {
                info!(repository = %repo.display_name(), "repository already initialized");
                return Ok(false);
            }
            Err(EngineError::NotInitialized) | Err(EngineError::NotFound) => {}
            // `cat config` on an uninitialised repo reports a generic error
            // on some backends; treat a bad password as fatal, anything else
            // as "try init".
            Err(e @ EngineError::BadPassword) => return Err(e.into()),
            Err(EngineError::Engine { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.engine.run(repo.request("init")?).await?;
        info!(repository = %repo.display_name(), "repository initialized");
        Ok(true)
    }

    /// Fast structural integrity check.
    pub async fn check(&self, repo: &Repository) -> Result<IntegrityReport, RepoError> {
        let mut report = IntegrityReport::default();
        report.checks_performed.push("repository_structure".into());
        match self.engine.run(repo.request("check")?).await {
            Ok(_) => report.success = true,
            Err(e) => report.errors.push(e.to_string()),
        }
        Ok(report)
    }

    /// Thorough check that re-reads pack data. A timeout is reported as a
    /// warning, not a failure: the data read so far was sound and an
    /// operator can schedule a longer window.
    pub async fn check_with_read_data(
        &self,
        repo: &Repository,
        timeout: Option<Duration>,
    ) -> Result<IntegrityReport, RepoError> {
        let mut report = self.check(repo).await?;
        if !report.success {
            return Ok(report);
        }

        report.checks_performed.push("read_data".into());
        let request = repo
            .request("check")?
            .arg("--read-data")
            .timeout(timeout.unwrap_or(READ_DATA_TIMEOUT));
        match self.engine.run(request).await {
            Ok(_) => {}
            Err(EngineError::Timeout(secs)) => {
                warn!(repository = %repo.display_name(), secs, "read-data verification timed out");
                report
                    .warnings
                    .push(format!("data verification timed out after {} seconds", secs));
            }
            Err(e) => {
                report.success = false;
                report.errors.push(format!("data verification failed: {}", e));
            }
        }
        Ok(report)
    }

    pub async fn stats(&self, repo: &Repository) -> Result<RepositoryStats, RepoError> {
        let output = self.engine.run(repo.request("stats")?).await?;
        let raw: Map<String, Value> = last_json_object(&output.stdout)
            .ok_or_else(|| RepoError::Parse("stats output is not a json object".into()))?;
        Ok(RepositoryStats {
            total_size: raw.get("total_size").and_then(Value::as_u64).unwrap_or(0),
            total_file_count: raw.get("total_file_count").and_then(Value::as_u64).unwrap_or(0),
            snapshots_count: raw.get("snapshots_count").and_then(Value::as_u64).unwrap_or(0),
            raw,
        })
    }

    /// Clear stale engine locks left by crashed processes.
    pub async fn unlock(&self, repo: &Repository) -> Result<(), RepoError> {
        self.engine.run(repo.request("unlock")?).await?;
        info!(repository = %repo.display_name(), "cleared stale repository locks");
        Ok(())
    }

    /// Repository format migrations the engine offers for this repository.
    pub async fn list_available_migrations(
        &self,
        repo: &Repository,
    ) -> Result<Vec<String>, RepoError> {
        let output = self.engine.run(repo.request("migrate")?).await?;
        // With no migration name the engine lists candidates, one per line,
        // as `name: description`.
        let migrations = output
            .stdout
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                let (name, _) = line.split_once(':')?;
                let name = name.trim();
                (!name.is_empty() && !name.contains(' ')).then(|| name.to_string())
            })
            .collect();
        Ok(migrations)
    }

    pub async fn migrate(&self, repo: &Repository, name: &str) -> Result<(), RepoError> {
        self.engine.run(repo.request("migrate")?.arg(name)).await?;
        info!(repository = %repo.display_name(), migration = name, "repository migration applied");
        Ok(())
    }

    /// Apply a retention policy via `forget --keep-*`.
    pub async fn apply_retention_policy(
        &self,
        repo: &Repository,
        policy: &RetentionPolicy,
        prune: bool,
        dry_run: bool,
    ) -> Result<(), RepoError> {
        policy.validate()?;
        let mut request = repo.request("forget")?;
        for (flag, value) in [
            ("--keep-last", policy.keep_last),
            ("--keep-daily", policy.keep_daily),
            ("--keep-weekly", policy.keep_weekly),
            ("--keep-monthly", policy.keep_monthly),
            ("--keep-yearly", policy.keep_yearly),
        ] {
            if let Some(n) = value {
                request = request.arg(flag).arg(n.to_string());
            }
        }
        if prune {
            request = request.arg("--prune");
        }
        if dry_run {
            request = request.arg("--dry-run");
        }
        self.engine.run(request).await?;
        Ok(())
    }

    /// Drop unreferenced data from the repository.
    pub async fn prune(&self, repo: &Repository) -> Result<(), RepoError> {
        self.engine.run(repo.request("prune")?).await?;
        Ok(())
    }

    pub async fn forget_snapshot(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        prune: bool,
    ) -> Result<(), RepoError> {
        validate_snapshot_id(snapshot_id)?;
        let mut request = repo.request("forget")?.arg(snapshot_id);
        if prune {
            request = request.arg("--prune");
        }
        self.engine.run(request).await?;
        Ok(())
    }

    /// Classify a local repository path for `init` eligibility.
    pub fn local_init_state(path: &Path) -> LocalInitState {
        if !path.exists() {
            match path.parent() {
                Some(parent) if parent.as_os_str().is_empty() || parent.exists() => {
                    return LocalInitState::EmptyDir
                }
                Some(_) => return LocalInitState::AbsentParent,
                None => return LocalInitState::EmptyDir,
            }
        }
        let has_entries = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_entries {
            LocalInitState::EmptyDir
        } else if path.join("config").exists() {
            LocalInitState::DirWithConfig
        } else {
            LocalInitState::DirWithoutConfig
        }
    }

    /// Comprehensive health probe: each aspect reported individually.
    pub async fn health_check(&self, repo: &Repository) -> RepositoryHealth {
        let mut health = RepositoryHealth::default();

        let local_path = match repo.kind() {
            timelocker_domain::BackendKind::Local => {
                Some(std::path::PathBuf::from(repo.engine_location()))
            }
            _ => None,
        };

        match &local_path {
            Some(path) => {
                health.directory_exists = path.exists();
                health.directory_writable = path.exists() && dir_writable(path);
            }
            None => {
                // Remote backends: existence and writability are the
                // engine's to report.
                health.directory_exists = true;
                health.directory_writable = true;
            }
        }

        health.password_available = repo.resolve_password().is_some();
        health.engine_accessible = self.engine.version().await.is_ok();

        health.repository_initialized = if health.password_available && health.engine_accessible {
            match repo.request("cat") {
                Ok(request) => self.engine.run(request.arg("config")).await.is_ok(),
                Err(_) => false,
            }
        } else if let Some(path) = &local_path {
            Self::local_init_state(path) == LocalInitState::DirWithConfig
        } else {
            false
        };

        health
    }
}

fn dir_writable(path: &Path) -> bool {
    let probe = path.join(".timelocker-write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// The engine prints a single JSON document for some subcommands; find the
/// last parseable object line.
fn last_json_object(stdout: &str) -> Option<Map<String, Value>> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}
