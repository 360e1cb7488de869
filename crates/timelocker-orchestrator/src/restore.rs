use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use timelocker_domain::{
    validate_snapshot_id, ConflictResolution, OperationOutcome, OperationState, OperationStatus,
    OperationType, RestoreOptions, RestoreResult, SecurityLevel, Snapshot, SnapshotFilter,
};
use timelocker_engine::{cancel_flag, EngineClient, EngineEvent};
use timelocker_events::StatusBus;
use timelocker_repo::{Repository, RepositoryService, SnapshotService};
use timelocker_security::SecurityService;

use crate::error::OrchestratorError;

/// Drives restore runs: integrity gate, pre-flight checks, engine
/// execution, and post-restore verification. Entry points return a
/// failure-shaped [`RestoreResult`].
pub struct RestoreOrchestrator {
    engine: Arc<dyn EngineClient>,
    repo_service: RepositoryService,
    snapshots: Arc<SnapshotService>,
    bus: Arc<StatusBus>,
    security: Option<Arc<SecurityService>>,
}

impl RestoreOrchestrator {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        snapshots: Arc<SnapshotService>,
        bus: Arc<StatusBus>,
    ) -> Self {
        Self {
            repo_service: RepositoryService::new(engine.clone()),
            engine,
            snapshots,
            bus,
            security: None,
        }
    }

    pub fn with_security(mut self, security: Arc<SecurityService>) -> Self {
        self.security = Some(security);
        self
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    pub async fn execute_restore(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        options: &RestoreOptions,
    ) -> RestoreResult {
        self.execute_restore_with_id(Uuid::new_v4(), repo, snapshot_id, options).await
    }

    pub async fn execute_restore_with_id(
        &self,
        operation_id: Uuid,
        repo: &Repository,
        snapshot_id: &str,
        options: &RestoreOptions,
    ) -> RestoreResult {
        let mut result = RestoreResult::new(operation_id, snapshot_id);
        self.emit(operation_id, OperationState::Pending, "restore queued", repo);
        self.emit(operation_id, OperationState::Running, "restore running", repo);

        let started = Instant::now();
        let run = self.run_restore(operation_id, repo, snapshot_id, options, &mut result).await;
        result.duration_seconds = started.elapsed().as_secs_f64();

        if let Err(e) = run {
            result.status = OperationOutcome::Failed;
            result.add_error(e.to_string());
        }

        let (state, message) = match result.status {
            OperationOutcome::Completed if result.warnings.is_empty() => {
                (OperationState::Success, "restore completed".to_string())
            }
            OperationOutcome::Completed => (
                OperationState::Warning,
                format!("restore completed with {} warnings", result.warnings.len()),
            ),
            OperationOutcome::Cancelled => (OperationState::Cancelled, "restore cancelled".into()),
            OperationOutcome::Failed => (
                OperationState::Error,
                result.errors.first().cloned().unwrap_or_else(|| "restore failed".into()),
            ),
        };
        self.emit(operation_id, state, &message, repo);

        if let Some(security) = &self.security {
            let (event_type, level) = match result.status {
                OperationOutcome::Completed => ("restore_completed", SecurityLevel::Low),
                _ => ("restore_failed", SecurityLevel::Medium),
            };
            security.record_event(event_type, level, &message, Some(repo.id().as_str()));
        }

        result
    }

    /// Restore the newest snapshot matching `filter`.
    pub async fn restore_latest(
        &self,
        repo: &Repository,
        filter: &SnapshotFilter,
        options: &RestoreOptions,
    ) -> RestoreResult {
        match self.snapshots.get_latest(repo, filter).await {
            Ok(Some(snapshot)) => self.execute_restore(repo, &snapshot.id, options).await,
            Ok(None) => {
                let mut result = RestoreResult::new(Uuid::new_v4(), "");
                result.add_error("repository has no snapshots matching the filter");
                result
            }
            Err(e) => {
                let mut result = RestoreResult::new(Uuid::new_v4(), "");
                result.add_error(e.to_string());
                result
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn run_restore(
        &self,
        operation_id: Uuid,
        repo: &Repository,
        snapshot_id: &str,
        options: &RestoreOptions,
        result: &mut RestoreResult,
    ) -> Result<(), OrchestratorError> {
        validate_snapshot_id(snapshot_id).map_err(timelocker_repo::RepoError::Domain)?;

        let target = options.target_path.clone().ok_or(OrchestratorError::NoTargetPath)?;
        if target.exists() && !target.is_dir() {
            return Err(OrchestratorError::TargetNotDirectory(target));
        }

        if options.dry_run {
            // Static pre-flight only: a dry run never invokes the engine,
            // neither for the integrity gate nor for the restore itself.
            result.status = OperationOutcome::Completed;
            result.metadata.insert("dry_run".into(), json!(true));
            if !target.exists() && !options.create_target_directory {
                result.add_warning(format!(
                    "target directory {} does not exist and will not be created",
                    target.display()
                ));
            }
            return Ok(());
        }

        // Integrity gate: a repository that fails `check` is never restored
        // from (critical security event, engine restore not spawned).
        if let Some(security) = &self.security {
            let report = self.repo_service.check(repo).await?;
            let detail = report.errors.join("; ");
            security.pre_restore_integrity_gate(repo.id().as_str(), report.success, &detail)?;
        }

        let snapshot = self.snapshots.get_by_id(repo, snapshot_id).await?;
        result
            .metadata
            .insert("snapshot_long_id".into(), json!(snapshot.long_id.clone()));

        // Snapshot self-verification is advisory: a failure downgrades to a
        // warning and the restore proceeds.
        if let Err(e) = self.snapshots.contents(repo, &snapshot.id, None).await {
            result.add_warning(format!("snapshot verification failed: {}", e));
        }

        if options.create_target_directory && !target.exists() {
            std::fs::create_dir_all(&target).map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    OrchestratorError::RestorePermission(target.clone())
                } else {
                    OrchestratorError::Repo(timelocker_repo::RepoError::Io {
                        path: target.display().to_string(),
                        source: e,
                    })
                }
            })?;
        }

        self.check_space(&target, &snapshot, result).await?;

        let overwrite_never = self.scan_conflicts(&target, options, result);

        // Engine execution.
        let mut request = repo
            .request("restore")?
            .arg(&snapshot.long_id)
            .arg("--target")
            .arg(target.display().to_string());
        for include in &options.include_paths {
            request = request.arg("--include").arg(include.display().to_string());
        }
        for exclude in &options.exclude_paths {
            request = request.arg("--exclude").arg(exclude.display().to_string());
        }
        if overwrite_never {
            request = request.arg("--overwrite").arg("never");
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = self.bus.clone();
        let progress = options.progress.clone();
        let repo_id = repo.id().as_str().to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let EngineEvent::Status(status) = event {
                    if let Some(progress) = &progress {
                        progress("restore", status.bytes_done, status.total_bytes);
                    }
                    let update = OperationStatus::new(
                        operation_id,
                        OperationType::Restore,
                        OperationState::Running,
                        "restore progress",
                    )
                    .with_repository(&repo_id)
                    .with_metadata("percent_done", json!(status.percent_done));
                    bus.publish(&update);
                }
            }
        });

        let run = self.engine.run_streaming(request, cancel_flag(), Some(tx)).await;
        let _ = forwarder.await;
        run?;

        // Post-verification: the engine's own file count is not reliably
        // parsable in every version, so walk the target instead.
        let restored = count_regular_files(&target);
        result.files_restored = restored;
        if restored == 0 {
            result.add_warning("no files found under the restore target after restore");
        } else if let Some(expected) = snapshot.total_files {
            if restored != expected {
                result.add_warning(format!(
                    "restored file count {} does not match snapshot file count {}",
                    restored, expected
                ));
            }
        }

        result.status = OperationOutcome::Completed;
        info!(%operation_id, files = restored, "restore completed");
        Ok(())
    }

    /// Free-space pre-flight: shortfall is an error, an unreadable probe is
    /// a warning.
    async fn check_space(
        &self,
        target: &Path,
        snapshot: &Snapshot,
        result: &mut RestoreResult,
    ) -> Result<(), OrchestratorError> {
        let Some(needed) = snapshot.total_size else {
            result.add_warning("snapshot reports no size; skipping free-space check");
            return Ok(());
        };
        match available_space(target).await {
            Some(available) if available < needed => {
                Err(OrchestratorError::InsufficientSpace { needed, available })
            }
            Some(_) => Ok(()),
            None => {
                result.add_warning("could not determine free space for the restore target");
                Ok(())
            }
        }
    }

    /// Count existing files in the target and apply the conflict policy.
    /// Returns whether the engine should be told never to overwrite.
    fn scan_conflicts(
        &self,
        target: &Path,
        options: &RestoreOptions,
        result: &mut RestoreResult,
    ) -> bool {
        if !target.exists() {
            return false;
        }
        let existing = count_regular_files(target);
        if existing == 0 {
            return false;
        }

        match options.conflict_resolution {
            ConflictResolution::Skip => {
                result.add_warning(format!("{} existing files will be left in place", existing));
                true
            }
            ConflictResolution::Overwrite => false,
            ConflictResolution::KeepBoth => {
                result.add_warning(format!(
                    "keep-both is not supported by the engine; {} existing files will be left in place",
                    existing
                ));
                true
            }
            ConflictResolution::Prompt => {
                result.add_warning(format!(
                    "target contains {} existing files; confirmation required before overwrite",
                    existing
                ));
                true
            }
        }
    }

    fn emit(&self, operation_id: Uuid, state: OperationState, message: &str, repo: &Repository) {
        let status = OperationStatus::new(operation_id, OperationType::Restore, state, message)
            .with_repository(repo.id().as_str());
        self.bus.publish(&status);
    }
}

/// Recursive count of regular files, symlinks excluded.
pub fn count_regular_files(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        let Ok(meta) = entry_path.symlink_metadata() else {
            continue;
        };
        if meta.is_file() {
            count += 1;
        } else if meta.is_dir() {
            count += count_regular_files(&entry_path);
        }
    }
    count
}

/// Available bytes on the filesystem holding `path`, probed via `df -Pk`
/// against the nearest existing ancestor.
async fn available_space(path: &Path) -> Option<u64> {
    let mut probe = path;
    while !probe.exists() {
        probe = probe.parent()?;
    }
    let output = tokio::process::Command::new("df")
        .arg("-Pk")
        .arg(probe)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        warn!(path = %probe.display(), "df probe failed");
        return None;
    }
    parse_df_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse POSIX `df -Pk` output: second line, fourth column, in KiB.
fn parse_df_output(stdout: &str) -> Option<u64> {
    let line = stdout.lines().nth(1)?;
    let available_kib: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(available_kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn df_output_parsing() {
        let stdout = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                      /dev/sda1 102400 51200 51200 50% /\n";
        assert_eq!(parse_df_output(stdout), Some(51200 * 1024));
        assert_eq!(parse_df_output("garbage"), None);
    }

    #[test]
    fn counts_regular_files_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"1").unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/b"), b"2").unwrap();
        assert_eq!(count_regular_files(tmp.path()), 2);
        assert_eq!(count_regular_files(&tmp.path().join("missing")), 0);
    }
}
