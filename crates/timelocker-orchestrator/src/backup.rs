use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use timelocker_config::ConfigStore;
use timelocker_domain::{
    validate_snapshot_id, BackupResult, BackupTargetDescriptor, OperationOutcome, OperationState,
    OperationStatus, OperationType, SecurityLevel,
};
use timelocker_engine::{CancelFlag, EngineClient, EngineError, EngineEvent, SummaryEvent};
use timelocker_events::StatusBus;
use timelocker_repo::{IntegrityReport, Repository, RepositoryFactory, RepositoryService};
use timelocker_security::SecurityService;

use crate::error::OrchestratorError;
use crate::retry::RetrySettings;
use crate::selection::{self, SelectionEstimate};
use crate::tasks::TaskRegistry;

/// Outcome of a pre-flight configuration validation, without executing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Drives backup runs end to end: config validation, selection
/// materialisation, the retry loop around the engine, status eventing, and
/// cooperative cancellation.
///
/// Public entry points return a failure-shaped [`BackupResult`] rather than
/// erroring: expected failures land in `result.errors`.
pub struct BackupOrchestrator {
    config: Arc<ConfigStore>,
    factory: Arc<RepositoryFactory>,
    engine: Arc<dyn EngineClient>,
    repo_service: RepositoryService,
    bus: Arc<StatusBus>,
    security: Option<Arc<SecurityService>>,
    tasks: Arc<TaskRegistry>,
    pool: Arc<Semaphore>,
}

impl BackupOrchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        factory: Arc<RepositoryFactory>,
        engine: Arc<dyn EngineClient>,
        bus: Arc<StatusBus>,
        max_concurrent_backups: usize,
    ) -> Self {
        Self {
            config,
            factory,
            repo_service: RepositoryService::new(engine.clone()),
            engine,
            bus,
            security: None,
            tasks: Arc::new(TaskRegistry::new()),
            pool: Arc::new(Semaphore::new(max_concurrent_backups.max(1))),
        }
    }

    pub fn with_security(mut self, security: Arc<SecurityService>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn tasks(&self) -> Arc<TaskRegistry> {
        self.tasks.clone()
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    pub async fn execute_backup(
        &self,
        repository_name: &str,
        target_names: &[String],
        tags: &[String],
        dry_run: bool,
        password: Option<String>,
    ) -> BackupResult {
        self.execute_backup_with_id(Uuid::new_v4(), repository_name, target_names, tags, dry_run, password)
            .await
    }

    /// Like [`execute_backup`](Self::execute_backup) with a caller-supplied
    /// operation id, so the facade can correlate events, audit records, and
    /// the returned result under one id.
    pub async fn execute_backup_with_id(
        &self,
        operation_id: Uuid,
        repository_name: &str,
        target_names: &[String],
        tags: &[String],
        dry_run: bool,
        password: Option<String>,
    ) -> BackupResult {
        let mut result = BackupResult::new(operation_id, repository_name);
        self.emit(operation_id, OperationState::Pending, "backup queued", None);

        let run = self
            .run_backup(operation_id, repository_name, target_names, tags, dry_run, password, &mut result)
            .await;

        match run {
            Ok(()) => {}
            Err(OrchestratorError::Cancelled) => {
                result.status = OperationOutcome::Cancelled;
                result.add_warning("backup cancelled");
            }
            Err(e) => {
                result.status = OperationOutcome::Failed;
                result.add_error(e.to_string());
            }
        }

        let repository_id = result
            .metadata
            .get("repository_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (state, message) = match result.status {
            OperationOutcome::Completed if result.warnings.is_empty() => {
                (OperationState::Success, "backup completed".to_string())
            }
            OperationOutcome::Completed => (
                OperationState::Warning,
                format!("backup completed with {} warnings", result.warnings.len()),
            ),
            OperationOutcome::Cancelled => (OperationState::Cancelled, "backup cancelled".into()),
            OperationOutcome::Failed => (
                OperationState::Error,
                result.errors.first().cloned().unwrap_or_else(|| "backup failed".into()),
            ),
        };
        self.emit(operation_id, state, &message, repository_id.as_deref());
        self.tasks.complete(operation_id, result.status);

        if let Some(security) = &self.security {
            let (event_type, level) = match result.status {
                OperationOutcome::Completed => ("backup_completed", SecurityLevel::Low),
                OperationOutcome::Cancelled => ("backup_cancelled", SecurityLevel::Medium),
                OperationOutcome::Failed => ("backup_failed", SecurityLevel::Medium),
            };
            security.record_event(event_type, level, &message, repository_id.as_deref());
        }

        result
    }

    /// Request cancellation of a running backup. Takes effect at the next
    /// engine-event boundary; returns false for unknown or already-finished
    /// operations.
    pub fn cancel(&self, operation_id: Uuid) -> bool {
        let cancelled = self.tasks.cancel(operation_id);
        if cancelled {
            info!(%operation_id, "backup cancellation requested");
        }
        cancelled
    }

    pub fn get_backup_status(&self, operation_id: Uuid) -> Option<crate::tasks::TaskState> {
        self.tasks.get(operation_id)
    }

    pub fn list_active_backups(&self) -> Vec<(Uuid, String)> {
        self.tasks.active()
    }

    /// Walk the targets' current selection and report file/byte totals,
    /// without touching the engine.
    pub fn estimate_backup_size(
        &self,
        target_names: &[String],
    ) -> Result<SelectionEstimate, OrchestratorError> {
        let config = self.config.load()?;
        let mut targets = Vec::new();
        for name in target_names {
            targets.push(
                config
                    .backup_targets
                    .get(name)
                    .cloned()
                    .ok_or_else(|| timelocker_config::ConfigError::TargetNotFound(name.clone()))?,
            );
        }
        let merged = selection::build_selection(&targets);
        let (materialised, _) = selection::materialize(&merged)?;
        Ok(selection::estimate(&materialised))
    }

    /// Validate a (repository, targets) request without executing it.
    pub fn validate_backup_configuration(
        &self,
        repository_name: &str,
        target_names: &[String],
    ) -> BackupConfigReport {
        let mut report = BackupConfigReport::default();
        match self.load_request(repository_name, target_names) {
            Ok((_, targets, warnings)) => {
                report.warnings = warnings;
                for target in &targets {
                    for path in &target.paths {
                        if !path.exists() {
                            report
                                .warnings
                                .push(format!("backup path does not exist: {}", path.display()));
                        }
                    }
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }
        report
    }

    /// Distinct verification operation: run the engine's `check` (optionally
    /// `check --read-data`) and report. Never mutates repository state.
    pub async fn verify_backup_integrity(
        &self,
        repository_name: &str,
        snapshot_id: Option<&str>,
        thorough: bool,
        password: Option<String>,
    ) -> Result<IntegrityReport, OrchestratorError> {
        if let Some(id) = snapshot_id {
            validate_snapshot_id(id).map_err(timelocker_repo::RepoError::Domain)?;
        }
        let config = self.config.load()?;
        let descriptor = config
            .repositories
            .get(repository_name)
            .cloned()
            .ok_or_else(|| timelocker_config::ConfigError::RepositoryNotFound(repository_name.into()))?;
        let repo = self.factory.create_repository(
            &descriptor.location,
            password,
            None,
            Some(repository_name.to_string()),
        )?;

        let report = if thorough {
            self.repo_service.check_with_read_data(&repo, None).await?
        } else {
            self.repo_service.check(&repo).await?
        };
        Ok(report)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_backup(
        &self,
        operation_id: Uuid,
        repository_name: &str,
        target_names: &[String],
        tags: &[String],
        dry_run: bool,
        password: Option<String>,
        result: &mut BackupResult,
    ) -> Result<(), OrchestratorError> {
        let config = self.config.load()?;
        let (descriptor, targets, warnings) = self.load_request(repository_name, target_names)?;
        for warning in warnings {
            result.add_warning(warning);
        }

        // Pool admission: long engine runs block a worker slot, so the pool
        // stays small and configurable.
        let _permit = self.pool.acquire().await.expect("backup pool never closes");
        let cancel = self.tasks.register(operation_id, repository_name);

        let repo = self.factory.create_repository(
            &descriptor.location,
            password,
            None,
            Some(repository_name.to_string()),
        )?;
        result
            .metadata
            .insert("repository_id".into(), json!(repo.id().as_str()));
        self.emit(
            operation_id,
            OperationState::Running,
            "backup running",
            Some(repo.id().as_str()),
        );

        if descriptor.read_only {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "repository '{}' is marked read-only",
                repository_name
            )));
        }

        if let Some(security) = &self.security {
            security.verify_repository_encryption(
                repo.id().as_str(),
                repo.resolve_password().is_some(),
                config.security.strict_unencrypted,
            )?;
        }

        let merged = selection::build_selection(&targets);
        merged
            .validate()
            .map_err(|e| OrchestratorError::InvalidConfiguration(e.to_string()))?;

        let mut all_tags: Vec<String> = tags.to_vec();
        for target in &targets {
            all_tags.extend(target.tags.iter().cloned());
        }

        if dry_run {
            // Same root set as a real run, but the engine is never spawned
            // and nothing is written to the repository.
            let (materialised, warnings) = selection::materialize(&merged)?;
            for warning in warnings {
                result.add_warning(warning);
            }
            let estimate = selection::estimate(&materialised);
            result.status = OperationOutcome::Completed;
            result.snapshot_id = Some(format!("dry-run-{}", Utc::now().timestamp()));
            result.total_files_processed = estimate.files;
            result.files_new = estimate.files;
            result.metadata.insert("dry_run".into(), json!(true));
            result.metadata.insert("estimated_files".into(), json!(estimate.files));
            result.metadata.insert("estimated_bytes".into(), json!(estimate.bytes));
            info!(%operation_id, files = estimate.files, bytes = estimate.bytes, "dry run complete");
            return Ok(());
        }

        // Pre-backup hooks run once, before the first attempt; a failing
        // pre-script aborts the run.
        for target in &targets {
            if let Some(script) = &target.pre_script {
                run_hook(script).await?;
            }
        }

        let retry = RetrySettings::from_backup_config(&config.backup);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            result.metadata.insert("attempts".into(), json!(attempt));

            if cancel.load(Ordering::Relaxed) {
                return Err(OrchestratorError::Cancelled);
            }

            // Re-materialise per attempt: paths may have (re)appeared.
            let (materialised, warnings) = selection::materialize(&merged)?;
            for warning in warnings {
                if !result.warnings.contains(&warning) {
                    result.add_warning(warning);
                }
            }

            let attempt_result = self
                .attempt_backup(operation_id, &repo, &materialised, &all_tags, &config.backup, &cancel)
                .await;

            match attempt_result {
                Ok(summary) => {
                    apply_summary(result, &summary);

                    if config.backup.verify_after_backup {
                        let report = self.repo_service.check(&repo).await?;
                        if !report.success {
                            let detail = report.errors.join("; ");
                            if attempt >= retry.max_attempts {
                                return Err(OrchestratorError::VerificationFailed(detail));
                            }
                            warn!(%operation_id, attempt, detail = %detail, "post-backup verification failed; retrying");
                            result.add_warning(format!(
                                "attempt {}: post-backup verification failed: {}",
                                attempt, detail
                            ));
                            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                            continue;
                        }
                    }

                    // Post-backup hooks are advisory: a failure is a warning
                    // on an otherwise-successful run.
                    for target in &targets {
                        if let Some(script) = &target.post_script {
                            if let Err(e) = run_hook(script).await {
                                result.add_warning(e.to_string());
                            }
                        }
                    }

                    result.status = OperationOutcome::Completed;
                    info!(
                        %operation_id,
                        snapshot_id = result.snapshot_id.as_deref().unwrap_or(""),
                        attempt,
                        "backup completed"
                    );
                    return Ok(());
                }
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    warn!(%operation_id, attempt, error = %e, "backup attempt failed; retrying");
                    result.add_warning(format!("attempt {} failed: {}", attempt, e));
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_backup(
        &self,
        operation_id: Uuid,
        repo: &Repository,
        materialised: &timelocker_domain::FileSelection,
        tags: &[String],
        backup_config: &timelocker_config::BackupConfig,
        cancel: &CancelFlag,
    ) -> Result<SummaryEvent, OrchestratorError> {
        let mut request = repo
            .request("backup")?
            .args(selection::backup_args(materialised, tags));
        if backup_config.exclude_caches {
            request = request.arg("--exclude-caches");
        }
        if backup_config.compression.to_lowercase() != "auto" {
            request = request
                .arg("--compression")
                .arg(backup_config.compression.to_lowercase());
        }

        // Forward engine progress onto the status bus as it streams in.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let EngineEvent::Status(status) = event {
                    let progress = OperationStatus::new(
                        operation_id,
                        OperationType::Backup,
                        OperationState::Running,
                        "backup progress",
                    )
                    .with_metadata("percent_done", json!(status.percent_done))
                    .with_metadata("files_done", json!(status.files_done));
                    bus.publish(&progress);
                }
            }
        });

        let run = self
            .engine
            .run_streaming(request, cancel.clone(), Some(tx))
            .await;
        let _ = forwarder.await;

        let output = match run {
            Ok(output) => output,
            Err(EngineError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        output
            .summary()
            .cloned()
            .ok_or_else(|| EngineError::InvalidOutput("backup produced no summary event".into()).into())
    }

    #[allow(clippy::type_complexity)]
    fn load_request(
        &self,
        repository_name: &str,
        target_names: &[String],
    ) -> Result<(timelocker_domain::RepositoryDescriptor, Vec<BackupTargetDescriptor>, Vec<String>), OrchestratorError>
    {
        let config = self.config.load()?;
        let descriptor = config
            .repositories
            .get(repository_name)
            .cloned()
            .ok_or_else(|| timelocker_config::ConfigError::RepositoryNotFound(repository_name.into()))?;

        if target_names.is_empty() {
            return Err(OrchestratorError::InvalidConfiguration(
                "at least one backup target is required".into(),
            ));
        }

        let mut targets = Vec::new();
        let mut warnings = Vec::new();
        for name in target_names {
            let target = config
                .backup_targets
                .get(name)
                .cloned()
                .ok_or_else(|| timelocker_config::ConfigError::TargetNotFound(name.clone()))?;
            if target.repository != repository_name {
                return Err(OrchestratorError::InvalidConfiguration(format!(
                    "target '{}' belongs to repository '{}', not '{}'",
                    name, target.repository, repository_name
                )));
            }
            if !target.enabled {
                warnings.push(format!("skipping disabled target '{}'", name));
                continue;
            }
            targets.push(target);
        }

        if targets.is_empty() {
            return Err(OrchestratorError::InvalidConfiguration(
                "no enabled backup target in request".into(),
            ));
        }
        Ok((descriptor, targets, warnings))
    }

    fn emit(
        &self,
        operation_id: Uuid,
        state: OperationState,
        message: &str,
        repository_id: Option<&str>,
    ) {
        let mut status =
            OperationStatus::new(operation_id, OperationType::Backup, state, message);
        if let Some(id) = repository_id {
            status = status.with_repository(id);
        }
        self.bus.publish(&status);
    }
}

/// Run a target's pre/post script to completion.
async fn run_hook(script: &std::path::Path) -> Result<(), OrchestratorError> {
    info!(script = %script.display(), "running hook script");
    let status = tokio::process::Command::new(script)
        .status()
        .await
        .map_err(|e| OrchestratorError::HookFailed {
            script: script.display().to_string(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(OrchestratorError::HookFailed {
            script: script.display().to_string(),
            detail: format!("exited with {}", status.code().unwrap_or(-1)),
        });
    }
    Ok(())
}

fn apply_summary(result: &mut BackupResult, summary: &SummaryEvent) {
    result.snapshot_id = summary.snapshot_id.clone();
    result.files_new = summary.files_new;
    result.files_changed = summary.files_changed;
    result.files_unmodified = summary.files_unmodified;
    result.data_added = summary.data_added;
    result.total_files_processed = summary.total_files_processed;
    result.total_duration = summary.total_duration;
    result
        .metadata
        .insert("engine_summary".into(), serde_json::Value::Object(summary.raw.clone()));
}
