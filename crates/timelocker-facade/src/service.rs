use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use timelocker_config::ConfigStore;
use timelocker_domain::{
    uri_scheme, BackupResult, RestoreOptions, RestoreResult, SecurityLevel, SnapshotFilter,
};
use timelocker_engine::{EngineClient, ResticEngine};
use timelocker_events::{JsonlStatusStore, StatusBus};
use timelocker_orchestrator::{BackupOrchestrator, RestoreOrchestrator};
use timelocker_repo::{
    ensure_explicit_scheme, Repository, RepositoryFactory, RepositoryService, SnapshotService,
};
use timelocker_security::{SecurityService, SecuritySummary};
use timelocker_vault::CredentialVault;

use crate::error::FacadeError;

/// Component liveness and workload overview returned by
/// [`IntegrationService::get_system_status`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub components: BTreeMap<String, bool>,
    pub active_operations: usize,
    pub lockdown_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_summary: Option<SecuritySummarySnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecuritySummarySnapshot {
    pub window_days: u32,
    pub total_events: usize,
}

impl From<SecuritySummary> for SecuritySummarySnapshot {
    fn from(summary: SecuritySummary) -> Self {
        Self { window_days: summary.window_days, total_events: summary.total_events }
    }
}

/// Composition root: builds the config store, status bus and store,
/// engine adapter, repository services, and the orchestrators, and exposes
/// the one API the CLI talks to.
///
/// Operation ids are generated here so a single id correlates status
/// events, audit records, and the returned result.
pub struct IntegrationService {
    config_dir: PathBuf,
    config: Arc<ConfigStore>,
    bus: Arc<StatusBus>,
    status_store: Arc<JsonlStatusStore>,
    engine: Arc<dyn EngineClient>,
    factory: Arc<RepositoryFactory>,
    repo_service: Arc<RepositoryService>,
    snapshots: Arc<SnapshotService>,
    vault: Option<Arc<CredentialVault>>,
    security: Option<Arc<SecurityService>>,
    backup: BackupOrchestrator,
    restore: RestoreOrchestrator,
}

impl IntegrationService {
    /// Assemble against the production engine binary.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self::with_engine(config_dir, Arc::new(ResticEngine::new()))
    }

    /// Assemble with a caller-supplied engine client (tests use stubs).
    pub fn with_engine(config_dir: impl Into<PathBuf>, engine: Arc<dyn EngineClient>) -> Self {
        let config_dir = config_dir.into();
        let config = Arc::new(ConfigStore::new(&config_dir));

        let bus = Arc::new(StatusBus::new());
        let status_store = Arc::new(JsonlStatusStore::new(config_dir.join("status")));
        bus.register(status_store.clone());

        // Startup sweep of expired status files.
        let retention = config
            .load()
            .map(|c| c.monitoring.status_retention_days)
            .unwrap_or(30);
        let swept = status_store.sweep_expired(retention);
        if swept > 0 {
            info!(swept, "expired status files removed");
        }

        let max_concurrent = config
            .load()
            .map(|c| c.backup.max_concurrent_backups)
            .unwrap_or(2);

        let factory = Arc::new(RepositoryFactory::new());
        let repo_service = Arc::new(RepositoryService::new(engine.clone()));
        let snapshots = Arc::new(SnapshotService::new(engine.clone()));

        let backup = BackupOrchestrator::new(
            config.clone(),
            factory.clone(),
            engine.clone(),
            bus.clone(),
            max_concurrent,
        );
        let restore = RestoreOrchestrator::new(engine.clone(), snapshots.clone(), bus.clone());

        Self {
            config_dir,
            config,
            bus,
            status_store,
            engine,
            factory,
            repo_service,
            snapshots,
            vault: None,
            security: None,
            backup,
            restore,
        }
    }

    /// Attach a credential vault: wires the security service and rebuilds
    /// the credential-aware factory and orchestrators around it.
    pub fn attach_vault(&mut self, vault: Arc<CredentialVault>) {
        let security = Arc::new(SecurityService::new(
            self.config_dir.join("security"),
            vault.clone(),
        ));

        let factory = Arc::new(RepositoryFactory::new().with_vault(vault.clone()));
        let max_concurrent = self
            .config
            .load()
            .map(|c| c.backup.max_concurrent_backups)
            .unwrap_or(2);

        self.backup = BackupOrchestrator::new(
            self.config.clone(),
            factory.clone(),
            self.engine.clone(),
            self.bus.clone(),
            max_concurrent,
        )
        .with_security(security.clone());
        self.restore = RestoreOrchestrator::new(
            self.engine.clone(),
            self.snapshots.clone(),
            self.bus.clone(),
        )
        .with_security(security.clone());

        self.factory = factory;
        self.vault = Some(vault);
        self.security = Some(security);
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    pub fn bus(&self) -> Arc<StatusBus> {
        self.bus.clone()
    }

    pub fn status_store(&self) -> Arc<JsonlStatusStore> {
        self.status_store.clone()
    }

    pub fn vault(&self) -> Option<Arc<CredentialVault>> {
        self.vault.clone()
    }

    pub fn security(&self) -> Option<Arc<SecurityService>> {
        self.security.clone()
    }

    pub fn repository_service(&self) -> Arc<RepositoryService> {
        self.repo_service.clone()
    }

    pub fn snapshot_service(&self) -> Arc<SnapshotService> {
        self.snapshots.clone()
    }

    pub fn backup_orchestrator(&self) -> &BackupOrchestrator {
        &self.backup
    }

    pub fn restore_orchestrator(&self) -> &RestoreOrchestrator {
        &self.restore
    }

    /// Build a repository handle from a configured name or an explicit URI.
    /// Bare paths are rejected with the `file://` remediation hint.
    pub fn resolve_repository(
        &self,
        name_or_uri: &str,
        password: Option<String>,
    ) -> Result<Repository, FacadeError> {
        if let Ok(config) = self.config.load() {
            if let Some(descriptor) = config.repositories.get(name_or_uri) {
                return Ok(self.factory.create_repository(
                    &descriptor.location,
                    password,
                    None,
                    Some(name_or_uri.to_string()),
                )?);
            }
        }
        if uri_scheme(name_or_uri).is_empty() {
            if name_or_uri.contains('/') || name_or_uri.contains('\\') {
                // A path-shaped value needs the explicit file:// scheme.
                ensure_explicit_scheme(name_or_uri)?;
            }
            return Err(FacadeError::UnknownRepository(name_or_uri.to_string()));
        }
        Ok(self.factory.create_repository(name_or_uri, password, None, None)?)
    }

    // ── Wrapped operations ────────────────────────────────────────────────────

    /// Run a backup under a facade-generated operation id, with audit hooks
    /// around the orchestrator call.
    pub async fn execute_backup(
        &self,
        repository_name: &str,
        target_names: &[String],
        tags: &[String],
        dry_run: bool,
        password: Option<String>,
    ) -> Result<BackupResult, FacadeError> {
        self.refuse_when_locked_down()?;
        let operation_id = Uuid::new_v4();
        self.audit_boundary("operation_start", "backup", operation_id);

        let result = self
            .backup
            .execute_backup_with_id(operation_id, repository_name, target_names, tags, dry_run, password)
            .await;

        self.audit_boundary("operation_end", "backup", operation_id);
        Ok(result)
    }

    /// Run a restore against a configured repository name or explicit URI.
    pub async fn execute_restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        options: &RestoreOptions,
        password: Option<String>,
    ) -> Result<RestoreResult, FacadeError> {
        self.refuse_when_locked_down()?;
        let repo = self.resolve_repository(repository, password)?;
        let operation_id = Uuid::new_v4();
        self.audit_boundary("operation_start", "restore", operation_id);

        let result = self
            .restore
            .execute_restore_with_id(operation_id, &repo, snapshot_id, options)
            .await;

        self.audit_boundary("operation_end", "restore", operation_id);
        Ok(result)
    }

    /// Restore the latest snapshot matching `filter`.
    pub async fn restore_latest(
        &self,
        repository: &str,
        filter: &SnapshotFilter,
        options: &RestoreOptions,
        password: Option<String>,
    ) -> Result<RestoreResult, FacadeError> {
        self.refuse_when_locked_down()?;
        let repo = self.resolve_repository(repository, password)?;
        Ok(self.restore.restore_latest(&repo, filter, options).await)
    }

    pub fn cancel(&self, operation_id: Uuid) -> bool {
        self.backup.cancel(operation_id)
    }

    /// Component liveness, in-flight operation count, and the security
    /// summary when a vault is attached.
    pub fn get_system_status(&self) -> SystemStatus {
        let mut components = BTreeMap::new();
        components.insert("configuration".into(), self.config.load().is_ok());
        components.insert("status_store".into(), self.status_store.dir().exists());
        components.insert(
            "vault".into(),
            self.vault.as_ref().map(|v| !v.is_locked()).unwrap_or(false),
        );
        components.insert("security".into(), self.security.is_some());

        let active_operations = self.backup.list_active_backups().len();
        let lockdown_active = self
            .security
            .as_ref()
            .map(|s| s.is_lockdown_active())
            .unwrap_or(false);
        let security_summary = self
            .security
            .as_ref()
            .and_then(|s| s.get_security_summary(7).ok())
            .map(Into::into);

        SystemStatus { components, active_operations, lockdown_active, security_summary }
    }

    /// Trip the emergency lockdown (requires an attached vault).
    pub fn emergency_lockdown(&self, reason: &str) -> Result<(), FacadeError> {
        let security = self.security.as_ref().ok_or(FacadeError::NoVault)?;
        security.emergency_lockdown(reason)?;
        Ok(())
    }

    fn refuse_when_locked_down(&self) -> Result<(), FacadeError> {
        if let Some(security) = &self.security {
            if security.is_lockdown_active() {
                warn!("operation refused: emergency lockdown is active");
                return Err(FacadeError::LockdownActive);
            }
        }
        Ok(())
    }

    /// Operation start/end markers land in the security audit log (when a
    /// vault is attached) so one operation id lines up across status
    /// events, audit records, and the returned result.
    fn audit_boundary(&self, marker: &str, operation: &str, operation_id: Uuid) {
        if let Some(security) = &self.security {
            security.record_event(
                marker,
                SecurityLevel::Low,
                &format!("{} {}", operation, operation_id),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use timelocker_config::Config;
    use timelocker_domain::{
        BackupTargetDescriptor, OperationOutcome, RepositoryDescriptor,
    };
    use timelocker_engine::{
        CancelFlag, EngineError, EngineEvent, EngineOutput, EngineRequest, EngineVersion,
        MIN_ENGINE_VERSION,
    };
    use tokio::sync::mpsc::UnboundedSender;

    struct StubEngine {
        responses: Mutex<HashMap<String, VecDeque<Result<EngineOutput, EngineError>>>>,
    }

    impl StubEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(HashMap::new()) })
        }
    }

    #[async_trait]
    impl EngineClient for StubEngine {
        async fn version(&self) -> Result<EngineVersion, EngineError> {
            Ok(MIN_ENGINE_VERSION)
        }

        async fn run_streaming(
            &self,
            request: EngineRequest,
            _cancel: CancelFlag,
            _events_tx: Option<UnboundedSender<EngineEvent>>,
        ) -> Result<EngineOutput, EngineError> {
            self.responses
                .lock()
                .unwrap()
                .get_mut(request.subcommand_name())
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    panic!("no stubbed response for '{}'", request.subcommand_name())
                })
        }
    }

    fn service_with_fixture() -> (IntegrationService, tempfile::TempDir, tempfile::TempDir) {
        let config_dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        std::fs::write(source_dir.path().join("f.txt"), b"data").unwrap();

        let service = IntegrationService::with_engine(config_dir.path(), StubEngine::new());

        let mut doc = Config::default();
        doc.repositories
            .insert("demo".into(), RepositoryDescriptor::new("demo", "file:///tmp/r"));
        doc.backup_targets.insert(
            "docs".into(),
            BackupTargetDescriptor::new("docs", "demo", vec![source_dir.path().to_path_buf()]),
        );
        service.config().save(&doc).unwrap();

        (service, config_dir, source_dir)
    }

    #[tokio::test]
    async fn backup_result_and_status_store_share_one_operation_id() {
        let (service, _config_dir, _source_dir) = service_with_fixture();

        let result = service
            .execute_backup("demo", &["docs".into()], &[], true, Some("p".into()))
            .await
            .unwrap();
        assert_eq!(result.status, OperationOutcome::Completed);

        let current = service.status_store().read_day(chrono_today()).unwrap();
        assert!(current.iter().any(|s| s.operation_id == result.operation_id));
    }

    fn chrono_today() -> chrono::NaiveDate {
        chrono::Utc::now().date_naive()
    }

    #[test]
    fn resolve_repository_rejects_bare_paths_with_hint() {
        let (service, _config_dir, _source_dir) = service_with_fixture();
        let err = service.resolve_repository("/data/backup", None).unwrap_err();
        assert!(err.to_string().contains("file:///data/backup"));
    }

    #[test]
    fn resolve_repository_prefers_configured_names() {
        let (service, _config_dir, _source_dir) = service_with_fixture();
        let repo = service.resolve_repository("demo", Some("p".into())).unwrap();
        assert_eq!(repo.name(), Some("demo"));
        assert_eq!(repo.engine_location(), "/tmp/r");

        let direct = service
            .resolve_repository("s3:host/bucket", Some("p".into()))
            .unwrap();
        assert_eq!(direct.name(), None);
    }

    #[test]
    fn unknown_name_with_scheme_less_value_errors() {
        let (service, _config_dir, _source_dir) = service_with_fixture();
        // Scheme-ful but unknown: passes through to the factory.
        assert!(service.resolve_repository("b2:bucket", None).is_ok());
        // Unknown name without scheme and not path-like still errors.
        let err = service.resolve_repository("nosuchrepo", None).unwrap_err();
        assert!(matches!(
            err,
            FacadeError::UnknownRepository(_) | FacadeError::Repo(_)
        ));
    }

    #[tokio::test]
    async fn lockdown_refuses_operations_until_cleared() {
        let (mut service, config_dir, _source_dir) = service_with_fixture();
        let vault = Arc::new(CredentialVault::new(config_dir.path().join("credentials")));
        service.attach_vault(vault);

        service.emergency_lockdown("drill").unwrap();
        let refused = service
            .execute_backup("demo", &["docs".into()], &[], true, Some("p".into()))
            .await;
        assert!(matches!(refused, Err(FacadeError::LockdownActive)));

        let status = service.get_system_status();
        assert!(status.lockdown_active);

        service.security().unwrap().clear_lockdown().unwrap();
        let allowed = service
            .execute_backup("demo", &["docs".into()], &[], true, Some("p".into()))
            .await
            .unwrap();
        assert_eq!(allowed.status, OperationOutcome::Completed);
    }

    #[test]
    fn system_status_reports_components() {
        let (mut service, config_dir, _source_dir) = service_with_fixture();
        let status = service.get_system_status();
        assert_eq!(status.components.get("configuration"), Some(&true));
        assert_eq!(status.components.get("vault"), Some(&false));
        assert_eq!(status.active_operations, 0);
        assert!(status.security_summary.is_none());

        let vault = Arc::new(CredentialVault::new(config_dir.path().join("credentials")));
        vault.auto_unlock();
        service.attach_vault(vault);
        let status = service.get_system_status();
        assert_eq!(status.components.get("vault"), Some(&true));
        assert!(status.security_summary.is_some());
    }

    #[tokio::test]
    async fn facade_audits_operation_boundaries() {
        let (mut service, config_dir, _source_dir) = service_with_fixture();
        let vault = Arc::new(CredentialVault::new(config_dir.path().join("credentials")));
        vault.auto_unlock();
        service.attach_vault(vault);

        service
            .execute_backup("demo", &["docs".into()], &[], true, Some("p".into()))
            .await
            .unwrap();

        let summary = service.security().unwrap().get_security_summary(1).unwrap();
        assert_eq!(summary.by_type.get("operation_start"), Some(&1));
        assert_eq!(summary.by_type.get("operation_end"), Some(&1));
    }
}
