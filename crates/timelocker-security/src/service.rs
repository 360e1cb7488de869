use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use timelocker_domain::{SecurityEvent, SecurityLevel};
use timelocker_vault::CredentialVault;

use crate::error::SecurityError;

const AUDIT_LOG: &str = "audit.log";
const LOCKDOWN_MARKER: &str = "emergency_lockdown.marker";

/// Aggregated audit counts over a time window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecuritySummary {
    pub window_days: u32,
    pub total_events: usize,
    pub by_type: HashMap<String, usize>,
    pub by_level: HashMap<SecurityLevel, usize>,
}

/// Security policy and audit bridge.
///
/// Owns the append-only audit log under `<config>/security/`, enforces the
/// encryption and integrity policies around backup/restore, and carries the
/// emergency-lockdown switch.
pub struct SecurityService {
    dir: PathBuf,
    vault: Arc<CredentialVault>,
    write_lock: Mutex<()>,
}

impl SecurityService {
    pub fn new(security_dir: impl Into<PathBuf>, vault: Arc<CredentialVault>) -> Self {
        let dir = security_dir.into();
        ensure_dir(&dir);
        Self { dir, vault, write_lock: Mutex::new(()) }
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.dir.join(AUDIT_LOG)
    }

    // ── Audit ingress ─────────────────────────────────────────────────────────

    /// Append one event to the audit log:
    /// `timestamp|type|level|description|user|repository|metadata`.
    /// Auditing is best-effort and never fails the audited operation.
    pub fn record(&self, event: &SecurityEvent) {
        let metadata = if event.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&event.metadata).unwrap_or_default()
        };
        let line = format!(
            "{}|{}|{}|{}|{}|{}|{}\n",
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.level,
            sanitize_field(&event.description),
            current_user(),
            event.repository_id.as_deref().unwrap_or(""),
            metadata,
        );

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.audit_log_path();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "could not append audit record");
        }
    }

    /// Convenience ingress used by the orchestrators and the vault bridge.
    pub fn record_event(
        &self,
        event_type: &str,
        level: SecurityLevel,
        description: &str,
        repository_id: Option<&str>,
    ) {
        let mut event = SecurityEvent::new(event_type, level, description);
        if let Some(id) = repository_id {
            event = event.with_repository(id);
        }
        self.record(&event);
    }

    // ── Policy checks ─────────────────────────────────────────────────────────

    /// Check the repository-must-be-encrypted policy before a backup.
    ///
    /// The engine-level fact "created with a password" counts as encrypted.
    /// Default policy is permissive: a missing password raises a HIGH event
    /// and the backup continues. With `strict` set the backup is refused.
    pub fn verify_repository_encryption(
        &self,
        repository_id: &str,
        encrypted: bool,
        strict: bool,
    ) -> Result<(), SecurityError> {
        if encrypted {
            return Ok(());
        }
        self.record_event(
            "unencrypted_repository",
            SecurityLevel::High,
            "backup into repository without a password",
            Some(repository_id),
        );
        if strict {
            return Err(SecurityError::UnencryptedRepository(repository_id.to_string()));
        }
        warn!(repository_id, "repository is not encrypted; continuing (permissive policy)");
        Ok(())
    }

    /// Gate a restore on a previously-run integrity check. A failed check
    /// refuses the restore with a critical event; the engine's restore is
    /// never spawned.
    pub fn pre_restore_integrity_gate(
        &self,
        repository_id: &str,
        check_passed: bool,
        detail: &str,
    ) -> Result<(), SecurityError> {
        if check_passed {
            self.record_event(
                "pre_restore_check",
                SecurityLevel::Low,
                "repository integrity verified before restore",
                Some(repository_id),
            );
            return Ok(());
        }
        error!(repository_id, detail, "integrity check failed; refusing restore");
        self.record_event(
            "integrity_failure",
            SecurityLevel::Critical,
            &format!("restore refused, repository integrity check failed: {}", detail),
            Some(repository_id),
        );
        Err(SecurityError::IntegrityGateFailed(detail.to_string()))
    }

    // ── Summary ───────────────────────────────────────────────────────────────

    /// Event counts by type and level over the trailing `days`.
    pub fn get_security_summary(&self, days: u32) -> Result<SecuritySummary, SecurityError> {
        let path = self.audit_log_path();
        let mut summary = SecuritySummary { window_days: days, ..Default::default() };
        if !path.exists() {
            return Ok(summary);
        }

        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SecurityError::Io { path: path.display().to_string(), source: e })?;

        for line in content.lines() {
            let mut fields = line.split('|');
            let (Some(timestamp), Some(event_type), Some(level)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(timestamp) = DateTime::parse_from_rfc3339(timestamp) else {
                continue;
            };
            if timestamp.with_timezone(&Utc) < cutoff {
                continue;
            }
            summary.total_events += 1;
            *summary.by_type.entry(event_type.to_string()).or_default() += 1;
            if let Some(level) = parse_level(level) {
                *summary.by_level.entry(level).or_default() += 1;
            }
        }
        Ok(summary)
    }

    // ── Emergency lockdown ────────────────────────────────────────────────────

    /// Lock the vault, persist a lockdown marker that survives restarts, and
    /// record a critical event.
    pub fn emergency_lockdown(&self, reason: &str) -> Result<(), SecurityError> {
        error!(reason, "EMERGENCY LOCKDOWN");
        self.vault.lock();

        let marker = json!({
            "reason": reason,
            "initiated_at": Utc::now().to_rfc3339(),
            "initiated_by": current_user(),
        });
        let path = self.dir.join(LOCKDOWN_MARKER);
        std::fs::write(&path, serde_json::to_vec_pretty(&marker)?)
            .map_err(|e| SecurityError::Io { path: path.display().to_string(), source: e })?;

        self.record_event(
            "emergency_lockdown",
            SecurityLevel::Critical,
            &format!("emergency lockdown: {}", reason),
            None,
        );
        Ok(())
    }

    /// Whether a lockdown marker from this or a previous run is present.
    /// Checked at startup before any credential use.
    pub fn is_lockdown_active(&self) -> bool {
        self.dir.join(LOCKDOWN_MARKER).exists()
    }

    pub fn lockdown_details(&self) -> Option<Value> {
        let content = std::fs::read_to_string(self.dir.join(LOCKDOWN_MARKER)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Lift an active lockdown. Returns whether a marker was removed.
    pub fn clear_lockdown(&self) -> Result<bool, SecurityError> {
        let path = self.dir.join(LOCKDOWN_MARKER);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| SecurityError::Io { path: path.display().to_string(), source: e })?;
        info!("emergency lockdown cleared");
        self.record_event(
            "lockdown_cleared",
            SecurityLevel::Medium,
            "emergency lockdown cleared by operator",
            None,
        );
        Ok(true)
    }
}

fn ensure_dir(dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "could not create security directory");
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Pipes delimit the audit format; strip them from free text.
fn sanitize_field(text: &str) -> String {
    text.replace('|', "/").replace('\n', " ")
}

fn parse_level(s: &str) -> Option<SecurityLevel> {
    match s {
        "low" => Some(SecurityLevel::Low),
        "medium" => Some(SecurityLevel::Medium),
        "high" => Some(SecurityLevel::High),
        "critical" => Some(SecurityLevel::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> (SecurityService, Arc<CredentialVault>) {
        let vault = Arc::new(CredentialVault::new(dir.join("credentials")));
        (SecurityService::new(dir.join("security"), vault.clone()), vault)
    }

    #[test]
    fn record_appends_pipe_delimited_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());

        service.record_event(
            "credential_access",
            SecurityLevel::Low,
            "password read",
            Some("abc123"),
        );

        let log = std::fs::read_to_string(service.audit_log_path()).unwrap();
        let line = log.lines().next().unwrap();
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], "credential_access");
        assert_eq!(fields[2], "low");
        assert_eq!(fields[3], "password read");
        assert_eq!(fields[5], "abc123");
    }

    #[test]
    fn description_pipes_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());
        service.record_event("t", SecurityLevel::Low, "a|b|c", None);
        let log = std::fs::read_to_string(service.audit_log_path()).unwrap();
        assert_eq!(log.lines().next().unwrap().split('|').count(), 7);
    }

    #[test]
    fn permissive_encryption_policy_warns_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());

        service.verify_repository_encryption("repo1", false, false).unwrap();

        let summary = service.get_security_summary(1).unwrap();
        assert_eq!(summary.by_type.get("unencrypted_repository"), Some(&1));
        assert_eq!(summary.by_level.get(&SecurityLevel::High), Some(&1));
    }

    #[test]
    fn strict_encryption_policy_refuses() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());
        assert!(matches!(
            service.verify_repository_encryption("repo1", false, true),
            Err(SecurityError::UnencryptedRepository(_))
        ));
        assert!(service.verify_repository_encryption("repo1", true, true).is_ok());
    }

    #[test]
    fn integrity_gate_blocks_restore_with_critical_event() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());

        assert!(service.pre_restore_integrity_gate("repo1", true, "").is_ok());
        let refused = service.pre_restore_integrity_gate("repo1", false, "pack corrupt");
        assert!(matches!(refused, Err(SecurityError::IntegrityGateFailed(_))));

        let summary = service.get_security_summary(1).unwrap();
        assert_eq!(summary.by_level.get(&SecurityLevel::Critical), Some(&1));
        assert_eq!(summary.by_type.get("integrity_failure"), Some(&1));
    }

    #[test]
    fn summary_window_excludes_old_events() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, _) = service(tmp.path());

        // Hand-write an old record plus a fresh one.
        let old = format!(
            "{}|old_event|low|stale|user||\n",
            (Utc::now() - chrono::Duration::days(40)).to_rfc3339()
        );
        std::fs::write(service.audit_log_path(), old).unwrap();
        service.record_event("fresh_event", SecurityLevel::Low, "new", None);

        let summary = service.get_security_summary(30).unwrap();
        assert_eq!(summary.total_events, 1);
        assert!(summary.by_type.contains_key("fresh_event"));
        assert!(!summary.by_type.contains_key("old_event"));
    }

    #[test]
    fn emergency_lockdown_locks_vault_and_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let (service, vault) = service(tmp.path());
        vault.unlock("master").unwrap();
        assert!(!vault.is_locked());

        service.emergency_lockdown("suspicious access pattern").unwrap();

        assert!(vault.is_locked());
        assert!(service.is_lockdown_active());
        let details = service.lockdown_details().unwrap();
        assert_eq!(details["reason"], "suspicious access pattern");

        // A new service over the same directory still sees the marker.
        let vault2 = Arc::new(CredentialVault::new(tmp.path().join("credentials")));
        let service2 = SecurityService::new(tmp.path().join("security"), vault2);
        assert!(service2.is_lockdown_active());

        assert!(service2.clear_lockdown().unwrap());
        assert!(!service2.is_lockdown_active());
        assert!(!service2.clear_lockdown().unwrap());
    }
}
