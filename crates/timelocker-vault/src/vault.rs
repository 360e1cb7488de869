use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use timelocker_domain::BackendCredentials;

use crate::crypto::{self, KEY_SIZE, SALT_SIZE};
use crate::error::VaultError;
use crate::fingerprint;
use crate::lockfile::VaultLock;

const CREDENTIALS_FILE: &str = "credentials.enc";
const SALT_FILE: &str = "salt";
const AUDIT_LOG: &str = "credential_audit.log";
const ACCESS_LOG: &str = "access.log";

/// Tunables for lockout and auto-lock behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultSettings {
    pub auto_lock_timeout: Duration,
    pub max_failed_attempts: u32,
    pub lockout_duration: Duration,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            auto_lock_timeout: Duration::from_secs(1800),
            max_failed_attempts: 5,
            lockout_duration: Duration::from_secs(300),
        }
    }
}

// ── Encrypted payload ─────────────────────────────────────────────────────────

/// Per-secret bookkeeping. Reads bump the counter and refresh the timestamp
/// atomically with the value read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

impl SecretMetadata {
    fn new() -> Self {
        let now = Utc::now();
        Self { created_at: now, last_accessed: now, access_count: 0 }
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PasswordEntry {
    password: String,
    #[serde(flatten)]
    meta: SecretMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BackendEntry {
    credentials: BackendCredentials,
    #[serde(flatten)]
    meta: SecretMetadata,
}

/// The decrypted vault document. `backends` holds legacy global credentials
/// keyed by backend type only, retained for backward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct VaultDocument {
    repositories: BTreeMap<String, PasswordEntry>,
    backends: BTreeMap<String, BackendCredentials>,
    repository_backends: BTreeMap<String, BTreeMap<String, BackendEntry>>,
}

// ── Vault ─────────────────────────────────────────────────────────────────────

struct VaultState {
    key: Option<[u8; KEY_SIZE]>,
    unlock_time: Option<Instant>,
    failed_attempts: u32,
    last_failed_attempt: Option<Instant>,
}

/// Encrypted-at-rest credential store.
///
/// States: locked (no key in memory) or unlocked (key held). Secret access
/// requires an unlocked vault and never unlocks implicitly, so unattended
/// unlock failures stay visible to the calling layer.
pub struct CredentialVault {
    dir: PathBuf,
    settings: VaultSettings,
    state: Mutex<VaultState>,
}

impl CredentialVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_settings(dir, VaultSettings::default())
    }

    pub fn with_settings(dir: impl Into<PathBuf>, settings: VaultSettings) -> Self {
        let dir = dir.into();
        timelocker_config::paths::ensure_private_dir(&dir);
        let vault = Self {
            dir,
            settings,
            state: Mutex::new(VaultState {
                key: None,
                unlock_time: None,
                failed_attempts: 0,
                last_failed_attempt: None,
            }),
        };
        vault.init_audit_log();
        vault
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Lock state ────────────────────────────────────────────────────────────

    pub fn is_locked(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.enforce_auto_lock(&mut state);
        state.key.is_none()
    }

    /// Zero the in-memory key.
    pub fn lock(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut key) = state.key.take() {
            key.fill(0);
        }
        state.unlock_time = None;
        self.log_access("lock", true, "");
    }

    /// Unlock with an explicit master password. Counts failures toward the
    /// lockout threshold.
    pub fn unlock(&self, master_password: &str) -> Result<(), VaultError> {
        self.unlock_inner(master_password, false)
    }

    /// Unlock using the deterministic machine-bound key. Failures never
    /// count toward lockout, so a fleet of unattended runs cannot lock the
    /// operator out.
    pub fn auto_unlock(&self) -> bool {
        self.unlock_inner(&fingerprint::auto_master_key(), true).is_ok()
    }

    /// Best-effort unlock chain: already unlocked → auto-unlock →
    /// `TIMELOCKER_MASTER_PASSWORD` → interactive prompt when allowed and on
    /// a terminal.
    pub fn ensure_unlocked(&self, allow_prompt: bool) -> bool {
        if !self.is_locked() {
            return true;
        }
        if self.auto_unlock() {
            return true;
        }
        if let Ok(password) = std::env::var("TIMELOCKER_MASTER_PASSWORD") {
            if !password.is_empty() && self.unlock(&password).is_ok() {
                return true;
            }
        }
        if allow_prompt && std::io::stdin().is_terminal() {
            if let Some(password) = prompt_password() {
                if self.unlock(&password).is_ok() {
                    return true;
                }
            }
        }
        false
    }

    fn unlock_inner(&self, master_password: &str, is_auto: bool) -> Result<(), VaultError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_lockout(&mut state)?;

        let salt = self.get_or_create_salt()?;
        let key = crypto::derive_key(master_password, &salt);

        // Prove the key against the existing ciphertext, if any.
        let credentials_file = self.dir.join(CREDENTIALS_FILE);
        if credentials_file.exists() {
            let container = std::fs::read_to_string(&credentials_file)
                .map_err(|e| self.io_err(&credentials_file, e))?;
            if let Err(e) = crypto::decrypt(&key, &container) {
                if !is_auto {
                    state.failed_attempts += 1;
                    state.last_failed_attempt = Some(Instant::now());
                    if state.failed_attempts >= self.settings.max_failed_attempts {
                        self.log_audit(
                            "lockout_triggered",
                            "",
                            false,
                            &format!("failed attempts: {}", state.failed_attempts),
                        );
                    }
                }
                self.log_access(unlock_kind(is_auto), false, "bad master password");
                return Err(VaultError::UnlockFailed(e.to_string()));
            }
        }

        state.key = Some(key);
        state.unlock_time = Some(Instant::now());
        state.failed_attempts = 0;
        state.last_failed_attempt = None;
        self.log_access(unlock_kind(is_auto), true, "");
        debug!(vault = %self.dir.display(), "vault unlocked");
        Ok(())
    }

    fn check_lockout(&self, state: &mut VaultState) -> Result<(), VaultError> {
        if state.failed_attempts < self.settings.max_failed_attempts {
            return Ok(());
        }
        if let Some(last) = state.last_failed_attempt {
            let elapsed = last.elapsed();
            if elapsed < self.settings.lockout_duration {
                let remaining = self.settings.lockout_duration - elapsed;
                return Err(VaultError::LockedOut { remaining_seconds: remaining.as_secs().max(1) });
            }
        }
        // Lockout window has passed.
        state.failed_attempts = 0;
        state.last_failed_attempt = None;
        Ok(())
    }

    fn enforce_auto_lock(&self, state: &mut VaultState) {
        if let (Some(unlocked_at), Some(_)) = (state.unlock_time, state.key.as_ref()) {
            if unlocked_at.elapsed() > self.settings.auto_lock_timeout {
                info!("vault auto-locked after timeout");
                if let Some(mut key) = state.key.take() {
                    key.fill(0);
                }
                state.unlock_time = None;
            }
        }
    }

    fn current_key(&self) -> Result<[u8; KEY_SIZE], VaultError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.enforce_auto_lock(&mut state);
        state.key.ok_or(VaultError::Locked)
    }

    // ── Repository passwords ──────────────────────────────────────────────────

    pub fn store_repository_password(
        &self,
        repository_id: &str,
        password: &str,
    ) -> Result<(), VaultError> {
        if repository_id.is_empty() || password.is_empty() {
            return Err(VaultError::EmptyInput);
        }
        let result = self.mutate_document(|doc| {
            doc.repositories.insert(
                repository_id.to_string(),
                PasswordEntry { password: password.to_string(), meta: SecretMetadata::new() },
            );
            Ok(())
        });
        self.log_audit("store_repository_password", repository_id, result.is_ok(), "");
        result
    }

    /// Retrieve a repository password, bumping its access metadata in the
    /// same write as the read.
    pub fn get_repository_password(
        &self,
        repository_id: &str,
    ) -> Result<Option<String>, VaultError> {
        let mut found = None;
        let result = self.mutate_document(|doc| {
            if let Some(entry) = doc.repositories.get_mut(repository_id) {
                entry.meta.touch();
                found = Some(entry.password.clone());
            }
            Ok(())
        });
        match (&result, &found) {
            (Ok(()), Some(_)) => self.log_audit("get_repository_password", repository_id, true, ""),
            (Ok(()), None) => {
                self.log_audit("get_repository_password", repository_id, false, "not found")
            }
            (Err(e), _) => {
                self.log_audit("get_repository_password", repository_id, false, &e.to_string())
            }
        }
        result.map(|_| found)
    }

    /// Access metadata for a stored password, without bumping the counter.
    pub fn repository_password_info(
        &self,
        repository_id: &str,
    ) -> Result<Option<SecretMetadata>, VaultError> {
        let doc = self.load_document(&self.current_key()?)?;
        Ok(doc.repositories.get(repository_id).map(|e| e.meta.clone()))
    }

    pub fn list_repositories(&self) -> Result<Vec<String>, VaultError> {
        let doc = self.load_document(&self.current_key()?)?;
        Ok(doc.repositories.keys().cloned().collect())
    }

    pub fn remove_repository(&self, repository_id: &str) -> Result<bool, VaultError> {
        let mut removed = false;
        let result = self.mutate_document(|doc| {
            removed = doc.repositories.remove(repository_id).is_some();
            Ok(())
        });
        self.log_audit("remove_repository", repository_id, result.is_ok() && removed, "");
        result.map(|_| removed)
    }

    // ── Backend credentials ───────────────────────────────────────────────────

    /// Legacy global backend credentials, keyed by backend type only.
    pub fn store_backend_credentials(
        &self,
        backend_type: &str,
        credentials: BackendCredentials,
    ) -> Result<(), VaultError> {
        if backend_type.is_empty() {
            return Err(VaultError::EmptyInput);
        }
        let result = self.mutate_document(|doc| {
            doc.backends.insert(backend_type.to_string(), credentials);
            Ok(())
        });
        self.log_audit("store_backend_credentials", backend_type, result.is_ok(), "");
        result
    }

    pub fn get_backend_credentials(
        &self,
        backend_type: &str,
    ) -> Result<BackendCredentials, VaultError> {
        let doc = self.load_document(&self.current_key()?)?;
        Ok(doc.backends.get(backend_type).cloned().unwrap_or_default())
    }

    pub fn store_repository_backend_credentials(
        &self,
        repository_id: &str,
        backend_type: &str,
        credentials: BackendCredentials,
    ) -> Result<(), VaultError> {
        if repository_id.is_empty() || backend_type.is_empty() {
            return Err(VaultError::EmptyInput);
        }
        let audit_key = format!("{}:{}", repository_id, backend_type);
        let result = self.mutate_document(|doc| {
            doc.repository_backends
                .entry(repository_id.to_string())
                .or_default()
                .insert(
                    backend_type.to_string(),
                    BackendEntry { credentials, meta: SecretMetadata::new() },
                );
            Ok(())
        });
        self.log_audit("store_repository_backend_credentials", &audit_key, result.is_ok(), "");
        result
    }

    pub fn get_repository_backend_credentials(
        &self,
        repository_id: &str,
        backend_type: &str,
    ) -> Result<BackendCredentials, VaultError> {
        let audit_key = format!("{}:{}", repository_id, backend_type);
        let mut found = BackendCredentials::default();
        let result = self.mutate_document(|doc| {
            if let Some(entry) = doc
                .repository_backends
                .get_mut(repository_id)
                .and_then(|backends| backends.get_mut(backend_type))
            {
                entry.meta.touch();
                found = entry.credentials.clone();
            }
            Ok(())
        });
        self.log_audit(
            "get_repository_backend_credentials",
            &audit_key,
            result.is_ok() && !found.is_empty(),
            "",
        );
        result.map(|_| found)
    }

    pub fn remove_repository_backend_credentials(
        &self,
        repository_id: &str,
        backend_type: &str,
    ) -> Result<bool, VaultError> {
        let audit_key = format!("{}:{}", repository_id, backend_type);
        let mut removed = false;
        let result = self.mutate_document(|doc| {
            if let Some(backends) = doc.repository_backends.get_mut(repository_id) {
                removed = backends.remove(backend_type).is_some();
                if backends.is_empty() {
                    doc.repository_backends.remove(repository_id);
                }
            }
            Ok(())
        });
        self.log_audit(
            "remove_repository_backend_credentials",
            &audit_key,
            result.is_ok() && removed,
            "",
        );
        result.map(|_| removed)
    }

    /// Existence probe. Never errors: a locked vault simply reports false.
    pub fn has_repository_backend_credentials(
        &self,
        repository_id: &str,
        backend_type: &str,
    ) -> bool {
        let Ok(key) = self.current_key() else {
            return false;
        };
        match self.load_document(&key) {
            Ok(doc) => doc
                .repository_backends
                .get(repository_id)
                .map(|backends| backends.contains_key(backend_type))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // ── Master password rotation ──────────────────────────────────────────────

    /// Re-encrypt the store under a new master password and a fresh salt.
    pub fn change_master_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), VaultError> {
        if new_password.is_empty() {
            return Err(VaultError::EmptyInput);
        }
        self.unlock(old_password)?;

        let _guard = VaultLock::acquire(&self.dir)?;
        let doc = self.load_document(&self.current_key()?)?;

        let new_salt = crypto::random_salt();
        let salt_file = self.dir.join(SALT_FILE);
        std::fs::write(&salt_file, new_salt).map_err(|e| self.io_err(&salt_file, e))?;

        let new_key = crypto::derive_key(new_password, &new_salt);
        self.save_document(&new_key, &doc)?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.key = Some(new_key);
        state.unlock_time = Some(Instant::now());
        drop(state);

        self.log_audit("change_master_password", "", true, "");
        Ok(())
    }

    // ── Document I/O ──────────────────────────────────────────────────────────

    /// Run one locked load-modify-save cycle against the decrypted document.
    fn mutate_document(
        &self,
        mutate: impl FnOnce(&mut VaultDocument) -> Result<(), VaultError>,
    ) -> Result<(), VaultError> {
        let key = self.current_key()?;
        let _guard = VaultLock::acquire(&self.dir)?;
        let mut doc = self.load_document(&key)?;
        mutate(&mut doc)?;
        self.save_document(&key, &doc)
    }

    fn load_document(&self, key: &[u8; KEY_SIZE]) -> Result<VaultDocument, VaultError> {
        let credentials_file = self.dir.join(CREDENTIALS_FILE);
        if !credentials_file.exists() {
            return Ok(VaultDocument::default());
        }
        let container = std::fs::read_to_string(&credentials_file)
            .map_err(|e| self.io_err(&credentials_file, e))?;
        let plaintext = crypto::decrypt(key, &container)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Manager(format!("corrupt vault document: {}", e)))
    }

    fn save_document(
        &self,
        key: &[u8; KEY_SIZE],
        doc: &VaultDocument,
    ) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(doc)
            .map_err(|e| VaultError::Manager(format!("serialize vault document: {}", e)))?;
        let container = crypto::encrypt(key, &plaintext)?;
        let credentials_file = self.dir.join(CREDENTIALS_FILE);
        std::fs::write(&credentials_file, container)
            .map_err(|e| self.io_err(&credentials_file, e))
    }

    fn get_or_create_salt(&self) -> Result<[u8; SALT_SIZE], VaultError> {
        let salt_file = self.dir.join(SALT_FILE);
        if salt_file.exists() {
            let bytes = std::fs::read(&salt_file).map_err(|e| self.io_err(&salt_file, e))?;
            let salt: [u8; SALT_SIZE] = bytes
                .try_into()
                .map_err(|_| VaultError::Security("salt file has wrong length".into()))?;
            Ok(salt)
        } else {
            let salt = crypto::random_salt();
            std::fs::write(&salt_file, salt).map_err(|e| self.io_err(&salt_file, e))?;
            Ok(salt)
        }
    }

    // ── Audit ─────────────────────────────────────────────────────────────────

    fn init_audit_log(&self) {
        let audit = self.dir.join(AUDIT_LOG);
        if audit.exists() {
            return;
        }
        let header = format!(
            "# TimeLocker credential audit log\n# initialized: {}\n# format: timestamp|operation|credential_id|success|details\n",
            Utc::now().to_rfc3339()
        );
        if let Err(e) = std::fs::write(&audit, header) {
            warn!(path = %audit.display(), error = %e, "could not initialize audit log");
        }
    }

    /// Audit lines never fail an operation.
    fn log_audit(&self, operation: &str, credential_id: &str, success: bool, details: &str) {
        let line = format!(
            "{}|{}|{}|{}|{}\n",
            Utc::now().to_rfc3339(),
            operation,
            credential_id,
            success,
            details
        );
        append_line(&self.dir.join(AUDIT_LOG), &line);
    }

    fn log_access(&self, operation: &str, success: bool, details: &str) {
        let line = format!(
            "{}|{}|{}|{}\n",
            Utc::now().to_rfc3339(),
            operation,
            success,
            details
        );
        append_line(&self.dir.join(ACCESS_LOG), &line);
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> VaultError {
        VaultError::Io { path: path.display().to_string(), source }
    }
}

fn unlock_kind(is_auto: bool) -> &'static str {
    if is_auto {
        "auto_unlock"
    } else {
        "manual_unlock"
    }
}

fn append_line(path: &Path, line: &str) {
    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not append log line");
    }
}

fn prompt_password() -> Option<String> {
    use std::io::Write;
    eprint!("TimeLocker master password: ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
