use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use timelocker_domain::{BackendCredentials, BackendKind, RepositoryId};
use timelocker_engine::EngineRequest;
use timelocker_vault::CredentialVault;

use crate::backend::{BackendProvider, BackendRegistry};
use crate::error::RepoError;
use crate::uri::{parse_repository_uri, ParsedUri};

/// A live handle to one repository for the duration of a single
/// orchestrator call.
///
/// Handles are deliberately short-lived and never cached across operations:
/// credentials may rotate between calls, and the lazy environment cache
/// below only amortises lookups within one call.
pub struct Repository {
    name: Option<String>,
    uri: ParsedUri,
    id: RepositoryId,
    provider: Arc<dyn BackendProvider>,
    explicit_password: Option<String>,
    explicit_backend_credentials: Option<BackendCredentials>,
    vault: Option<Arc<CredentialVault>>,
    cached_env: Mutex<Option<HashMap<String, String>>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .field("id", &self.id)
            .field("provider", &self.provider.kind())
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Stable id: hex(sha256(uri))[..16] over the normalised URI.
    pub fn id(&self) -> &RepositoryId {
        &self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri.raw
    }

    pub fn kind(&self) -> BackendKind {
        self.provider.kind()
    }

    /// Location string for the engine's `-r` flag.
    pub fn engine_location(&self) -> &str {
        self.uri.engine_location()
    }

    /// Resolve the repository password: explicit argument → vault (only
    /// when already unlocked; resolution never unlocks) → environment
    /// (`TIMELOCKER_PASSWORD`, then the engine's own `RESTIC_PASSWORD`).
    pub fn resolve_password(&self) -> Option<String> {
        if let Some(password) = &self.explicit_password {
            return Some(password.clone());
        }
        if let Some(vault) = &self.vault {
            if !vault.is_locked() {
                match vault.get_repository_password(self.id.as_str()) {
                    Ok(Some(password)) => return Some(password),
                    Ok(None) => {}
                    Err(e) => debug!(repository_id = %self.id, error = %e, "vault password lookup failed"),
                }
            }
        }
        std::env::var("TIMELOCKER_PASSWORD")
            .or_else(|_| std::env::var("RESTIC_PASSWORD"))
            .ok()
            .filter(|p| !p.is_empty())
    }

    /// Backend environment variables, resolved lazily and cached for this
    /// handle. Chain: explicit credentials → vault by (repository id,
    /// backend type) → passthrough from the parent environment.
    pub fn backend_env(&self) -> HashMap<String, String> {
        let mut cached = self.cached_env.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(env) = cached.as_ref() {
            return env.clone();
        }

        let env = self.compute_backend_env();
        *cached = Some(env.clone());
        env
    }

    /// Drop the cached environment. Must be called when credentials rotate
    /// mid-session so the next engine invocation sees the new values.
    pub fn invalidate_env(&self) {
        let mut cached = self.cached_env.lock().unwrap_or_else(PoisonError::into_inner);
        *cached = None;
    }

    fn compute_backend_env(&self) -> HashMap<String, String> {
        if let Some(credentials) = &self.explicit_backend_credentials {
            return self.provider.credential_env(credentials);
        }

        if let Some(vault) = &self.vault {
            if !vault.is_locked() {
                match vault.get_repository_backend_credentials(
                    self.id.as_str(),
                    self.provider.kind().as_str(),
                ) {
                    Ok(credentials) if !credentials.is_empty() => {
                        return self.provider.credential_env(&credentials);
                    }
                    Ok(_) => {
                        // Fall back to legacy global credentials for this
                        // backend type.
                        if let Ok(credentials) =
                            vault.get_backend_credentials(self.provider.kind().as_str())
                        {
                            if !credentials.is_empty() {
                                return self.provider.credential_env(&credentials);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(repository_id = %self.id, error = %e, "vault backend lookup failed")
                    }
                }
            }
        }

        let mut env = HashMap::new();
        for key in self.provider.env_passthrough() {
            if let Ok(value) = std::env::var(key) {
                env.insert((*key).to_string(), value);
            }
        }
        env
    }

    /// Build an engine request against this repository with the password and
    /// backend environment applied. Fails when no password can be resolved.
    pub fn request(&self, subcommand: &str) -> Result<EngineRequest, RepoError> {
        let password = self
            .resolve_password()
            .ok_or_else(|| RepoError::MissingPassword(self.display_name()))?;
        let request = EngineRequest::new(subcommand)
            .repository(self.engine_location())
            .env("RESTIC_PASSWORD", password)
            .envs(&self.backend_env());
        Ok(request)
    }

    /// Like [`Repository::request`] but without a password, for commands
    /// that operate before a password exists.
    pub fn request_without_password(&self, subcommand: &str) -> EngineRequest {
        EngineRequest::new(subcommand)
            .repository(self.engine_location())
            .envs(&self.backend_env())
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.uri.raw.clone())
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Builds [`Repository`] handles from URIs. Owns the backend registry
/// and the optional vault reference used in credential resolution.
pub struct RepositoryFactory {
    registry: BackendRegistry,
    vault: Option<Arc<CredentialVault>>,
}

impl RepositoryFactory {
    pub fn new() -> Self {
        Self { registry: BackendRegistry::with_builtins(), vault: None }
    }

    pub fn with_vault(mut self, vault: Arc<CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn registry_mut(&mut self) -> &mut BackendRegistry {
        &mut self.registry
    }

    /// Parse, validate, and assemble a repository handle. Password and
    /// backend credentials are optional here; resolution falls back through
    /// the vault and the environment at use time.
    pub fn create_repository(
        &self,
        uri: &str,
        password: Option<String>,
        backend_credentials: Option<BackendCredentials>,
        name: Option<String>,
    ) -> Result<Repository, RepoError> {
        let parsed = parse_repository_uri(uri)?;
        let provider = self.registry.for_scheme(&parsed.scheme)?;
        provider.validate(&parsed)?;

        let id = RepositoryId::from_uri(&parsed.raw);
        debug!(uri = %parsed.raw, repository_id = %id, backend = %provider.kind(), "repository handle created");

        Ok(Repository {
            name,
            uri: parsed,
            id,
            provider,
            explicit_password: password,
            explicit_backend_credentials: backend_credentials,
            vault: self.vault.clone(),
            cached_env: Mutex::new(None),
        })
    }
}

impl Default for RepositoryFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests touching password env vars serialize on this to keep the
    // process-global environment consistent.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn factory() -> RepositoryFactory {
        RepositoryFactory::new()
    }

    #[test]
    fn creates_local_repository_from_file_uri() {
        let repo = factory()
            .create_repository("file:///tmp/r", Some("pw".into()), None, Some("demo".into()))
            .unwrap();
        assert_eq!(repo.kind(), BackendKind::Local);
        assert_eq!(repo.engine_location(), "/tmp/r");
        assert_eq!(repo.name(), Some("demo"));
    }

    #[test]
    fn repository_id_matches_sha256_prefix() {
        let repo = factory()
            .create_repository("file:///tmp/r", None, None, None)
            .unwrap();
        assert_eq!(repo.id(), &RepositoryId::from_uri("file:///tmp/r"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            factory().create_repository("ftp://host/path", None, None, None),
            Err(RepoError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn invalid_backend_uri_is_rejected() {
        assert!(matches!(
            factory().create_repository("s3:hostonly", None, None, None),
            Err(RepoError::InvalidUri { .. })
        ));
    }

    #[test]
    fn explicit_password_wins() {
        let _env = ENV_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        std::env::set_var("TIMELOCKER_PASSWORD", "from-env");
        let repo = factory()
            .create_repository("file:///tmp/r", Some("explicit".into()), None, None)
            .unwrap();
        assert_eq!(repo.resolve_password().as_deref(), Some("explicit"));
        std::env::remove_var("TIMELOCKER_PASSWORD");
    }

    #[test]
    fn environment_password_fallback_order() {
        let _env = ENV_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        std::env::remove_var("TIMELOCKER_PASSWORD");
        std::env::set_var("RESTIC_PASSWORD", "engine-env");
        let repo = factory()
            .create_repository("file:///tmp/r", None, None, None)
            .unwrap();
        assert_eq!(repo.resolve_password().as_deref(), Some("engine-env"));

        std::env::set_var("TIMELOCKER_PASSWORD", "tl-env");
        assert_eq!(repo.resolve_password().as_deref(), Some("tl-env"));
        std::env::remove_var("TIMELOCKER_PASSWORD");
        std::env::remove_var("RESTIC_PASSWORD");
    }

    #[test]
    fn vault_password_is_used_when_unlocked() {
        let _env = ENV_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        let tmp = tempfile::tempdir().unwrap();
        let vault = Arc::new(CredentialVault::new(tmp.path()));
        vault.unlock("master").unwrap();

        let id = RepositoryId::from_uri("file:///tmp/r");
        vault.store_repository_password(id.as_str(), "vaulted").unwrap();

        let repo = RepositoryFactory::new()
            .with_vault(vault.clone())
            .create_repository("file:///tmp/r", None, None, None)
            .unwrap();
        assert_eq!(repo.resolve_password().as_deref(), Some("vaulted"));

        // Locked vault: resolution silently skips it.
        vault.lock();
        std::env::remove_var("TIMELOCKER_PASSWORD");
        std::env::remove_var("RESTIC_PASSWORD");
        assert_eq!(repo.resolve_password(), None);
    }

    #[test]
    fn missing_password_fails_request_with_named_repository() {
        let _env = ENV_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        std::env::remove_var("TIMELOCKER_PASSWORD");
        std::env::remove_var("RESTIC_PASSWORD");
        let repo = factory()
            .create_repository("file:///tmp/r", None, None, Some("demo".into()))
            .unwrap();
        match repo.request("check") {
            Err(RepoError::MissingPassword(name)) => assert_eq!(name, "demo"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn backend_env_is_cached_until_invalidated() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = Arc::new(CredentialVault::new(tmp.path()));
        vault.unlock("master").unwrap();

        let id = RepositoryId::from_uri("s3:host/bucket");
        let mut creds = BackendCredentials::new();
        creds.insert("access_key_id".into(), "AKIA-first".into());
        creds.insert("secret_access_key".into(), "s1".into());
        vault
            .store_repository_backend_credentials(id.as_str(), "s3", creds)
            .unwrap();

        let repo = RepositoryFactory::new()
            .with_vault(vault.clone())
            .create_repository("s3:host/bucket", Some("pw".into()), None, None)
            .unwrap();
        assert_eq!(
            repo.backend_env().get("AWS_ACCESS_KEY_ID").map(String::as_str),
            Some("AKIA-first")
        );

        // Rotate credentials; the stale cache answers until invalidated.
        let mut rotated = BackendCredentials::new();
        rotated.insert("access_key_id".into(), "AKIA-second".into());
        rotated.insert("secret_access_key".into(), "s2".into());
        vault
            .store_repository_backend_credentials(id.as_str(), "s3", rotated)
            .unwrap();
        assert_eq!(
            repo.backend_env().get("AWS_ACCESS_KEY_ID").map(String::as_str),
            Some("AKIA-first")
        );

        repo.invalidate_env();
        assert_eq!(
            repo.backend_env().get("AWS_ACCESS_KEY_ID").map(String::as_str),
            Some("AKIA-second")
        );
    }

    #[test]
    fn legacy_global_backend_credentials_are_a_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = Arc::new(CredentialVault::new(tmp.path()));
        vault.unlock("master").unwrap();

        let mut creds = BackendCredentials::new();
        creds.insert("account_id".into(), "global-id".into());
        creds.insert("account_key".into(), "global-key".into());
        vault.store_backend_credentials("b2", creds).unwrap();

        let repo = RepositoryFactory::new()
            .with_vault(vault)
            .create_repository("b2:bucket", Some("pw".into()), None, None)
            .unwrap();
        assert_eq!(
            repo.backend_env().get("B2_ACCOUNT_ID").map(String::as_str),
            Some("global-id")
        );
    }
}
