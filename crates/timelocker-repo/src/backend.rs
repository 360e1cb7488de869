use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use timelocker_domain::{BackendCredentials, BackendKind};

use crate::error::RepoError;
use crate::uri::ParsedUri;

/// One storage backend family: validates its URIs and maps vault
/// credentials onto the environment variables the engine reads.
///
/// Built-ins cover the engine's documented schemes; additional backends can
/// be registered at runtime without touching this crate.
pub trait BackendProvider: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// URI schemes this backend claims.
    fn schemes(&self) -> &'static [&'static str];

    /// Backend-specific URI validation, called after generic parsing.
    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError>;

    /// Map opaque credential keys to engine environment variables.
    /// Unknown keys are skipped with a debug log rather than passed through,
    /// so a typo in the vault can never leak into the child environment.
    fn credential_env(&self, credentials: &BackendCredentials) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for (key, value) in credentials {
            match self.env_mapping().iter().find(|(cred, _)| cred == key) {
                Some((_, var)) => {
                    env.insert((*var).to_string(), value.clone());
                }
                None => debug!(backend = %self.kind(), key = %key, "ignoring unmapped credential key"),
            }
        }
        env
    }

    /// (credential key, environment variable) pairs for this backend.
    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// Environment variables read from the parent process as the last
    /// resort of the credential resolution chain.
    fn env_passthrough(&self) -> &'static [&'static str] {
        &[]
    }
}

// ── Built-in providers ────────────────────────────────────────────────────────

fn require_host(uri: &ParsedUri, what: &str) -> Result<(), RepoError> {
    let host = uri.rest.split(['/', ':']).next().unwrap_or("");
    if host.is_empty() {
        return Err(RepoError::InvalidUri {
            uri: uri.raw.clone(),
            reason: format!("{} uri has no host component", what),
        });
    }
    Ok(())
}

fn require_rest(uri: &ParsedUri, reason: &str) -> Result<(), RepoError> {
    let rest = uri.rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(RepoError::InvalidUri { uri: uri.raw.clone(), reason: reason.to_string() });
    }
    Ok(())
}

pub struct LocalBackend;

impl BackendProvider for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["", "file", "local"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        if uri.rest.is_empty() {
            return Err(RepoError::InvalidUri {
                uri: uri.raw.clone(),
                reason: "local repository uri has no path".into(),
            });
        }
        Ok(())
    }
}

pub struct S3Backend;

impl BackendProvider for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["s3"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_host(uri, "s3")?;
        if uri.rest.split_once('/').map_or(true, |(_, bucket)| bucket.is_empty()) {
            return Err(RepoError::InvalidUri {
                uri: uri.raw.clone(),
                reason: "s3 uri needs the form s3:<host>/<bucket>[/prefix]".into(),
            });
        }
        Ok(())
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("access_key_id", "AWS_ACCESS_KEY_ID"),
            ("secret_access_key", "AWS_SECRET_ACCESS_KEY"),
            ("session_token", "AWS_SESSION_TOKEN"),
            ("region", "AWS_DEFAULT_REGION"),
            ("insecure_tls", "RESTIC_INSECURE_TLS"),
        ]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_SESSION_TOKEN", "AWS_DEFAULT_REGION"]
    }
}

pub struct B2Backend;

impl BackendProvider for B2Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::B2
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["b2"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_rest(uri, "b2 uri needs the form b2:<bucket>[/prefix]")
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[("account_id", "B2_ACCOUNT_ID"), ("account_key", "B2_ACCOUNT_KEY")]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["B2_ACCOUNT_ID", "B2_ACCOUNT_KEY"]
    }
}

pub struct SftpBackend;

impl BackendProvider for SftpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sftp
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["sftp"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_host(uri, "sftp")?;
        if !uri.rest.contains(':') {
            return Err(RepoError::InvalidUri {
                uri: uri.raw.clone(),
                reason: "sftp uri needs the form sftp:<user@host>:<path>".into(),
            });
        }
        Ok(())
    }
}

pub struct RestBackend;

impl BackendProvider for RestBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rest
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["rest"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        if !uri.rest.contains("://") {
            return Err(RepoError::InvalidUri {
                uri: uri.raw.clone(),
                reason: "rest uri needs the form rest:<url>".into(),
            });
        }
        Ok(())
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[("username", "RESTIC_REST_USERNAME"), ("password", "RESTIC_REST_PASSWORD")]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["RESTIC_REST_USERNAME", "RESTIC_REST_PASSWORD"]
    }
}

pub struct RcloneBackend;

impl BackendProvider for RcloneBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rclone
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["rclone"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_rest(uri, "rclone uri needs the form rclone:<remote>[:path]")
    }
}

pub struct SwiftBackend;

impl BackendProvider for SwiftBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Swift
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["swift"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_rest(uri, "swift uri needs a container name")
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("user", "OS_USERNAME"),
            ("password", "OS_PASSWORD"),
            ("auth_url", "OS_AUTH_URL"),
            ("tenant_name", "OS_TENANT_NAME"),
        ]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["OS_USERNAME", "OS_PASSWORD", "OS_AUTH_URL", "OS_TENANT_NAME"]
    }
}

pub struct AzureBackend;

impl BackendProvider for AzureBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["azure"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_rest(uri, "azure uri needs the form azure://<container>[/prefix]")
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("account_name", "AZURE_ACCOUNT_NAME"),
            ("account_key", "AZURE_ACCOUNT_KEY"),
            ("account_sas", "AZURE_ACCOUNT_SAS"),
        ]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["AZURE_ACCOUNT_NAME", "AZURE_ACCOUNT_KEY", "AZURE_ACCOUNT_SAS"]
    }
}

pub struct GcsBackend;

impl BackendProvider for GcsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gcs
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["gs"]
    }

    fn validate(&self, uri: &ParsedUri) -> Result<(), RepoError> {
        require_rest(uri, "gs uri needs the form gs://<bucket>[/prefix]")
    }

    fn env_mapping(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("project_id", "GOOGLE_PROJECT_ID"),
            ("application_credentials", "GOOGLE_APPLICATION_CREDENTIALS"),
        ]
    }

    fn env_passthrough(&self) -> &'static [&'static str] {
        &["GOOGLE_PROJECT_ID", "GOOGLE_APPLICATION_CREDENTIALS"]
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Dispatches a URI scheme to its [`BackendProvider`].
///
/// Built-ins self-register in [`BackendRegistry::with_builtins`]; further
/// backends may be registered at runtime.
pub struct BackendRegistry {
    providers: HashMap<&'static str, Arc<dyn BackendProvider>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(LocalBackend));
        registry.register(Arc::new(S3Backend));
        registry.register(Arc::new(B2Backend));
        registry.register(Arc::new(SftpBackend));
        registry.register(Arc::new(RestBackend));
        registry.register(Arc::new(RcloneBackend));
        registry.register(Arc::new(SwiftBackend));
        registry.register(Arc::new(AzureBackend));
        registry.register(Arc::new(GcsBackend));
        registry
    }

    /// Register a provider for every scheme it claims. Later registrations
    /// win, so a caller can override a built-in.
    pub fn register(&mut self, provider: Arc<dyn BackendProvider>) -> &mut Self {
        for scheme in provider.schemes() {
            self.providers.insert(scheme, provider.clone());
        }
        self
    }

    pub fn for_scheme(&self, scheme: &str) -> Result<Arc<dyn BackendProvider>, RepoError> {
        self.providers
            .get(scheme)
            .cloned()
            .ok_or_else(|| RepoError::UnsupportedScheme(scheme.to_string()))
    }

    pub fn registered_schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.providers.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::parse_repository_uri;

    #[test]
    fn builtins_cover_documented_schemes() {
        let registry = BackendRegistry::with_builtins();
        for scheme in ["", "file", "local", "s3", "b2", "sftp", "rest", "rclone", "swift", "azure", "gs"] {
            assert!(registry.for_scheme(scheme).is_ok(), "missing scheme {:?}", scheme);
        }
        assert!(matches!(
            registry.for_scheme("ftp"),
            Err(RepoError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn runtime_registration_overrides() {
        struct Custom;
        impl BackendProvider for Custom {
            fn kind(&self) -> BackendKind {
                BackendKind::Rest
            }
            fn schemes(&self) -> &'static [&'static str] {
                &["rest"]
            }
            fn validate(&self, _uri: &ParsedUri) -> Result<(), RepoError> {
                Ok(())
            }
        }

        let mut registry = BackendRegistry::with_builtins();
        registry.register(Arc::new(Custom));
        let provider = registry.for_scheme("rest").unwrap();
        // The override accepts a uri the built-in would reject.
        let uri = parse_repository_uri("rest:not-a-url").unwrap();
        assert!(provider.validate(&uri).is_ok());
    }

    #[test]
    fn s3_requires_host_and_bucket() {
        let provider = S3Backend;
        assert!(provider.validate(&parse_repository_uri("s3:host/bucket").unwrap()).is_ok());
        assert!(provider.validate(&parse_repository_uri("s3:host").unwrap()).is_err());
        assert!(provider.validate(&parse_repository_uri("s3:host/").unwrap()).is_err());
    }

    #[test]
    fn sftp_requires_host_and_path() {
        let provider = SftpBackend;
        assert!(provider
            .validate(&parse_repository_uri("sftp:user@host:/srv/restic").unwrap())
            .is_ok());
        assert!(provider.validate(&parse_repository_uri("sftp:user@host").unwrap()).is_err());
    }

    #[test]
    fn s3_credential_env_mapping() {
        let provider = S3Backend;
        let mut creds = BackendCredentials::new();
        creds.insert("access_key_id".into(), "AKIA1".into());
        creds.insert("secret_access_key".into(), "shhh".into());
        creds.insert("region".into(), "eu-central-1".into());
        creds.insert("mystery_key".into(), "ignored".into());

        let env = provider.credential_env(&creds);
        assert_eq!(env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKIA1"));
        assert_eq!(env.get("AWS_SECRET_ACCESS_KEY").map(String::as_str), Some("shhh"));
        assert_eq!(env.get("AWS_DEFAULT_REGION").map(String::as_str), Some("eu-central-1"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn b2_credential_env_mapping() {
        let provider = B2Backend;
        let mut creds = BackendCredentials::new();
        creds.insert("account_id".into(), "id1".into());
        creds.insert("account_key".into(), "key1".into());
        let env = provider.credential_env(&creds);
        assert_eq!(env.get("B2_ACCOUNT_ID").map(String::as_str), Some("id1"));
        assert_eq!(env.get("B2_ACCOUNT_KEY").map(String::as_str), Some("key1"));
    }
}
