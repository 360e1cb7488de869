use thiserror::Error;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("no repository named '{0}' and the value is not a repository uri")]
    UnknownRepository(String),

    #[error("emergency lockdown is active; clear it before running operations")]
    LockdownActive,

    #[error("no credential vault attached")]
    NoVault,

    #[error(transparent)]
    Config(#[from] timelocker_config::ConfigError),

    #[error(transparent)]
    Repo(#[from] timelocker_repo::RepoError),

    #[error(transparent)]
    Vault(#[from] timelocker_vault::VaultError),

    #[error(transparent)]
    Security(#[from] timelocker_security::SecurityError),

    #[error(transparent)]
    Orchestrator(#[from] timelocker_orchestrator::OrchestratorError),
}
