pub mod crypto;
pub mod error;
pub mod fingerprint;
pub mod lockfile;
pub mod vault;

pub use error::VaultError;
pub use fingerprint::{auto_master_key, system_fingerprint};
pub use lockfile::VaultLock;
pub use vault::{CredentialVault, SecretMetadata, VaultSettings};
