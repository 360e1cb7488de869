pub mod error;
pub mod paths;
pub mod schema;
pub mod store;
pub mod validate;

pub use error::ConfigError;
pub use paths::{is_elevated, AppPaths};
pub use schema::{
    BackupConfig, Config, GeneralConfig, MonitoringConfig, NotificationsConfig, RestoreConfig,
    SecurityConfig, UiConfig,
};
pub use store::{deep_merge, ConfigStore};
pub use validate::{validate_config, validate_cron, ValidationReport};
