use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use timelocker_domain::{BackupTargetDescriptor, ConflictResolution, RepositoryDescriptor};

// Every section keeps a flattened `extra` map so keys this version does not
// know about survive a load/save round-trip.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub app_name: String,
    /// One of: trace, debug, info, warn, error (case-insensitive).
    pub log_level: String,
    pub default_repository: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: "TimeLocker".into(),
            log_level: "info".into(),
            default_repository: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// One of: auto, off, max.
    pub compression: String,
    pub exclude_caches: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: f64,
    pub backoff_multiplier: f64,
    pub max_concurrent_backups: usize,
    pub verify_after_backup: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression: "auto".into(),
            exclude_caches: true,
            max_retries: 3,
            retry_delay_seconds: 1.0,
            backoff_multiplier: 2.0,
            max_concurrent_backups: 2,
            verify_after_backup: true,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub verify_after_restore: bool,
    pub create_target_directory: bool,
    pub preserve_permissions: bool,
    pub conflict_resolution: ConflictResolution,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            verify_after_restore: true,
            create_target_directory: true,
            preserve_permissions: true,
            conflict_resolution: ConflictResolution::Skip,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub audit_logging: bool,
    /// Refuse to back up into repositories without a password when set.
    /// Default is permissive: log a high-severity event and continue.
    pub strict_unencrypted: bool,
    pub auto_lock_timeout_seconds: u64,
    pub max_failed_unlock_attempts: u32,
    pub lockout_duration_seconds: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            audit_logging: true,
            strict_unencrypted: false,
            auto_lock_timeout_seconds: 1800,
            max_failed_unlock_attempts: 5,
            lockout_duration_seconds: 300,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub color: bool,
    pub progress: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { color: true, progress: true, extra: Map::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub email: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_success: false,
            notify_on_failure: true,
            email: None,
            smtp_server: None,
            smtp_port: 587,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub status_retention_days: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { metrics_enabled: false, status_retention_days: 30, extra: Map::new() }
    }
}

/// The single configuration document: typed sections plus the repository and
/// backup-target indexes. Maps are ordered so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub security: SecurityConfig,
    pub ui: UiConfig,
    pub notifications: NotificationsConfig,
    pub monitoring: MonitoringConfig,
    pub repositories: BTreeMap<String, RepositoryDescriptor>,
    pub backup_targets: BTreeMap<String, BackupTargetDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Config {
    /// Apply the documented environment overrides on top of the loaded
    /// document: `TIMELOCKER_COMPRESSION`, `TIMELOCKER_EXCLUDE_CACHES`,
    /// `TIMELOCKER_METRICS_ENABLED`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(&|key| std::env::var(key).ok());
    }

    /// Override application with an injectable lookup, for tests.
    pub fn apply_env_overrides_from(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(compression) = lookup("TIMELOCKER_COMPRESSION") {
            if !compression.is_empty() {
                self.backup.compression = compression.to_lowercase();
            }
        }
        if let Some(value) = lookup("TIMELOCKER_EXCLUDE_CACHES") {
            if let Some(flag) = parse_bool(&value) {
                self.backup.exclude_caches = flag;
            }
        }
        if let Some(value) = lookup("TIMELOCKER_METRICS_ENABLED") {
            if let Some(flag) = parse_bool(&value) {
                self.monitoring.metrics_enabled = flag;
            }
        }
    }

    /// Mirror the legacy `settings.default_repository` alias into
    /// `general.default_repository`. Applied on save so documents written by
    /// old versions keep selecting the same repository.
    pub fn apply_legacy_aliases(&mut self) {
        if self.general.default_repository.is_some() {
            return;
        }
        let legacy = self
            .extra
            .get("settings")
            .and_then(|s| s.get("default_repository"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(name) = legacy {
            self.general.default_repository = Some(name);
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_apply_to_known_keys() {
        let mut config = Config::default();
        let lookup = |key: &str| -> Option<String> {
            match key {
                "TIMELOCKER_COMPRESSION" => Some("max".into()),
                "TIMELOCKER_EXCLUDE_CACHES" => Some("false".into()),
                "TIMELOCKER_METRICS_ENABLED" => Some("1".into()),
                _ => None,
            }
        };
        config.apply_env_overrides_from(&lookup);
        assert_eq!(config.backup.compression, "max");
        assert!(!config.backup.exclude_caches);
        assert!(config.monitoring.metrics_enabled);
    }

    #[test]
    fn unparsable_env_flags_are_ignored() {
        let mut config = Config::default();
        let lookup = |key: &str| -> Option<String> {
            (key == "TIMELOCKER_EXCLUDE_CACHES").then(|| "maybe".to_string())
        };
        config.apply_env_overrides_from(&lookup);
        assert!(config.backup.exclude_caches);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.backup.max_retries, 3);
        assert_eq!(config.backup.retry_delay_seconds, 1.0);
        assert_eq!(config.backup.backoff_multiplier, 2.0);
        assert_eq!(config.backup.max_concurrent_backups, 2);
        assert_eq!(config.security.auto_lock_timeout_seconds, 1800);
        assert_eq!(config.security.lockout_duration_seconds, 300);
        assert_eq!(config.monitoring.status_retention_days, 30);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let doc = r#"{
            "general": {"log_level": "debug", "future_flag": true},
            "custom_section": {"a": 1}
        }"#;
        let config: Config = serde_json::from_str(doc).unwrap();
        assert_eq!(config.general.extra["future_flag"], Value::Bool(true));
        assert_eq!(config.extra["custom_section"]["a"], Value::from(1));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["general"]["future_flag"], Value::Bool(true));
        assert_eq!(json["custom_section"]["a"], Value::from(1));
    }

    #[test]
    fn document_round_trip_is_lossless() {
        let mut config = Config::default();
        config.repositories.insert(
            "demo".into(),
            RepositoryDescriptor::new("demo", "file:///tmp/r"),
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn legacy_settings_alias_is_mirrored() {
        let doc = r#"{"settings": {"default_repository": "old-main"}}"#;
        let mut config: Config = serde_json::from_str(doc).unwrap();
        config.apply_legacy_aliases();
        assert_eq!(config.general.default_repository.as_deref(), Some("old-main"));
    }

    #[test]
    fn explicit_default_repository_wins_over_alias() {
        let doc = r#"{
            "general": {"default_repository": "new-main"},
            "settings": {"default_repository": "old-main"}
        }"#;
        let mut config: Config = serde_json::from_str(doc).unwrap();
        config.apply_legacy_aliases();
        assert_eq!(config.general.default_repository.as_deref(), Some("new-main"));
    }
}
