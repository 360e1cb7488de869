use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use timelocker_domain::{BackupTargetDescriptor, RepositoryDescriptor};

use crate::error::ConfigError;
use crate::paths::AppPaths;
use crate::schema::Config;
use crate::validate::validate_config;

const BACKUPS_DIR: &str = "config_backups";
const BACKUPS_KEPT: usize = 10;

#[derive(Default)]
struct Cached {
    config: Option<Config>,
    mtime: Option<SystemTime>,
}

/// Persistent store for the configuration document.
///
/// One JSON file plus an optional project overlay. The parsed document is
/// cached behind a mutex; the file's mtime is checked before every read so an
/// external rewrite invalidates the cache.
pub struct ConfigStore {
    config_file: PathBuf,
    backups_dir: PathBuf,
    overlay_file: Option<PathBuf>,
    inner: Mutex<Cached>,
}

impl ConfigStore {
    /// Store rooted at `config_dir`, picking up `./.timelocker/config.json`
    /// as the project overlay when present.
    pub fn new(config_dir: &Path) -> Self {
        Self::with_overlay(config_dir, AppPaths::project_overlay())
    }

    pub fn with_overlay(config_dir: &Path, overlay_file: Option<PathBuf>) -> Self {
        Self {
            config_file: config_dir.join("config.json"),
            backups_dir: config_dir.join(BACKUPS_DIR),
            overlay_file,
            inner: Mutex::new(Cached::default()),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    // ── Load / save ───────────────────────────────────────────────────────────

    /// Current document. Served from cache unless the file changed on disk
    /// since it was read.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut cached = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let disk_mtime = file_mtime(&self.config_file);
        if let Some(config) = &cached.config {
            if cached.mtime == disk_mtime {
                return Ok(config.clone());
            }
            debug!(path = %self.config_file.display(), "config changed on disk, reloading");
        }

        let config = self.read_document()?;
        cached.config = Some(config.clone());
        cached.mtime = disk_mtime;
        Ok(config)
    }

    /// Drop the cache and re-read from disk.
    pub fn reload_configuration(&self) -> Result<Config, ConfigError> {
        {
            let mut cached = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            cached.config = None;
            cached.mtime = None;
        }
        self.load()
    }

    /// Validate and persist the document. The previous file is copied into
    /// `config_backups/` first; only the newest ten backups are retained.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let report = validate_config(config);
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        if !report.is_valid() {
            return Err(ConfigError::InvalidConfiguration(report.errors.join("; ")));
        }

        let mut config = config.clone();
        config.apply_legacy_aliases();

        if self.config_file.exists() {
            self.backup_current_file()?;
        }

        if let Some(parent) = self.config_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| json_err(&self.config_file, e))?;
        std::fs::write(&self.config_file, json).map_err(|e| io_err(&self.config_file, e))?;

        let mut cached = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        cached.mtime = file_mtime(&self.config_file);
        cached.config = Some(config);
        Ok(())
    }

    /// Write the built-in defaults, preserving the previous file as a
    /// timestamped backup.
    pub fn reset_to_defaults(&self) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        self.save(&defaults)?;
        info!(path = %self.config_file.display(), "configuration reset to defaults");
        Ok(defaults)
    }

    pub fn export(&self, path: &Path) -> Result<(), ConfigError> {
        let config = self.load()?;
        let json = serde_json::to_string_pretty(&config).map_err(|e| json_err(path, e))?;
        std::fs::write(path, json).map_err(|e| io_err(path, e))
    }

    pub fn import(&self, path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let config: Config = serde_json::from_str(&content).map_err(|e| json_err(path, e))?;
        self.save(&config)?;
        Ok(config)
    }

    // ── Sections ──────────────────────────────────────────────────────────────

    /// A section of the document as raw JSON, by top-level key.
    pub fn get_section(&self, name: &str) -> Result<Value, ConfigError> {
        let config = self.load()?;
        let doc = serde_json::to_value(&config).map_err(|e| json_err(&self.config_file, e))?;
        doc.get(name)
            .cloned()
            .ok_or_else(|| ConfigError::InvalidConfiguration(format!("no section named '{}'", name)))
    }

    /// Merge `values` into the named section and persist.
    pub fn update_section(&self, name: &str, values: Map<String, Value>) -> Result<(), ConfigError> {
        let config = self.load()?;
        let mut doc = serde_json::to_value(&config).map_err(|e| json_err(&self.config_file, e))?;

        let section = doc
            .as_object_mut()
            .expect("config serializes to an object")
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        deep_merge(section, &Value::Object(values));

        let updated: Config =
            serde_json::from_value(doc).map_err(|e| json_err(&self.config_file, e))?;
        self.save(&updated)
    }

    // ── Repositories ──────────────────────────────────────────────────────────

    pub fn get_repository(&self, name: &str) -> Result<RepositoryDescriptor, ConfigError> {
        self.load()?
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::RepositoryNotFound(name.to_string()))
    }

    pub fn add_repository(&self, descriptor: RepositoryDescriptor) -> Result<(), ConfigError> {
        RepositoryDescriptor::validate_name(&descriptor.name)?;
        let mut config = self.load()?;
        if config.repositories.contains_key(&descriptor.name) {
            return Err(ConfigError::RepositoryExists(descriptor.name));
        }
        config.repositories.insert(descriptor.name.clone(), descriptor);
        self.save(&config)
    }

    /// Remove a repository. Refused while any backup target still references
    /// it, so the target index never dangles.
    pub fn remove_repository(&self, name: &str) -> Result<RepositoryDescriptor, ConfigError> {
        let mut config = self.load()?;
        if let Some(target) = config.backup_targets.values().find(|t| t.repository == name) {
            return Err(ConfigError::RepositoryInUse {
                repository: name.to_string(),
                target: target.name.clone(),
            });
        }
        let removed = config
            .repositories
            .remove(name)
            .ok_or_else(|| ConfigError::RepositoryNotFound(name.to_string()))?;
        if config.general.default_repository.as_deref() == Some(name) {
            config.general.default_repository = None;
        }
        self.save(&config)?;
        Ok(removed)
    }

    pub fn set_default_repository(&self, name: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        if !config.repositories.contains_key(name) {
            return Err(ConfigError::RepositoryNotFound(name.to_string()));
        }
        config.general.default_repository = Some(name.to_string());
        self.save(&config)
    }

    // ── Backup targets ────────────────────────────────────────────────────────

    pub fn get_target(&self, name: &str) -> Result<BackupTargetDescriptor, ConfigError> {
        self.load()?
            .backup_targets
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::TargetNotFound(name.to_string()))
    }

    pub fn add_target(&self, descriptor: BackupTargetDescriptor) -> Result<(), ConfigError> {
        BackupTargetDescriptor::validate_name(&descriptor.name)?;
        let mut config = self.load()?;
        if config.backup_targets.contains_key(&descriptor.name) {
            return Err(ConfigError::TargetExists(descriptor.name));
        }
        if !config.repositories.contains_key(&descriptor.repository) {
            return Err(ConfigError::RepositoryNotFound(descriptor.repository));
        }
        config.backup_targets.insert(descriptor.name.clone(), descriptor);
        self.save(&config)
    }

    pub fn remove_target(&self, name: &str) -> Result<BackupTargetDescriptor, ConfigError> {
        let mut config = self.load()?;
        let removed = config
            .backup_targets
            .remove(name)
            .ok_or_else(|| ConfigError::TargetNotFound(name.to_string()))?;
        self.save(&config)?;
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn read_document(&self) -> Result<Config, ConfigError> {
        let mut doc = if self.config_file.exists() {
            let content = std::fs::read_to_string(&self.config_file)
                .map_err(|e| io_err(&self.config_file, e))?;
            serde_json::from_str::<Value>(&content).map_err(|e| json_err(&self.config_file, e))?
        } else {
            debug!(path = %self.config_file.display(), "no config file, starting from defaults");
            serde_json::to_value(Config::default()).map_err(|e| json_err(&self.config_file, e))?
        };

        if let Some(overlay_path) = &self.overlay_file {
            if overlay_path.exists() {
                let content =
                    std::fs::read_to_string(overlay_path).map_err(|e| io_err(overlay_path, e))?;
                let overlay: Value =
                    serde_json::from_str(&content).map_err(|e| json_err(overlay_path, e))?;
                debug!(path = %overlay_path.display(), "merging project overlay");
                deep_merge(&mut doc, &overlay);
            }
        }

        let mut config: Config =
            serde_json::from_value(doc).map_err(|e| json_err(&self.config_file, e))?;
        config.apply_env_overrides();

        let report = validate_config(&config);
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        if !report.is_valid() {
            return Err(ConfigError::InvalidConfiguration(report.errors.join("; ")));
        }
        Ok(config)
    }

    fn backup_current_file(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.backups_dir).map_err(|e| io_err(&self.backups_dir, e))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f").to_string();
        let mut backup_path = self.backups_dir.join(format!("config_backup_{}.json", stamp));
        let mut serial = 1u32;
        while backup_path.exists() {
            backup_path = self
                .backups_dir
                .join(format!("config_backup_{}_{:02}.json", stamp, serial));
            serial += 1;
        }
        std::fs::copy(&self.config_file, &backup_path).map_err(|e| io_err(&backup_path, e))?;
        self.prune_backups();
        Ok(())
    }

    /// Keep only the newest backups. Backup names embed a sortable
    /// timestamp, so lexicographic order is chronological.
    fn prune_backups(&self) {
        let Ok(entries) = std::fs::read_dir(&self.backups_dir) else {
            return;
        };
        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("config_backup_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > BACKUPS_KEPT {
            let oldest = backups.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %e, "could not prune config backup");
            }
        }
    }
}

/// Recursively merge `overlay` into `base`: objects merge key-wise, anything
/// else (arrays included) replaces wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn io_err(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io { path: path.display().to_string(), source }
}

fn json_err(path: &Path, source: serde_json::Error) -> ConfigError {
    ConfigError::Json { path: path.display().to_string(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::with_overlay(dir, None)
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let config = store.load().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut config = Config::default();
        config.general.log_level = "debug".into();
        config.repositories.insert(
            "demo".into(),
            RepositoryDescriptor::new("demo", "file:///tmp/r"),
        );
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn add_then_remove_repository_restores_prior_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&Config::default()).unwrap();
        let before = store.load().unwrap().repositories;

        store
            .add_repository(RepositoryDescriptor::new("demo", "file:///tmp/r"))
            .unwrap();
        assert!(store.get_repository("demo").is_ok());

        store.remove_repository("demo").unwrap();
        assert_eq!(store.load().unwrap().repositories, before);
    }

    #[test]
    fn get_unknown_repository_fails_with_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(matches!(
            store.get_repository("ghost"),
            Err(ConfigError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn duplicate_repository_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .add_repository(RepositoryDescriptor::new("demo", "file:///tmp/r"))
            .unwrap();
        assert!(matches!(
            store.add_repository(RepositoryDescriptor::new("demo", "file:///tmp/other")),
            Err(ConfigError::RepositoryExists(_))
        ));
    }

    #[test]
    fn repository_referenced_by_target_cannot_be_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .add_repository(RepositoryDescriptor::new("demo", "file:///tmp/r"))
            .unwrap();
        store
            .add_target(BackupTargetDescriptor::new("docs", "demo", vec![tmp.path().into()]))
            .unwrap();
        assert!(matches!(
            store.remove_repository("demo"),
            Err(ConfigError::RepositoryInUse { .. })
        ));
    }

    #[test]
    fn target_requires_existing_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(matches!(
            store.add_target(BackupTargetDescriptor::new("docs", "ghost", vec![tmp.path().into()])),
            Err(ConfigError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn save_rotates_backups_and_keeps_ten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        for i in 0..13 {
            let mut config = Config::default();
            config.general.log_level = if i % 2 == 0 { "info" } else { "debug" }.into();
            store.save(&config).unwrap();
        }
        let backups = std::fs::read_dir(tmp.path().join(BACKUPS_DIR))
            .unwrap()
            .count();
        assert_eq!(backups, BACKUPS_KEPT);
    }

    #[test]
    fn external_rewrite_invalidates_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&Config::default()).unwrap();
        store.load().unwrap();

        // Rewrite behind the store's back, with a different mtime.
        let mut external = Config::default();
        external.general.log_level = "warn".into();
        let json = serde_json::to_string_pretty(&external).unwrap();
        std::fs::write(tmp.path().join("config.json"), json).unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(tmp.path().join("config.json"))
            .unwrap();
        file.set_modified(past).unwrap();

        assert_eq!(store.load().unwrap().general.log_level, "warn");
    }

    #[test]
    fn project_overlay_wins_over_user_document() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay_path = tmp.path().join("overlay.json");
        std::fs::write(
            &overlay_path,
            r#"{"general": {"log_level": "debug"}}"#,
        )
        .unwrap();

        let store = ConfigStore::with_overlay(tmp.path(), Some(overlay_path));
        let mut config = Config::default();
        config.general.log_level = "info".into();
        let json = serde_json::to_string_pretty(&config).unwrap();
        std::fs::write(tmp.path().join("config.json"), json).unwrap();

        assert_eq!(store.load().unwrap().general.log_level, "debug");
    }

    #[test]
    fn invalid_document_fails_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            r#"{"general": {"log_level": "loud"}}"#,
        )
        .unwrap();
        let store = store_in(tmp.path());
        assert!(matches!(store.load(), Err(ConfigError::InvalidConfiguration(_))));
    }

    #[test]
    fn update_section_merges_values() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&Config::default()).unwrap();

        let mut values = Map::new();
        values.insert("log_level".into(), json!("warn"));
        store.update_section("general", values).unwrap();

        assert_eq!(store.load().unwrap().general.log_level, "warn");
        // Untouched keys keep their defaults.
        assert_eq!(store.load().unwrap().general.app_name, "TimeLocker");
    }

    #[test]
    fn export_and_import() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .add_repository(RepositoryDescriptor::new("demo", "file:///tmp/r"))
            .unwrap();

        let exported = tmp.path().join("exported.json");
        store.export(&exported).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let other = store_in(other_dir.path());
        let imported = other.import(&exported).unwrap();
        assert!(imported.repositories.contains_key("demo"));
    }

    #[test]
    fn deep_merge_replaces_arrays_and_merges_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "list": [1, 2]});
        let overlay = json!({"a": {"y": 3}, "list": [9]});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "list": [9]}));
    }
}
