use std::str::FromStr;

use timelocker_domain::{
    uri_scheme, BackendKind, BackupTargetDescriptor, RepositoryDescriptor,
};

use crate::schema::Config;

/// Outcome of validating a configuration document. Errors block a save or
/// load; warnings are surfaced but never block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const COMPRESSION_MODES: &[&str] = &["auto", "off", "max"];

/// Validate the whole document: enum fields, numeric ranges, cron
/// expressions, e-mail shape, repository URIs, and cross-references from
/// backup targets to repositories.
pub fn validate_config(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !LOG_LEVELS.contains(&config.general.log_level.to_lowercase().as_str()) {
        report.errors.push(format!(
            "general.log_level '{}' is not one of {:?}",
            config.general.log_level, LOG_LEVELS
        ));
    }

    if !COMPRESSION_MODES.contains(&config.backup.compression.to_lowercase().as_str()) {
        report.errors.push(format!(
            "backup.compression '{}' is not one of {:?}",
            config.backup.compression, COMPRESSION_MODES
        ));
    }

    if config.backup.max_concurrent_backups == 0 {
        report.errors.push("backup.max_concurrent_backups must be at least 1".into());
    }
    if config.backup.retry_delay_seconds <= 0.0 {
        report.errors.push("backup.retry_delay_seconds must be positive".into());
    }
    if config.backup.backoff_multiplier < 1.0 {
        report.errors.push("backup.backoff_multiplier must be at least 1.0".into());
    }
    if config.monitoring.status_retention_days == 0 {
        report.errors.push("monitoring.status_retention_days must be at least 1".into());
    }

    if config.notifications.enabled {
        if let Some(email) = &config.notifications.email {
            if !is_plausible_email(email) {
                report.errors.push(format!("notifications.email '{}' is not a valid address", email));
            }
        }
        if config.notifications.smtp_port == 0 {
            report.errors.push("notifications.smtp_port must be in 1..=65535".into());
        }
    }

    if let Some(default) = &config.general.default_repository {
        if !config.repositories.contains_key(default) {
            report.errors.push(format!(
                "general.default_repository '{}' does not name a configured repository",
                default
            ));
        }
    }

    for (name, repo) in &config.repositories {
        validate_repository(name, repo, &mut report);
    }

    for (name, target) in &config.backup_targets {
        validate_target(name, target, config, &mut report);
    }

    report
}

fn validate_repository(name: &str, repo: &RepositoryDescriptor, report: &mut ValidationReport) {
    if let Err(e) = RepositoryDescriptor::validate_name(name) {
        report.errors.push(e.to_string());
    }
    if name != repo.name {
        report.errors.push(format!(
            "repository map key '{}' does not match descriptor name '{}'",
            name, repo.name
        ));
    }

    let scheme = uri_scheme(&repo.location);
    if BackendKind::from_scheme(scheme).is_none() {
        report.errors.push(format!(
            "repository '{}': unknown uri scheme '{}' (known: {:?})",
            name,
            scheme,
            BackendKind::known_schemes()
        ));
    }
    if repo.location.is_empty() {
        report.errors.push(format!("repository '{}': location is empty", name));
    }
}

fn validate_target(
    name: &str,
    target: &BackupTargetDescriptor,
    config: &Config,
    report: &mut ValidationReport,
) {
    if let Err(e) = BackupTargetDescriptor::validate_name(name) {
        report.errors.push(e.to_string());
    }
    if name != target.name {
        report.errors.push(format!(
            "backup target map key '{}' does not match descriptor name '{}'",
            name, target.name
        ));
    }

    if target.paths.is_empty() {
        report.errors.push(format!("backup target '{}': paths must not be empty", name));
    }
    // Missing paths are a configuration-time warning: the filesystem may not
    // be mounted yet, and targets are re-validated before every run.
    for path in &target.paths {
        if !path.exists() {
            report.warnings.push(format!(
                "backup target '{}': path {} does not exist",
                name,
                path.display()
            ));
        }
    }

    if !config.repositories.contains_key(&target.repository) {
        report.errors.push(format!(
            "backup target '{}' references unknown repository '{}'",
            name, target.repository
        ));
    }

    if let Some(schedule) = &target.schedule {
        if let Err(e) = validate_cron(schedule) {
            report.errors.push(format!("backup target '{}': {}", name, e));
        }
    }
}

/// Validate a 5-field cron expression. The cron parser wants a seconds
/// field, so one is prepended before parsing.
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(format!("cron expression '{}' must have 5 fields, found {}", expr, fields));
    }
    cron::Schedule::from_str(&format!("0 {}", expr))
        .map(|_| ())
        .map_err(|e| format!("cron expression '{}' is invalid: {}", expr, e))
}

fn is_plausible_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelocker_domain::BackupTargetDescriptor;

    fn config_with_repo() -> Config {
        let mut config = Config::default();
        config.repositories.insert(
            "demo".into(),
            RepositoryDescriptor::new("demo", "file:///tmp/r"),
        );
        config
    }

    #[test]
    fn default_config_is_valid() {
        let report = validate_config(&Config::default());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn bad_log_level_is_an_error() {
        let mut config = Config::default();
        config.general.log_level = "loud".into();
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn missing_target_path_is_a_warning_not_an_error() {
        let mut config = config_with_repo();
        config.backup_targets.insert(
            "docs".into(),
            BackupTargetDescriptor::new("docs", "demo", vec!["/definitely/not/here".into()]),
        );
        let report = validate_config(&config);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn target_with_unknown_repository_is_an_error() {
        let mut config = Config::default();
        config.backup_targets.insert(
            "docs".into(),
            BackupTargetDescriptor::new("docs", "nope", vec!["/tmp".into()]),
        );
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn target_with_no_paths_is_an_error() {
        let mut config = config_with_repo();
        config.backup_targets.insert(
            "docs".into(),
            BackupTargetDescriptor::new("docs", "demo", vec![]),
        );
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn unknown_repository_scheme_is_an_error() {
        let mut config = Config::default();
        config.repositories.insert(
            "bad".into(),
            RepositoryDescriptor::new("bad", "ftp://host/path"),
        );
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn cron_validation_accepts_five_fields() {
        assert!(validate_cron("0 3 * * *").is_ok());
        assert!(validate_cron("*/15 * * * 1-5").is_ok());
    }

    #[test]
    fn cron_validation_rejects_wrong_arity_and_garbage() {
        assert!(validate_cron("0 3 * *").is_err());
        assert!(validate_cron("0 3 * * * *").is_err());
        assert!(validate_cron("61 3 * * *").is_err());
    }

    #[test]
    fn email_shape() {
        assert!(is_plausible_email("ops@example.com"));
        assert!(!is_plausible_email("ops"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("ops@nodot"));
    }

    #[test]
    fn dangling_default_repository_is_an_error() {
        let mut config = Config::default();
        config.general.default_repository = Some("ghost".into());
        assert!(!validate_config(&config).is_valid());
    }
}
