use timelocker_config::Config;
use timelocker_domain::{BackupResult, RepositoryHealth, RestoreResult, Snapshot, SnapshotDiff};
use timelocker_facade::SystemStatus;
use timelocker_repo::{IntegrityReport, RepositoryStats};

/// Render the repository index as human-readable text.
pub fn render_repositories(config: &Config) -> String {
    if config.repositories.is_empty() {
        return "No repositories configured.".to_string();
    }
    let default = config.general.default_repository.as_deref();
    let mut out = String::new();
    for (name, repo) in &config.repositories {
        let marker = if Some(name.as_str()) == default { "*" } else { " " };
        let state = if repo.enabled { "" } else { " (disabled)" };
        out.push_str(&format!("{} {}  {}{}\n", marker, name, repo.location, state));
        if let Some(description) = &repo.description {
            out.push_str(&format!("     {}\n", description));
        }
    }
    out
}

pub fn render_targets(config: &Config) -> String {
    if config.backup_targets.is_empty() {
        return "No backup targets configured.".to_string();
    }
    let mut out = String::new();
    for (name, target) in &config.backup_targets {
        let state = if target.enabled { "" } else { " (disabled)" };
        out.push_str(&format!("{} -> {}{}\n", name, target.repository, state));
        for path in &target.paths {
            out.push_str(&format!("    path: {}\n", path.display()));
        }
        if let Some(schedule) = &target.schedule {
            out.push_str(&format!("    schedule: {}\n", schedule));
        }
    }
    out
}

pub fn render_snapshots(snapshots: &[Snapshot]) -> String {
    if snapshots.is_empty() {
        return "No snapshots.".to_string();
    }
    let mut out = String::new();
    for snapshot in snapshots {
        let tags = if snapshot.tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", snapshot.tags.join(","))
        };
        out.push_str(&format!(
            "{}  {}  {}{}\n",
            snapshot.id,
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S %z"),
            snapshot.hostname,
            tags
        ));
        for path in &snapshot.paths {
            out.push_str(&format!("    {}\n", path.display()));
        }
    }
    out
}

pub fn render_backup_result(result: &BackupResult) -> String {
    let mut out = format!(
        "Backup {}: {}\n",
        result.operation_id, result.status
    );
    if let Some(snapshot_id) = &result.snapshot_id {
        out.push_str(&format!("  snapshot: {}\n", snapshot_id));
    }
    out.push_str(&format!(
        "  files: {} new, {} changed, {} unmodified\n",
        result.files_new, result.files_changed, result.files_unmodified
    ));
    out.push_str(&format!("  data added: {} bytes\n", result.data_added));
    for warning in &result.warnings {
        out.push_str(&format!("  warning: {}\n", warning));
    }
    for error in &result.errors {
        out.push_str(&format!("  error: {}\n", error));
    }
    out
}

pub fn render_restore_result(result: &RestoreResult) -> String {
    let mut out = format!(
        "Restore {} of {}: {}\n  files restored: {}\n",
        result.operation_id, result.snapshot_id, result.status, result.files_restored
    );
    for warning in &result.warnings {
        out.push_str(&format!("  warning: {}\n", warning));
    }
    for error in &result.errors {
        out.push_str(&format!("  error: {}\n", error));
    }
    out
}

pub fn render_diff(diff: &SnapshotDiff) -> String {
    let mut out = String::new();
    for path in &diff.added {
        out.push_str(&format!("+ {}\n", path));
    }
    for path in &diff.removed {
        out.push_str(&format!("- {}\n", path));
    }
    for path in &diff.modified {
        out.push_str(&format!("~ {}\n", path));
    }
    if out.is_empty() {
        out.push_str("No differences.\n");
    }
    if let Some(delta) = diff.size_delta {
        out.push_str(&format!("size delta: {} bytes\n", delta));
    }
    out
}

pub fn render_integrity(report: &IntegrityReport) -> String {
    let mut out = format!(
        "Integrity: {}\n  checks: {}\n",
        if report.success { "ok" } else { "FAILED" },
        report.checks_performed.join(", ")
    );
    for warning in &report.warnings {
        out.push_str(&format!("  warning: {}\n", warning));
    }
    for error in &report.errors {
        out.push_str(&format!("  error: {}\n", error));
    }
    out
}

pub fn render_stats(stats: &RepositoryStats) -> String {
    format!(
        "total size: {} bytes\ntotal files: {}\nsnapshots: {}\n",
        stats.total_size, stats.total_file_count, stats.snapshots_count
    )
}

pub fn render_health(health: &RepositoryHealth) -> String {
    let check = |ok: bool| if ok { "ok" } else { "FAIL" };
    format!(
        "directory exists:        {}\n\
         directory writable:      {}\n\
         repository initialized:  {}\n\
         password available:      {}\n\
         engine accessible:       {}\n\
         overall:                 {}\n",
        check(health.directory_exists),
        check(health.directory_writable),
        check(health.repository_initialized),
        check(health.password_available),
        check(health.engine_accessible),
        if health.is_healthy() { "healthy" } else { "unhealthy" }
    )
}

pub fn render_system_status(status: &SystemStatus) -> String {
    let mut out = String::from("Components:\n");
    for (name, alive) in &status.components {
        out.push_str(&format!("  {:<16} {}\n", name, if *alive { "up" } else { "down" }));
    }
    out.push_str(&format!("Active operations: {}\n", status.active_operations));
    if status.lockdown_active {
        out.push_str("EMERGENCY LOCKDOWN ACTIVE\n");
    }
    if let Some(summary) = &status.security_summary {
        out.push_str(&format!(
            "Security events (last {} days): {}\n",
            summary.window_days, summary.total_events
        ));
    }
    out
}
