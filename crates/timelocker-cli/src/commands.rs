use anyhow::{bail, Context, Result};

use timelocker_domain::{
    BackupTargetDescriptor, RepositoryDescriptor, RestoreOptions, RetentionPolicy, SnapshotFilter,
};
use timelocker_facade::IntegrationService;
use timelocker_repo::{ensure_explicit_scheme, SearchKind};

use crate::cli::{
    BackupCommand, CredentialsCommand, ReposCommand, SecurityCommand, SnapshotsCommand,
    TargetsCommand,
};
use crate::output;

/// Resolve the repository argument, falling back to the configured default.
fn repository_name(service: &IntegrationService, arg: Option<String>) -> Result<String> {
    if let Some(name) = arg {
        return Ok(name);
    }
    let config = service.config().load()?;
    config
        .general
        .default_repository
        .context("no repository given and no default repository configured")
}

fn unlock_vault(service: &IntegrationService, allow_prompt: bool) -> Result<()> {
    let vault = service.vault().context("no credential vault attached")?;
    if !vault.ensure_unlocked(allow_prompt) {
        bail!("could not unlock the credential vault; set TIMELOCKER_MASTER_PASSWORD or run `timelocker credentials unlock`");
    }
    Ok(())
}

// ── repos ─────────────────────────────────────────────────────────────────────

pub async fn repos(service: &IntegrationService, command: ReposCommand) -> Result<()> {
    match command {
        ReposCommand::Add { name, uri, description, password } => {
            ensure_explicit_scheme(&uri)?;
            let mut descriptor = RepositoryDescriptor::new(&name, &uri);
            descriptor.description = description;

            if let Some(password) = &password {
                unlock_vault(service, true)?;
                let repo = service.resolve_repository(&uri, None)?;
                service
                    .vault()
                    .context("no credential vault attached")?
                    .store_repository_password(repo.id().as_str(), password)?;
            }

            service.config().add_repository(descriptor)?;
            println!("Repository '{}' added.", name);
        }
        ReposCommand::Init { name, password } => {
            let repo = service.resolve_repository(&name, password)?;
            let created = service.repository_service().initialize(&repo).await?;
            if created {
                println!("Repository '{}' initialized.", name);
            } else {
                println!("Repository '{}' was already initialized.", name);
            }
        }
        ReposCommand::List => {
            let config = service.config().load()?;
            print!("{}", output::render_repositories(&config));
        }
        ReposCommand::Remove { name } => {
            service.config().remove_repository(&name)?;
            println!("Repository '{}' removed.", name);
        }
        ReposCommand::Check { name, read_data, password } => {
            let repo = service.resolve_repository(&name, password)?;
            let report = if read_data {
                service
                    .repository_service()
                    .check_with_read_data(&repo, None)
                    .await?
            } else {
                service.repository_service().check(&repo).await?
            };
            print!("{}", output::render_integrity(&report));
            if !report.success {
                bail!("repository check failed");
            }
        }
        ReposCommand::Stats { name, password } => {
            let repo = service.resolve_repository(&name, password)?;
            let stats = service.repository_service().stats(&repo).await?;
            print!("{}", output::render_stats(&stats));
        }
        ReposCommand::Unlock { name, password } => {
            let repo = service.resolve_repository(&name, password)?;
            service.repository_service().unlock(&repo).await?;
            println!("Stale locks cleared for '{}'.", name);
        }
        ReposCommand::Health { name, password } => {
            let repo = service.resolve_repository(&name, password)?;
            let health = service.repository_service().health_check(&repo).await;
            print!("{}", output::render_health(&health));
        }
        ReposCommand::SetDefault { name } => {
            service.config().set_default_repository(&name)?;
            println!("Default repository set to '{}'.", name);
        }
        ReposCommand::Retention {
            name,
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
            keep_yearly,
            prune,
            dry_run,
            password,
        } => {
            let policy = RetentionPolicy {
                keep_last,
                keep_daily,
                keep_weekly,
                keep_monthly,
                keep_yearly,
            };
            let repo = service.resolve_repository(&name, password)?;
            service
                .repository_service()
                .apply_retention_policy(&repo, &policy, prune, dry_run)
                .await?;
            println!(
                "Retention policy {} for '{}'.",
                if dry_run { "previewed" } else { "applied" },
                name
            );
        }
    }
    Ok(())
}

// ── targets ───────────────────────────────────────────────────────────────────

pub async fn targets(service: &IntegrationService, command: TargetsCommand) -> Result<()> {
    match command {
        TargetsCommand::Add {
            name,
            repository,
            paths,
            exclude_patterns,
            exclude_files,
            tags,
            schedule,
        } => {
            let mut descriptor = BackupTargetDescriptor::new(&name, &repository, paths);
            descriptor.exclude_patterns = exclude_patterns;
            descriptor.exclude_files = exclude_files;
            descriptor.tags = tags;
            descriptor.schedule = schedule;
            service.config().add_target(descriptor)?;
            println!("Backup target '{}' added.", name);
        }
        TargetsCommand::List => {
            let config = service.config().load()?;
            print!("{}", output::render_targets(&config));
        }
        TargetsCommand::Remove { name } => {
            service.config().remove_target(&name)?;
            println!("Backup target '{}' removed.", name);
        }
    }
    Ok(())
}

// ── backup ────────────────────────────────────────────────────────────────────

pub async fn backup(service: &IntegrationService, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Create { repository, targets, tags, dry_run, password } => {
            let repository = repository_name(service, repository)?;
            if service.vault().is_some() && password.is_none() {
                // Best-effort: an unlocked vault lets the factory resolve
                // stored passwords; failure falls through to env lookup.
                let _ = service.vault().map(|v| v.ensure_unlocked(false));
            }
            let result = service
                .execute_backup(&repository, &targets, &tags, dry_run, password)
                .await?;
            print!("{}", output::render_backup_result(&result));
            if result.status != timelocker_domain::OperationOutcome::Completed {
                bail!("backup did not complete");
            }
        }
        BackupCommand::Verify { repository, snapshot, thorough, password } => {
            let repository = repository_name(service, repository)?;
            let report = service
                .backup_orchestrator()
                .verify_backup_integrity(&repository, snapshot.as_deref(), thorough, password)
                .await?;
            print!("{}", output::render_integrity(&report));
            if !report.success {
                bail!("verification failed");
            }
        }
        BackupCommand::Cancel { operation_id } => {
            if service.cancel(operation_id) {
                println!("Cancellation requested for {}.", operation_id);
            } else {
                println!("No running operation {}.", operation_id);
            }
        }
    }
    Ok(())
}

// ── snapshots ─────────────────────────────────────────────────────────────────

pub async fn snapshots(service: &IntegrationService, command: SnapshotsCommand) -> Result<()> {
    match command {
        SnapshotsCommand::List { repository, tags, host, limit, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            let filter = SnapshotFilter { tags, host, max_results: limit, ..Default::default() };
            let snapshots = service.snapshot_service().list(&repo, &filter).await?;
            print!("{}", output::render_snapshots(&snapshots));
        }
        SnapshotsCommand::Restore { snapshot_id, target, repository, dry_run, password } => {
            let repository = repository_name(service, repository)?;
            let config = service.config().load()?;
            let options = RestoreOptions {
                target_path: Some(target),
                create_target_directory: config.restore.create_target_directory,
                verify_after_restore: config.restore.verify_after_restore,
                preserve_permissions: config.restore.preserve_permissions,
                conflict_resolution: config.restore.conflict_resolution,
                dry_run,
                ..RestoreOptions::new()
            };
            let result = service
                .execute_restore(&repository, &snapshot_id, &options, password)
                .await?;
            print!("{}", output::render_restore_result(&result));
            if result.status != timelocker_domain::OperationOutcome::Completed {
                bail!("restore did not complete");
            }
        }
        SnapshotsCommand::Diff { snapshot_a, snapshot_b, repository, metadata, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            let diff = service
                .snapshot_service()
                .diff(&repo, &snapshot_a, &snapshot_b, metadata)
                .await?;
            print!("{}", output::render_diff(&diff));
        }
        SnapshotsCommand::Contents { snapshot_id, repository, path, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            let entries = service
                .snapshot_service()
                .contents(&repo, &snapshot_id, path.as_deref())
                .await?;
            for entry in entries {
                println!("{:>10}  {}  {}", entry.size, entry.node_type, entry.path);
            }
        }
        SnapshotsCommand::Search { pattern, repository, snapshot, host, tags, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            let matches = match snapshot {
                Some(snapshot_id) => {
                    service
                        .snapshot_service()
                        .search_in(&repo, &snapshot_id, &pattern, SearchKind::Name)
                        .await?
                }
                None => {
                    service
                        .snapshot_service()
                        .search_across(&repo, &pattern, SearchKind::Name, host.as_deref(), &tags)
                        .await?
                }
            };
            for found in matches {
                println!("{}:{}", found.snapshot_id, found.path);
            }
        }
        SnapshotsCommand::Mount { snapshot_id, mountpoint, repository, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            service
                .snapshot_service()
                .mount(&repo, &snapshot_id, &mountpoint)
                .await?;
            println!(
                "Snapshot {} mounted at {} (browse under snapshots/).",
                snapshot_id,
                mountpoint.display()
            );
        }
        SnapshotsCommand::Unmount { snapshot_id } => {
            service.snapshot_service().unmount(&snapshot_id).await?;
            println!("Snapshot {} unmounted.", snapshot_id);
        }
        SnapshotsCommand::Forget { snapshot_id, repository, prune, password } => {
            let repository = repository_name(service, repository)?;
            let repo = service.resolve_repository(&repository, password)?;
            service
                .snapshot_service()
                .forget(&repo, &snapshot_id, prune)
                .await?;
            println!("Snapshot {} forgotten.", snapshot_id);
        }
    }
    Ok(())
}

// ── credentials ───────────────────────────────────────────────────────────────

pub async fn credentials(service: &IntegrationService, command: CredentialsCommand) -> Result<()> {
    let vault = service.vault().context("no credential vault attached")?;
    match command {
        CredentialsCommand::Unlock => {
            if vault.ensure_unlocked(true) {
                println!("Vault unlocked.");
            } else {
                bail!("could not unlock the vault");
            }
        }
        CredentialsCommand::Lock => {
            vault.lock();
            println!("Vault locked.");
        }
        CredentialsCommand::StorePassword { repository, password } => {
            unlock_vault(service, true)?;
            let repo = service.resolve_repository(&repository, None)?;
            vault.store_repository_password(repo.id().as_str(), &password)?;
            println!("Password stored for '{}'.", repository);
        }
        CredentialsCommand::StoreBackend { repository, backend, pairs } => {
            unlock_vault(service, true)?;
            let mut credentials = timelocker_domain::BackendCredentials::new();
            for pair in pairs {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("'{}' is not a key=value pair", pair))?;
                credentials.insert(key.to_string(), value.to_string());
            }
            let repo = service.resolve_repository(&repository, None)?;
            vault.store_repository_backend_credentials(
                repo.id().as_str(),
                &backend,
                credentials,
            )?;
            println!("Backend credentials stored for '{}' ({}).", repository, backend);
        }
        CredentialsCommand::List => {
            unlock_vault(service, true)?;
            for id in vault.list_repositories()? {
                println!("{}", id);
            }
        }
        CredentialsCommand::ChangeMaster { old_password, new_password } => {
            vault.change_master_password(&old_password, &new_password)?;
            println!("Master password changed.");
        }
    }
    Ok(())
}

// ── security & status ─────────────────────────────────────────────────────────

pub async fn security(service: &IntegrationService, command: SecurityCommand) -> Result<()> {
    let security = service.security().context("no credential vault attached")?;
    match command {
        SecurityCommand::Summary { days } => {
            let summary = security.get_security_summary(days)?;
            println!("Events in the last {} days: {}", days, summary.total_events);
            let mut types: Vec<_> = summary.by_type.iter().collect();
            types.sort();
            for (event_type, count) in types {
                println!("  {:<32} {}", event_type, count);
            }
        }
        SecurityCommand::Lockdown { reason } => {
            service.emergency_lockdown(&reason)?;
            println!("Emergency lockdown active.");
        }
        SecurityCommand::ClearLockdown => {
            if security.clear_lockdown()? {
                println!("Lockdown cleared.");
            } else {
                println!("No lockdown was active.");
            }
        }
    }
    Ok(())
}

pub async fn status(service: &IntegrationService) -> Result<()> {
    let status = service.get_system_status();
    print!("{}", output::render_system_status(&status));
    let current = service.status_store().current_operations()?;
    if !current.is_empty() {
        println!("In-flight today:");
        for op in current {
            println!("  {}  {}  {}", op.operation_id, op.operation_type, op.state);
        }
    }
    Ok(())
}
