mod cli;
mod commands;
mod output;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use timelocker_config::AppPaths;
use timelocker_facade::IntegrationService;
use timelocker_vault::CredentialVault;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => {
            let paths = AppPaths::resolve();
            paths.ensure_exists();
            paths.config_dir
        }
    };

    let mut service = IntegrationService::new(&config_dir);
    let vault = Arc::new(CredentialVault::new(config_dir.join("credentials")));
    service.attach_vault(vault);

    if let Err(e) = run(&service, cli.command).await {
        // One line plus a hint at the boundary; the full chain only with
        // --verbose or in the log.
        if cli.verbose {
            eprintln!("error: {:#}", e);
        } else {
            eprintln!("error: {}", e);
            eprintln!("hint: re-run with --verbose for the underlying cause chain");
        }
        std::process::exit(1);
    }
}

async fn run(service: &IntegrationService, command: Command) -> Result<()> {
    match command {
        Command::Repos { command } => commands::repos(service, command).await,
        Command::Targets { command } => commands::targets(service, command).await,
        Command::Backup { command } => commands::backup(service, command).await,
        Command::Snapshots { command } => commands::snapshots(service, command).await,
        Command::Credentials { command } => commands::credentials(service, command).await,
        Command::Security { command } => commands::security(service, command).await,
        Command::Status => commands::status(service).await,
    }
}

/// `RUST_LOG` wins; otherwise `TIMELOCKER_LOG_LEVEL` seeds the filter.
fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = std::env::var("TIMELOCKER_LOG_LEVEL")
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|_| "warn".to_string());
            EnvFilter::new(level)
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
