use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "timelocker",
    about = "High-level backup orchestration over the restic engine",
    version
)]
pub struct Cli {
    /// Override the configuration directory.
    #[arg(long, env = "TIMELOCKER_CONFIG_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Show underlying error chains instead of one-line messages.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage configured repositories.
    Repos {
        #[command(subcommand)]
        command: ReposCommand,
    },

    /// Manage backup targets.
    Targets {
        #[command(subcommand)]
        command: TargetsCommand,
    },

    /// Create and verify backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },

    /// Inspect, mount, diff, and restore snapshots.
    Snapshots {
        #[command(subcommand)]
        command: SnapshotsCommand,
    },

    /// Manage the credential vault.
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommand,
    },

    /// Security audit and emergency controls.
    Security {
        #[command(subcommand)]
        command: SecurityCommand,
    },

    /// Show component liveness and running operations.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum ReposCommand {
    /// Register a repository under a name. The uri needs an explicit
    /// scheme, e.g. file:///backups/main or s3:host/bucket.
    Add {
        name: String,
        uri: String,
        #[arg(long)]
        description: Option<String>,
        /// Store the given password in the vault for this repository.
        #[arg(long)]
        password: Option<String>,
    },

    /// Initialize the repository with the engine.
    Init {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// List configured repositories.
    List,

    /// Remove a repository from the configuration.
    Remove { name: String },

    /// Run the engine's integrity check.
    Check {
        name: String,
        /// Also re-read all pack data (slow).
        #[arg(long)]
        read_data: bool,
        #[arg(long)]
        password: Option<String>,
    },

    /// Repository statistics.
    Stats {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Clear stale engine locks.
    Unlock {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Structured health report for a repository.
    Health {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Set the default repository.
    SetDefault { name: String },

    /// Apply a retention policy via the engine's forget.
    Retention {
        name: String,
        #[arg(long)]
        keep_last: Option<u32>,
        #[arg(long)]
        keep_daily: Option<u32>,
        #[arg(long)]
        keep_weekly: Option<u32>,
        #[arg(long)]
        keep_monthly: Option<u32>,
        #[arg(long)]
        keep_yearly: Option<u32>,
        /// Run prune afterwards.
        #[arg(long)]
        prune: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TargetsCommand {
    /// Define a backup target.
    Add {
        name: String,
        /// Repository name this target backs up into.
        #[arg(long)]
        repository: String,
        /// Paths to include (repeatable).
        #[arg(long = "path", required = true)]
        paths: Vec<PathBuf>,
        /// Exclude glob patterns (repeatable).
        #[arg(long = "exclude")]
        exclude_patterns: Vec<String>,
        /// Skip directories containing one of these marker files.
        #[arg(long = "exclude-if-present")]
        exclude_files: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// 5-field cron schedule.
        #[arg(long)]
        schedule: Option<String>,
    },

    List,

    Remove { name: String },
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    /// Run a backup for one or more targets.
    Create {
        /// Repository name; defaults to the configured default repository.
        #[arg(long)]
        repository: Option<String>,
        /// Target names (repeatable).
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Resolve the selection and estimate, without touching the engine.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        password: Option<String>,
    },

    /// Verify repository integrity (optionally re-reading data).
    Verify {
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        thorough: bool,
        #[arg(long)]
        password: Option<String>,
    },

    /// Cancel a running backup by operation id.
    Cancel { operation_id: uuid::Uuid },
}

#[derive(Debug, Subcommand)]
pub enum SnapshotsCommand {
    /// List snapshots, newest first.
    List {
        #[arg(long)]
        repository: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Restore a snapshot into a target directory.
    Restore {
        snapshot_id: String,
        target: PathBuf,
        #[arg(long)]
        repository: Option<String>,
        /// Do not verify or write anything; report what would happen.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        password: Option<String>,
    },

    /// Compare two snapshots.
    Diff {
        snapshot_a: String,
        snapshot_b: String,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        metadata: bool,
        #[arg(long)]
        password: Option<String>,
    },

    /// List a snapshot's contents.
    Contents {
        snapshot_id: String,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Search snapshots by file name.
    Search {
        pattern: String,
        #[arg(long)]
        repository: Option<String>,
        /// Search a single snapshot instead of all.
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Mount a snapshot via fuse.
    Mount {
        snapshot_id: String,
        mountpoint: PathBuf,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Unmount a previously mounted snapshot.
    Unmount { snapshot_id: String },

    /// Remove a snapshot from the repository.
    Forget {
        snapshot_id: String,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        prune: bool,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CredentialsCommand {
    /// Unlock the vault (auto-unlock, env, then prompt).
    Unlock,

    /// Lock the vault.
    Lock,

    /// Store a repository password in the vault.
    StorePassword {
        repository: String,
        password: String,
    },

    /// Store backend credentials for a repository as key=value pairs.
    StoreBackend {
        repository: String,
        backend: String,
        /// key=value pairs, e.g. access_key_id=AKIA...
        #[arg(required = true)]
        pairs: Vec<String>,
    },

    /// List repository ids with stored passwords.
    List,

    /// Rotate the vault master password.
    ChangeMaster {
        old_password: String,
        new_password: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum SecurityCommand {
    /// Audit event counts over a window.
    Summary {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Lock the vault and refuse operations until cleared.
    Lockdown {
        #[arg(long, default_value = "operator initiated")]
        reason: String,
    },

    /// Clear an active lockdown.
    ClearLockdown,
}
