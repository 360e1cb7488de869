use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

const APP_DIR: &str = "timelocker";

// ── Elevation detection ───────────────────────────────────────────────────────

/// Whether the current process runs with administrative privileges.
///
/// POSIX: effective uid 0, probed once via `id -u` and cached. Any probe
/// failure reports not-elevated. Non-unix platforms report not-elevated.
pub fn is_elevated() -> bool {
    static ELEVATED: OnceLock<bool> = OnceLock::new();
    *ELEVATED.get_or_init(|| effective_uid() == Some(0))
}

/// Effective uid of this process, when determinable.
#[cfg(unix)]
pub fn effective_uid() -> Option<u32> {
    let output = std::process::Command::new("id").arg("-u").output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(not(unix))]
pub fn effective_uid() -> Option<u32> {
    None
}

// ── Directory resolution ──────────────────────────────────────────────────────

/// Resolved application directories for the current platform and privilege
/// context. Elevated processes use system-wide locations; user processes
/// follow the XDG spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl AppPaths {
    pub fn resolve() -> Self {
        Self::resolve_with(is_elevated())
    }

    /// Resolution split out for tests, which cannot control the real euid.
    pub fn resolve_with(elevated: bool) -> Self {
        let mut paths = if elevated {
            Self::system_paths()
        } else {
            Self::user_paths()
        };

        if let Ok(dir) = std::env::var("TIMELOCKER_DATA_DIR") {
            paths.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TIMELOCKER_TEMP_DIR") {
            paths.temp_dir = PathBuf::from(dir);
        }

        paths
    }

    #[cfg(unix)]
    fn system_paths() -> Self {
        Self {
            config_dir: PathBuf::from("/etc").join(APP_DIR),
            data_dir: PathBuf::from("/var/lib").join(APP_DIR),
            cache_dir: PathBuf::from("/var/cache").join(APP_DIR),
            runtime_dir: PathBuf::from("/run").join(APP_DIR),
            temp_dir: std::env::temp_dir().join(APP_DIR),
        }
    }

    #[cfg(not(unix))]
    fn system_paths() -> Self {
        let base = std::env::var("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir())
            .join(APP_DIR);
        Self {
            config_dir: base.clone(),
            data_dir: base.join("data"),
            cache_dir: base.join("cache"),
            runtime_dir: base.join("run"),
            temp_dir: std::env::temp_dir().join(APP_DIR),
        }
    }

    fn user_paths() -> Self {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));

        let config_base = env_path("XDG_CONFIG_HOME").unwrap_or_else(|| home.join(".config"));
        let data_base = env_path("XDG_DATA_HOME").unwrap_or_else(|| home.join(".local/share"));
        let cache_base = env_path("XDG_CACHE_HOME").unwrap_or_else(|| home.join(".cache"));
        let runtime_base = env_path("XDG_RUNTIME_DIR").unwrap_or_else(|| cache_base.clone());

        Self {
            config_dir: config_base.join(APP_DIR),
            data_dir: data_base.join(APP_DIR),
            cache_dir: cache_base.join(APP_DIR),
            runtime_dir: runtime_base.join(APP_DIR),
            temp_dir: std::env::temp_dir().join(APP_DIR),
        }
    }

    /// Create every resolved directory with owner-only permissions. Creation
    /// failure is a warning: callers keep working and fail later with a
    /// precise error if the directory is actually needed.
    pub fn ensure_exists(&self) {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.cache_dir,
            &self.runtime_dir,
            &self.temp_dir,
        ] {
            ensure_private_dir(dir);
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Project-scoped overlay, deep-merged over the user/system document
    /// when present in the working directory.
    pub fn project_overlay() -> Option<PathBuf> {
        let overlay = PathBuf::from(".timelocker").join("config.json");
        overlay.exists().then_some(overlay)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}

/// Create `dir` (and parents) with mode 0700 on unix. Failure is a warning.
pub fn ensure_private_dir(dir: &Path) {
    if dir.exists() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "could not create directory");
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            warn!(dir = %dir.display(), error = %e, "could not restrict directory permissions");
        }
    }

    debug!(dir = %dir.display(), "created directory");
}
