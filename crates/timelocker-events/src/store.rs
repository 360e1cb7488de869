use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use timelocker_domain::OperationStatus;

use crate::bus::StatusSink;
use crate::error::EventsError;

const FILE_PREFIX: &str = "status_";
const FILE_SUFFIX: &str = ".jsonl";

/// JSON-Lines persistence for status events, one file per day. Used for
/// post-mortems and the facade's current-operations view.
pub struct JsonlStatusStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "could not create status directory");
        }
        Self { dir, write_lock: Mutex::new(()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, date.format("%Y-%m-%d"), FILE_SUFFIX))
    }

    pub fn append(&self, status: &OperationStatus) -> Result<(), EventsError> {
        let line = serde_json::to_string(status)?;
        let path = self.file_for(status.timestamp.date_naive());

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        writeln!(file, "{}", line).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// All records for one day, in append order. Unparsable lines are
    /// skipped: a torn write must not hide the rest of the day.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<OperationStatus>, EventsError> {
        let path = self.file_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(content
            .lines()
            .filter_map(|line| {
                let parsed = serde_json::from_str(line);
                if parsed.is_err() {
                    warn!(path = %path.display(), "skipping unparsable status record");
                }
                parsed.ok()
            })
            .collect())
    }

    /// The latest status per operation seen today that has not reached a
    /// terminal state.
    pub fn current_operations(&self) -> Result<Vec<OperationStatus>, EventsError> {
        let today = self.read_day(Utc::now().date_naive())?;
        let mut latest: HashMap<uuid::Uuid, OperationStatus> = HashMap::new();
        for status in today {
            latest.insert(status.operation_id, status);
        }
        let mut current: Vec<OperationStatus> = latest
            .into_values()
            .filter(|status| !status.state.is_terminal())
            .collect();
        current.sort_by_key(|status| status.timestamp);
        Ok(current)
    }

    /// Remove day files older than `retention_days`. Run once at startup.
    pub fn sweep_expired(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        debug!(file = name, "swept expired status file");
                        removed += 1;
                    }
                    Err(e) => warn!(file = name, error = %e, "could not sweep status file"),
                }
            }
        }
        removed
    }
}

impl StatusSink for JsonlStatusStore {
    fn name(&self) -> &str {
        "status-store"
    }

    fn handle(&self, status: &OperationStatus) -> Result<(), EventsError> {
        self.append(status)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> EventsError {
    EventsError::Io { path: path.display().to_string(), source }
}
