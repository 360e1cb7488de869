use serde_json::{Map, Value};
use tracing::debug;

/// A typed view of one line of the engine's `--json` output. Every variant
/// keeps the raw object so fields this version does not model stay
/// available downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status(StatusEvent),
    Summary(SummaryEvent),
    Error(ErrorEvent),
    /// A known-shape line whose `message_type` this adapter does not model.
    Other { message_type: String, raw: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub percent_done: f64,
    pub files_done: u64,
    pub total_files: u64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub raw: Map<String, Value>,
}

/// Terminal summary of a backup run. The engine emits it last on success;
/// consumers may rely on that ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEvent {
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub total_duration: f64,
    pub raw: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub message: String,
    pub raw: Map<String, Value>,
}

/// Parse one stdout line. Returns `None` for blank lines and lines that are
/// not JSON objects (the engine prints human text for some subcommands even
/// under `--json`).
pub fn parse_event(line: &str) -> Option<EngineEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            debug!(line, "skipping non-json engine output line");
            return None;
        }
    };
    let Value::Object(raw) = value else {
        debug!(line, "skipping non-object engine output line");
        return None;
    };

    let message_type = raw
        .get("message_type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let event = match message_type.as_str() {
        "status" => EngineEvent::Status(StatusEvent {
            percent_done: f64_field(&raw, "percent_done"),
            files_done: u64_field(&raw, "files_done"),
            total_files: u64_field(&raw, "total_files"),
            bytes_done: u64_field(&raw, "bytes_done"),
            total_bytes: u64_field(&raw, "total_bytes"),
            raw,
        }),
        "summary" => EngineEvent::Summary(SummaryEvent {
            snapshot_id: raw.get("snapshot_id").and_then(|v| v.as_str()).map(str::to_string),
            files_new: u64_field(&raw, "files_new"),
            files_changed: u64_field(&raw, "files_changed"),
            files_unmodified: u64_field(&raw, "files_unmodified"),
            data_added: u64_field(&raw, "data_added"),
            total_files_processed: u64_field(&raw, "total_files_processed"),
            total_bytes_processed: u64_field(&raw, "total_bytes_processed"),
            total_duration: f64_field(&raw, "total_duration"),
            raw,
        }),
        "error" | "exit_error" => EngineEvent::Error(ErrorEvent {
            message: raw
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            raw,
        }),
        other => {
            debug!(message_type = other, "unmodelled engine event type");
            EngineEvent::Other { message_type, raw }
        }
    };
    Some(event)
}

fn u64_field(raw: &Map<String, Value>, key: &str) -> u64 {
    raw.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn f64_field(raw: &Map<String, Value>, key: &str) -> f64 {
    raw.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_events() {
        let line = r#"{"message_type":"status","percent_done":0.25,"files_done":10,"total_files":40,"bytes_done":100,"total_bytes":400}"#;
        match parse_event(line) {
            Some(EngineEvent::Status(status)) => {
                assert_eq!(status.percent_done, 0.25);
                assert_eq!(status.files_done, 10);
                assert_eq!(status.total_bytes, 400);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_summary_events() {
        let line = r#"{"message_type":"summary","snapshot_id":"ab12cd34ef567890","files_new":3,"files_changed":1,"files_unmodified":7,"data_added":300,"total_files_processed":11,"total_duration":1.5}"#;
        match parse_event(line) {
            Some(EngineEvent::Summary(summary)) => {
                assert_eq!(summary.snapshot_id.as_deref(), Some("ab12cd34ef567890"));
                assert_eq!(summary.files_new, 3);
                assert_eq!(summary.total_duration, 1.5);
                // Raw map keeps unmodelled fields reachable.
                assert!(summary.raw.contains_key("data_added"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn unknown_types_become_other_with_raw_payload() {
        let line = r#"{"message_type":"future_thing","detail":42}"#;
        match parse_event(line) {
            Some(EngineEvent::Other { message_type, raw }) => {
                assert_eq!(message_type, "future_thing");
                assert_eq!(raw["detail"], 42);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn non_json_and_blank_lines_are_skipped() {
        assert!(parse_event("").is_none());
        assert!(parse_event("   ").is_none());
        assert!(parse_event("open repository").is_none());
        assert!(parse_event("[1,2,3]").is_none());
    }
}
