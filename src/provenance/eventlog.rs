//! Append-only JSONL provenance event log.

use crate::core::types::{QueueEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// RFC 3339 UTC timestamp with second precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .unsigned_abs();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log lives next to the queue file.
pub fn event_log_path(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("events.jsonl")
}

/// Append an event to the log at `path`.
pub fn append_event(path: &Path, event: QueueEvent) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create log dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read back every event in a log. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| format!("{}:{}: {}", path.display(), n + 1, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClearScope;

    #[test]
    fn test_eventlog_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_eventlog_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_eventlog_path_next_to_store() {
        let p = event_log_path(Path::new("/work/.docqueue/queue.json"));
        assert_eq!(p, PathBuf::from("/work/.docqueue/events.jsonl"));
        let bare = event_log_path(Path::new("queue.json"));
        assert_eq!(bare, PathBuf::from("events.jsonl"));
    }

    #[test]
    fn test_eventlog_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        append_event(
            &path,
            QueueEvent::TasksAppended {
                indices: vec![1, 2],
            },
        )
        .unwrap();
        append_event(
            &path,
            QueueEvent::QueueCleared {
                scope: ClearScope::Completed,
                removed: vec![1],
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"event\":\"tasks_appended\""));

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].event,
            QueueEvent::QueueCleared {
                scope: ClearScope::Completed,
                removed: vec![1]
            }
        );
    }

    #[test]
    fn test_eventlog_read_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"ts\":\"x\",\"event\":\"nope\"}\n").unwrap();
        assert!(read_events(&path).unwrap_err().contains(":1:"));
    }
}
