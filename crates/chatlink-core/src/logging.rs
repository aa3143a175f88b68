//! Session transcript logging.
//!
//! Appends timestamped lines for connection state changes and message
//! traffic to `{log_dir}/{log_id}.log`. A handle opened without a directory
//! is inert.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only transcript file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// A handle that discards everything written to it.
pub fn disabled() -> LogHandle {
    Arc::new(Mutex::new(None))
}

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped line to the transcript (if present).
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = utc_timestamp();
            let _ = writeln!(file, "[{}] {}: {}", ts, direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) a transcript at `{log_dir}/{log_id}.log` and return a shared handle.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", log_id)))
            .ok()
    });
    Arc::new(Mutex::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn utc_timestamp_format() {
        let ts = utc_timestamp();
        // YYYY-MM-DDTHH:MM:SS.mmmZ
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn open_log_file_creates_file() {
        let dir = tempdir().unwrap();

        let handle = open_log_file(Some(dir.path()), "CH123");
        assert!(handle.lock().unwrap().is_some());
        assert!(dir.path().join("CH123.log").exists());
    }

    #[test]
    fn open_log_file_none_dir() {
        let handle = open_log_file(None, "CH123");
        assert!(handle.lock().unwrap().is_none());
    }

    #[test]
    fn log_line_appends_to_file() {
        let dir = tempdir().unwrap();
        let handle = open_log_file(Some(dir.path()), "CH123");

        log_line(&handle, "SEND", "hello world");
        log_line(&handle, "RECV", "hi back");

        let contents = std::fs::read_to_string(dir.path().join("CH123.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("SEND: hello world"));
        assert!(lines[1].ends_with("RECV: hi back"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn disabled_handle_ignores_writes() {
        let handle = disabled();
        // Should not panic
        log_line(&handle, "STATE", "connected");
        assert!(handle.lock().unwrap().is_none());
    }
}
