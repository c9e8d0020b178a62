use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use plexbeam_config::StateLayout;

/// Append-only writer for the install-global `cartridge_events.log` and
/// `master.log`.
///
/// Every append is a single `write_all` of one newline-terminated line, so
/// concurrent sessions interleave whole lines rather than bytes. Failures
/// are logged and swallowed: event logging must never take down a dispatch.
#[derive(Debug, Clone)]
pub struct EventLog {
    events_path: PathBuf,
    master_path: PathBuf,
    session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Alert,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Alert => "ALERT",
        }
    }
}

impl EventLog {
    pub fn new(state: &StateLayout, session_id: impl Into<String>) -> Self {
        Self {
            events_path: state.events_log(),
            master_path: state.master_log(),
            session_id: session_id.into(),
        }
    }

    /// Record one structured event line in `cartridge_events.log`.
    pub fn log_event(&self, severity: Severity, event: &str, detail: &str) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "session": self.session_id,
            "severity": severity.as_str(),
            "event": event,
            "detail": detail,
        });
        append_line(&self.events_path, &line.to_string());
    }

    pub fn info(&self, event: &str, detail: &str) {
        self.log_event(Severity::Info, event, detail);
    }

    pub fn alert(&self, event: &str, detail: &str) {
        self.log_event(Severity::Alert, event, detail);
    }

    /// One summary line per session in `master.log`, including the exit code
    /// the cartridge is about to return.
    pub fn log_session_exit(&self, strategy: &str, exit_code: i32) {
        let line = format!(
            "{} session={} strategy={} exit={}",
            Utc::now().to_rfc3339(),
            self.session_id,
            strategy,
            exit_code
        );
        append_line(&self.master_path, &line);
    }
}

fn append_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));
    if let Err(error) = result {
        warn!(path = %path.display(), %error, "event append failed");
    }
}

/// Read a previously stored fingerprint file, if any.
pub fn read_fingerprint(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

/// Persist a fingerprint, replacing whatever was there.
pub fn write_fingerprint(path: &Path, fingerprint: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(error) = std::fs::write(path, format!("{fingerprint}\n")) {
        warn!(path = %path.display(), %error, "fingerprint write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_one_json_line_each() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateLayout::new(tmp.path());
        let log = EventLog::new(&state, "s1");
        log.info("dispatch_start", "mode=C workers=2");
        log.alert("protocol", "manifest without init segment");
        log.log_session_exit("multi", 0);

        let events = std::fs::read_to_string(state.events_log()).unwrap();
        let lines: Vec<&str> = events.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["session"], "s1");
        assert_eq!(first["severity"], "INFO");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["severity"], "ALERT");

        let master = std::fs::read_to_string(state.master_log()).unwrap();
        assert!(master.trim_end().ends_with("strategy=multi exit=0"));
    }

    #[test]
    fn fingerprint_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".binary_fingerprint");
        assert!(read_fingerprint(&path).is_none());
        write_fingerprint(&path, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            read_fingerprint(&path).as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
    }
}
