//! Structured JSONL logging of termination events.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file or an in-memory buffer.
//! - [`install`] / [`emit`] / [`flush`]: the process-wide emitter used by the
//!   shutdown path. Emitting with no emitter installed is a no-op.
//!
//! The fault path never logs; it must stay allocation-free.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Stack owner the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: default_trace_id(),
            level,
            event: event.into(),
            exit_code: None,
            owner: None,
            message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: usize) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    buffer: Option<Arc<Mutex<Vec<u8>>>>,
    seq: u64,
}

/// `Write` adapter over a shared buffer so tests can read what was emitted.
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogEmitter {
    /// Create an emitter that writes to a file (truncating it).
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Box::new(std::io::BufWriter::new(file)),
            buffer: None,
            seq: 0,
        })
    }

    /// Create an emitter that writes to an in-memory buffer.
    #[must_use]
    pub fn to_buffer() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        Self {
            writer: Box::new(SharedBuffer(Arc::clone(&buffer))),
            buffer: Some(buffer),
            seq: 0,
        }
    }

    /// Write one entry as a JSONL line. The sequence number is stored under
    /// `details.seq` when no other details are attached.
    pub fn emit(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        self.seq += 1;
        let mut entry = entry.clone();
        if entry.details.is_none() {
            entry.details = Some(serde_json::json!({ "seq": self.seq }));
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    /// Everything written so far, for emitters built with [`LogEmitter::to_buffer`].
    #[must_use]
    pub fn buffer_contents(&self) -> Option<String> {
        self.buffer
            .as_ref()
            .map(|buf| String::from_utf8_lossy(&buf.lock()).into_owned())
    }
}

static EMITTER: Mutex<Option<LogEmitter>> = Mutex::new(None);

/// Install the process-wide emitter, replacing any previous one.
pub fn install(emitter: LogEmitter) {
    *EMITTER.lock() = Some(emitter);
}

/// Remove and return the process-wide emitter.
pub fn uninstall() -> Option<LogEmitter> {
    EMITTER.lock().take()
}

/// Emit through the process-wide emitter, if any. Write errors are dropped.
pub fn emit(entry: LogEntry) {
    if let Some(emitter) = EMITTER.lock().as_mut() {
        let _ = emitter.emit(&entry);
    }
}

/// Flush the process-wide emitter, if any.
pub fn flush() {
    if let Some(emitter) = EMITTER.lock().as_mut() {
        let _ = emitter.flush();
    }
}

/// Validate one JSONL line: it must parse and carry the required fields.
pub fn validate_log_line(line: &str) -> Result<LogEntry, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|err| format!("invalid JSON: {err}"))?;
    for field in ["timestamp", "trace_id", "level", "event"] {
        if value.get(field).is_none() {
            return Err(format!("missing required field `{field}`"));
        }
    }
    serde_json::from_value(value).map_err(|err| format!("schema mismatch: {err}"))
}

fn default_trace_id() -> String {
    format!("finale::{}", std::process::id())
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    // Approximate calendar fields; ordering and seconds are exact.
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        millis,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new(LogLevel::Info, "shutdown_begin");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert!(parsed["trace_id"].as_str().unwrap().starts_with("finale::"));
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "shutdown_begin");
        assert!(parsed.get("exit_code").is_none());
        assert!(parsed.get("message").is_none());
    }

    #[test]
    fn optional_fields_round_trip_through_validation() {
        let entry = LogEntry::new(LogLevel::Error, "handler_error")
            .with_trace_id("t-1")
            .with_exit_code(1)
            .with_owner(7)
            .with_message("boom");
        let line = entry.to_jsonl().unwrap();
        let parsed = validate_log_line(&line).unwrap();
        assert_eq!(parsed.trace_id, "t-1");
        assert_eq!(parsed.exit_code, Some(1));
        assert_eq!(parsed.owner, Some(7));
        assert_eq!(parsed.message.as_deref(), Some("boom"));
    }

    #[test]
    fn validation_rejects_missing_fields_and_garbage() {
        assert!(validate_log_line("not json").is_err());
        let err = validate_log_line(r#"{"timestamp":"x","trace_id":"y","level":"info"}"#)
            .unwrap_err();
        assert!(err.contains("event"), "{err}");
    }

    #[test]
    fn buffer_emitter_writes_one_line_per_entry() {
        let mut emitter = LogEmitter::to_buffer();
        emitter
            .emit(&LogEntry::new(LogLevel::Info, "shutdown_begin"))
            .unwrap();
        emitter
            .emit(&LogEntry::new(LogLevel::Info, "shutdown_complete").with_exit_code(0))
            .unwrap();
        assert_eq!(emitter.emitted(), 2);
        let contents = emitter.buffer_contents().unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second = validate_log_line(lines[1]).unwrap();
        assert_eq!(second.event, "shutdown_complete");
        assert_eq!(second.details.unwrap()["seq"], 2);
    }

    #[test]
    fn file_emitter_flushes_to_disk() {
        let path = std::env::temp_dir().join(format!(
            "finale-structured-log-{}.jsonl",
            std::process::id()
        ));
        let mut emitter = LogEmitter::to_file(&path).unwrap();
        emitter
            .emit(&LogEntry::new(LogLevel::Warn, "shutdown_rejected"))
            .unwrap();
        emitter.flush().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"shutdown_rejected\""));
        let _ = std::fs::remove_file(&path);
    }
}
