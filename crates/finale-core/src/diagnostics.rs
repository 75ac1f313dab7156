//! The diagnostic stream: a write-only, line-oriented sink.
//!
//! Tooling matches on the exact text produced here, so the prefixes are
//! exported as constants.

use std::io::Write;

use parking_lot::Mutex;

use crate::error::RuntimeError;

pub const HANDLER_ERROR_PREFIX: &str = "Error running at_exit handler: ";
pub const UNHANDLED_PREFIX: &str = "Unhandled exception: ";
pub const CAUSED_BY_PREFIX: &str = "Caused by: ";

/// Line-oriented diagnostic output. Lines are passed without the trailing newline.
pub trait DiagnosticSink {
    fn write_line(&self, line: &str);

    fn flush(&self) {}
}

/// Writes to the process's standard error. Write failures are dropped: there
/// is nowhere left to report them during termination.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn write_line(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.write_all(b"\n");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Every line joined with `\n`, including a trailing newline per line.
    #[must_use]
    pub fn contents(&self) -> String {
        self.lines.lock().iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }
}

impl DiagnosticSink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_owned());
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &S {
    fn write_line(&self, line: &str) {
        (**self).write_line(line);
    }

    fn flush(&self) {
        (**self).flush();
    }
}

/// `Error running at_exit handler: <message>`
pub fn report_handler_error(sink: &(impl DiagnosticSink + ?Sized), err: &RuntimeError) {
    sink.write_line(&format!("{HANDLER_ERROR_PREFIX}{}", err.message()));
}

/// `Unhandled exception: <message>` followed by one `Caused by:` line per cause.
pub fn report_unhandled(sink: &(impl DiagnosticSink + ?Sized), err: &RuntimeError) {
    sink.write_line(&format!("{UNHANDLED_PREFIX}{}", err.message()));
    for cause in err.causes() {
        sink.write_line(&format!("{CAUSED_BY_PREFIX}{}", cause.message()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_line_is_exact() {
        let sink = CaptureSink::new();
        report_handler_error(&sink, &RuntimeError::new("boom"));
        assert_eq!(sink.contents(), "Error running at_exit handler: boom\n");
    }

    #[test]
    fn unhandled_narrative_walks_causes_outermost_first() {
        let sink = CaptureSink::new();
        let err = RuntimeError::caused_by(
            "request failed",
            RuntimeError::caused_by("connection reset", RuntimeError::new("peer gone")),
        );
        report_unhandled(&sink, &err);
        assert_eq!(
            sink.lines(),
            [
                "Unhandled exception: request failed",
                "Caused by: connection reset",
                "Caused by: peer gone",
            ]
        );
    }

    #[test]
    fn unhandled_without_cause_is_one_line() {
        let sink = CaptureSink::new();
        report_unhandled(&sink, &RuntimeError::new("lonely"));
        assert_eq!(sink.lines(), ["Unhandled exception: lonely"]);
    }
}
