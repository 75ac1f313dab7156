//! Hardware fault classification.
//!
//! Everything here runs inside a SIGSEGV/SIGBUS handler: no heap, no locks.
//! The report is rendered with `core::fmt` into a fixed buffer owned by the
//! caller's stack frame.

use core::fmt::{self, Write};

use crate::stack::{OwnerId, StackClassification, StackRegistry};

pub const STACK_OVERFLOW_TEXT: &str = "Stack overflow (e.g., infinite or very deep recursion)";
pub const INVALID_ACCESS_TEXT: &str = "Invalid memory access";

const REPORT_CAPACITY: usize = 128;

/// What a fault turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    InvalidMemoryAccess,
    StackOverflow,
}

/// A rendered, newline-terminated diagnostic line held in a fixed buffer.
#[derive(Clone, Copy)]
pub struct FaultReport {
    kind: FaultKind,
    buf: [u8; REPORT_CAPACITY],
    len: usize,
}

impl FaultReport {
    fn empty(kind: FaultKind) -> Self {
        Self {
            kind,
            buf: [0; REPORT_CAPACITY],
            len: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.kind
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The report text. Always valid UTF-8 since only `&str` data is written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or(INVALID_ACCESS_TEXT)
    }
}

impl fmt::Debug for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReport")
            .field("kind", &self.kind)
            .field("text", &self.as_str())
            .finish()
    }
}

/// Truncating writer: output past the buffer is dropped, never an error,
/// so a long address can't cost the newline.
impl Write for FaultReport {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep one byte for the trailing newline.
        let room = REPORT_CAPACITY - 1 - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Consults a [`StackRegistry`] to explain a fault.
pub struct FaultClassifier<'a, const N: usize> {
    registry: &'a StackRegistry<N>,
}

impl<'a, const N: usize> FaultClassifier<'a, N> {
    #[must_use]
    pub const fn new(registry: &'a StackRegistry<N>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn classify(&self, addr: usize, current: Option<OwnerId>) -> FaultKind {
        match self.registry.classify(addr, current) {
            StackClassification::StackOverflow => FaultKind::StackOverflow,
            StackClassification::NotAStackFault => FaultKind::InvalidMemoryAccess,
        }
    }

    /// Classify and render the diagnostic line for `signal` at `addr`.
    #[must_use]
    pub fn diagnose(&self, signal: i32, addr: usize, current: Option<OwnerId>) -> FaultReport {
        render(self.classify(addr, current), signal, addr)
    }
}

/// Render the diagnostic line for an already classified fault.
#[must_use]
pub fn render(kind: FaultKind, signal: i32, addr: usize) -> FaultReport {
    let mut report = FaultReport::empty(kind);
    let _ = match kind {
        FaultKind::StackOverflow => report.write_str(STACK_OVERFLOW_TEXT),
        FaultKind::InvalidMemoryAccess => write!(
            report,
            "{INVALID_ACCESS_TEXT} (signal {signal}) at address {addr:#x}"
        ),
    };
    report.buf[report.len] = b'\n';
    report.len += 1;
    report
}
