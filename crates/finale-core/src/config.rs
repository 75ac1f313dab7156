//! Runtime configuration.
//!
//! Configuration comes from the environment:
//! - `FINALE_FAULT_HANDLER`: `report` (default) installs the SIGSEGV/SIGBUS
//!   classifier; `off` leaves the platform's default fault disposition alone.
//! - `FINALE_LOG`: path of a JSONL structured log of termination events.
//! - `FINALE_FIBER_STACK_SIZE`: usable bytes per fiber stack.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

/// Usable fiber stack size when nothing is configured.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;

/// Smallest fiber stack the runtime will allocate.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Largest fiber stack the runtime will allocate.
pub const MAX_FIBER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Whether hardware faults are classified and reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultMode {
    /// Install handlers that print `Stack overflow` / `Invalid memory access`.
    #[default]
    Report,
    /// Leave fault signals at their inherited disposition.
    Off,
}

impl FaultMode {
    /// Parse from string (case-insensitive). Unknown values select `Report`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "0" => Self::Off,
            _ => Self::Report,
        }
    }

    #[must_use]
    pub const fn installs_handlers(self) -> bool {
        matches!(self, Self::Report)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Off => "off",
        }
    }
}

// 0=unresolved, 1=Report, 2=Off, 255=resolving.
static CACHED_FAULT_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_REPORT: u8 = 1;
const MODE_OFF: u8 = 2;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: FaultMode) -> u8 {
    match mode {
        FaultMode::Report => MODE_REPORT,
        FaultMode::Off => MODE_OFF,
    }
}

fn u8_to_mode(v: u8) -> FaultMode {
    match v {
        MODE_OFF => FaultMode::Off,
        _ => FaultMode::Report,
    }
}

/// Get the configured fault mode (reads the environment once, caches thereafter).
///
/// A caller racing the first resolution sees `Report` until it completes.
#[must_use]
pub fn fault_mode() -> FaultMode {
    let cached = CACHED_FAULT_MODE.load(Ordering::Relaxed);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING {
        return FaultMode::Report;
    }

    if CACHED_FAULT_MODE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_FAULT_MODE.load(Ordering::Relaxed);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            FaultMode::Report
        };
    }

    let mode = std::env::var("FINALE_FAULT_HANDLER")
        .map(|v| FaultMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_FAULT_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}

/// Clamp a requested fiber stack size into the supported range.
#[must_use]
pub fn clamp_fiber_stack_size(requested: usize) -> usize {
    requested.clamp(MIN_FIBER_STACK_SIZE, MAX_FIBER_STACK_SIZE)
}

fn parse_stack_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, scale) = match raw.as_bytes().last().map(u8::to_ascii_lowercase) {
        Some(b'k') => (&raw[..raw.len() - 1], 1024),
        Some(b'm') => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub fault_mode: FaultMode,
    pub log_path: Option<PathBuf>,
    pub fiber_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fault_mode: FaultMode::Report,
            log_path: None,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Read every `FINALE_*` variable. The fault mode goes through the
    /// process-wide cache so every caller agrees on it.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.fault_mode = fault_mode();
        config
    }

    /// Build from an arbitrary key lookup (the environment, a test map, ...).
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fault_mode = lookup("FINALE_FAULT_HANDLER")
            .map(|v| FaultMode::from_str_loose(&v))
            .unwrap_or_default();
        let log_path = lookup("FINALE_LOG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let fiber_stack_size = lookup("FINALE_FIBER_STACK_SIZE")
            .and_then(|v| parse_stack_size(&v))
            .map_or(DEFAULT_FIBER_STACK_SIZE, clamp_fiber_stack_size);
        Self {
            fault_mode,
            log_path,
            fiber_stack_size,
        }
    }

    #[must_use]
    pub fn with_fault_mode(mut self, mode: FaultMode) -> Self {
        self.fault_mode = mode;
        self
    }

    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_fiber_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = clamp_fiber_stack_size(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_fault_modes() {
        assert_eq!(FaultMode::from_str_loose("report"), FaultMode::Report);
        assert_eq!(FaultMode::from_str_loose("ON"), FaultMode::Report);
        assert_eq!(FaultMode::from_str_loose("off"), FaultMode::Off);
        assert_eq!(FaultMode::from_str_loose(" Disabled "), FaultMode::Off);
        assert_eq!(FaultMode::from_str_loose("none"), FaultMode::Off);
        assert_eq!(FaultMode::from_str_loose("bogus"), FaultMode::Report);
    }

    #[test]
    fn default_config_reports_faults() {
        let config = RuntimeConfig::default();
        assert!(config.fault_mode.installs_handlers());
        assert_eq!(config.log_path, None);
        assert_eq!(config.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
    }

    #[test]
    fn lookup_reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("FINALE_FAULT_HANDLER", "off"),
            ("FINALE_LOG", "/tmp/finale.jsonl"),
            ("FINALE_FIBER_STACK_SIZE", "512k"),
        ]));
        assert_eq!(config.fault_mode, FaultMode::Off);
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/finale.jsonl")));
        assert_eq!(config.fiber_stack_size, 512 * 1024);
    }

    #[test]
    fn stack_size_is_clamped_and_garbage_ignored() {
        let tiny = RuntimeConfig::from_lookup(lookup_from(&[("FINALE_FIBER_STACK_SIZE", "1")]));
        assert_eq!(tiny.fiber_stack_size, MIN_FIBER_STACK_SIZE);
        let huge = RuntimeConfig::from_lookup(lookup_from(&[("FINALE_FIBER_STACK_SIZE", "9000m")]));
        assert_eq!(huge.fiber_stack_size, MAX_FIBER_STACK_SIZE);
        let junk = RuntimeConfig::from_lookup(lookup_from(&[("FINALE_FIBER_STACK_SIZE", "lots")]));
        assert_eq!(junk.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
        let empty_log = RuntimeConfig::from_lookup(lookup_from(&[("FINALE_LOG", "  ")]));
        assert_eq!(empty_log.log_path, None);
    }

    #[test]
    fn builders_override_fields() {
        let config = RuntimeConfig::default()
            .with_fault_mode(FaultMode::Off)
            .with_log_path("out.jsonl")
            .with_fiber_stack_size(1);
        assert_eq!(config.fault_mode, FaultMode::Off);
        assert_eq!(config.log_path, Some(PathBuf::from("out.jsonl")));
        assert_eq!(config.fiber_stack_size, MIN_FIBER_STACK_SIZE);
    }

    #[test]
    fn cached_mode_is_process_sticky_until_cache_reset() {
        let previous = CACHED_FAULT_MODE.swap(MODE_OFF, Ordering::SeqCst);
        assert_eq!(fault_mode(), FaultMode::Off);
        CACHED_FAULT_MODE.store(MODE_REPORT, Ordering::SeqCst);
        assert_eq!(fault_mode(), FaultMode::Report);
        CACHED_FAULT_MODE.store(MODE_RESOLVING, Ordering::SeqCst);
        assert_eq!(fault_mode(), FaultMode::Report);
        CACHED_FAULT_MODE.store(previous, Ordering::SeqCst);
    }
}
