//! Exit code, captured error and shutdown phase, behind one owner.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::RuntimeError;

const PHASE_IDLE: u8 = 0;
const PHASE_DRAINING: u8 = 1;
const PHASE_DRAINED: u8 = 2;

/// Where the process is in its single shutdown pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Idle,
    Draining,
    Drained,
}

impl ShutdownPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            PHASE_DRAINING => Self::Draining,
            PHASE_DRAINED => Self::Drained,
            _ => Self::Idle,
        }
    }
}

/// Process-wide termination state.
///
/// `captured` is the slot handlers observe: the unhandled program error, then
/// whatever a handler most recently raised. `unhandled` remembers the program
/// error separately so it can be reported once the drain finishes.
#[derive(Debug, Default)]
pub struct TerminationState {
    exit_code: AtomicI32,
    captured: Mutex<Option<RuntimeError>>,
    unhandled: Mutex<Option<RuntimeError>>,
    phase: AtomicU8,
}

impl TerminationState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exit_code: AtomicI32::new(0),
            captured: Mutex::new(None),
            unhandled: Mutex::new(None),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    #[must_use]
    pub fn captured(&self) -> Option<RuntimeError> {
        self.captured.lock().clone()
    }

    /// Overwrite the captured slot.
    pub fn capture(&self, err: RuntimeError) {
        *self.captured.lock() = Some(err);
    }

    /// Record an error that escaped the program's main body.
    pub fn record_unhandled(&self, err: RuntimeError) {
        self.capture(err.clone());
        *self.unhandled.lock() = Some(err);
    }

    /// Take the unhandled program error for reporting. Yields it once.
    pub fn take_unhandled(&self) -> Option<RuntimeError> {
        self.unhandled.lock().take()
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Claim the single drain. First caller wins; everyone else gets the
    /// phase they lost to.
    pub fn begin_drain(&self) -> Result<(), ShutdownPhase> {
        self.phase
            .compare_exchange(
                PHASE_IDLE,
                PHASE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ShutdownPhase::from_u8)
    }

    pub fn finish_drain(&self) {
        self.phase.store(PHASE_DRAINED, Ordering::Release);
    }
}
