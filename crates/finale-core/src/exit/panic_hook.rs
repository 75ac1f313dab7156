//! Panic hook that stays quiet while the terminator owns the outcome.
//!
//! A panic in a shutdown handler or in the program main body is caught at
//! that boundary and reported as a handler error or an unhandled exception.
//! The default hook would print its own `panicked at` text first, so while a
//! `QuietPanics` guard is alive on a thread the installed hook says nothing.
//! Panics anywhere else go to the previously installed hook.

use std::cell::Cell;
use std::sync::Once;

thread_local! {
    static QUIET_DEPTH: Cell<u32> = const { Cell::new(0) };
}

static INSTALL: Once = Once::new();

/// Install the hook once per process, chaining to the hook it replaces.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !is_quiet() {
                previous(info);
            }
        }));
    });
}

/// True when panics on this thread are reported by the terminator.
#[must_use]
pub fn is_quiet() -> bool {
    QUIET_DEPTH.try_with(Cell::get).unwrap_or(0) > 0
}

/// Marks the current thread as running a caught body until dropped.
pub(crate) struct QuietPanics(());

impl QuietPanics {
    pub(crate) fn enter() -> Self {
        QUIET_DEPTH.with(|d| d.set(d.get() + 1));
        Self(())
    }
}

impl Drop for QuietPanics {
    fn drop(&mut self) {
        let _ = QUIET_DEPTH.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}
