//! C entry points for the termination path.
//!
//! All functions use the `C-unwind` ABI: `finale_exit` called from inside a
//! registered handler unwinds back through the caller's frames to the drain
//! loop, which requires every frame in between to permit unwinding.

use std::ffi::c_int;

use finale_core::{Handler, RuntimeConfig};

use crate::runtime;

/// `void (*)(void)` shutdown hook.
pub type ExitHook = unsafe extern "C-unwind" fn();
/// `void (*)(int)` shutdown hook receiving the current exit code.
pub type ExitStatusHook = unsafe extern "C-unwind" fn(c_int);
/// `int (*)(void)` program main.
pub type MainFn = unsafe extern "C-unwind" fn() -> c_int;

/// Register a hook run at shutdown, most recent first. Returns 0, or -1 for
/// a null hook.
///
/// # Safety
///
/// `hook` must be safe to call once from any thread during shutdown.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn finale_at_exit(hook: Option<ExitHook>) -> c_int {
    let Some(hook) = hook else {
        return -1;
    };
    runtime::at_exit(Handler::plain(move || {
        // SAFETY: upheld by the registering caller.
        unsafe { hook() };
        Ok(())
    }));
    0
}

/// Register a hook receiving the exit code current when it runs. Returns 0,
/// or -1 for a null hook.
///
/// # Safety
///
/// `hook` must be safe to call once from any thread during shutdown.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn finale_at_exit_status(hook: Option<ExitStatusHook>) -> c_int {
    let Some(hook) = hook else {
        return -1;
    };
    runtime::at_exit(Handler::with_code(move |code| {
        // SAFETY: upheld by the registering caller.
        unsafe { hook(code) };
        Ok(())
    }));
    0
}

/// Terminate with `code`. Inside a hook, abandons the hook and sets the code.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn finale_exit(code: c_int) -> ! {
    runtime::exit(code)
}

/// The exit code as of now.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn finale_exit_code() -> c_int {
    runtime::exit_code()
}

/// Initialize from the environment, run `main`, drain hooks and exit.
///
/// A nonzero return from `main` is an explicit exit with that code; a null
/// `main` exits with 0 after draining.
///
/// # Safety
///
/// `main` must be safe to call once on the calling thread.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn finale_start(main: Option<MainFn>) -> ! {
    runtime::run_main_with(&RuntimeConfig::from_env(), move || {
        let code = match main {
            // SAFETY: upheld by the caller.
            Some(main) => unsafe { main() },
            None => 0,
        };
        if code != 0 {
            runtime::exit(code);
        }
        Ok(())
    })
}
