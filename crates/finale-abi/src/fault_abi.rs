//! Hardware fault reporting.
//!
//! SIGSEGV and SIGBUS are caught on a per-thread alternate signal stack (the
//! faulting stack may have no room left), classified against the stack
//! registry, reported with a single `write(2)` loop and the process ends
//! with `_exit(128 + signal)`. Nothing in the handler allocates or locks.

use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use finale_core::FaultClassifier;
use parking_lot::Mutex;

use crate::stack_abi::page_size;
use crate::{AbiError, last_os_error, runtime};

/// Usable bytes of each thread's alternate signal stack.
pub const ALT_STACK_SIZE: usize = 64 * 1024;

/// Signals routed to the fault handler.
pub const FAULT_SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

static IN_FAULT: AtomicBool = AtomicBool::new(false);
static INSTALLED: Mutex<bool> = Mutex::new(false);

/// An mmap'd alternate signal stack, active for the thread that owns it.
struct AltStack {
    mapping: *mut c_void,
    total: usize,
}

impl AltStack {
    fn install() -> Result<Self, AbiError> {
        let page = page_size();
        let total = ALT_STACK_SIZE.max(libc::SIGSTKSZ) + page;
        // SAFETY: anonymous private mapping with no fd.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(AbiError::Map {
                size: total,
                source: last_os_error(),
            });
        }
        let stack = Self { mapping, total };

        // SAFETY: the lowest page of our own mapping becomes a guard.
        if unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) } != 0 {
            return Err(AbiError::Protect {
                source: last_os_error(),
            });
        }

        let ss = libc::stack_t {
            // SAFETY: `page < total`, so the offset stays inside the mapping.
            ss_sp: unsafe { mapping.cast::<u8>().add(page) }.cast(),
            ss_flags: 0,
            ss_size: total - page,
        };
        // SAFETY: `ss` describes a live read/write region owned by `stack`.
        if unsafe { libc::sigaltstack(&raw const ss, ptr::null_mut()) } != 0 {
            return Err(AbiError::AltStack {
                source: last_os_error(),
            });
        }
        Ok(stack)
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let disable = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        // SAFETY: disabling the alternate stack before unmapping it; the
        // mapping came from mmap in `install`.
        unsafe {
            libc::sigaltstack(&raw const disable, ptr::null_mut());
            libc::munmap(self.mapping, self.total);
        }
    }
}

thread_local! {
    static ALT_STACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
}

/// Give the calling thread an alternate signal stack. Idempotent per thread;
/// the stack is released when the thread exits.
pub fn install_alt_stack() -> Result<(), AbiError> {
    ALT_STACK.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(AltStack::install()?);
        }
        Ok(())
    })
}

#[must_use]
pub fn has_alt_stack() -> bool {
    ALT_STACK.with(|slot| slot.borrow().is_some())
}

/// Route SIGSEGV and SIGBUS to the classifying handler. Idempotent.
pub fn install_fault_handlers() -> Result<(), AbiError> {
    let mut installed = INSTALLED.lock();
    if *installed {
        return Ok(());
    }
    for signal in FAULT_SIGNALS {
        // SAFETY: zeroed sigaction is a valid starting value; the handler
        // has the SA_SIGINFO signature.
        let rc = unsafe {
            let mut action = std::mem::zeroed::<libc::sigaction>();
            action.sa_sigaction = fault_signal_handler as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&raw mut action.sa_mask);
            libc::sigaction(signal, &raw const action, ptr::null_mut())
        };
        if rc != 0 {
            return Err(AbiError::SignalInstall {
                signal,
                source: last_os_error(),
            });
        }
    }
    *installed = true;
    Ok(())
}

#[must_use]
pub fn fault_handlers_installed() -> bool {
    *INSTALLED.lock()
}

extern "C" fn fault_signal_handler(signal: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    // A second fault (another thread, or inside this handler) ends the
    // process without a second report.
    if IN_FAULT.swap(true, Ordering::AcqRel) {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(128 + signal) };
    }

    let addr = fault_address(info);
    let report =
        FaultClassifier::new(runtime::registry()).diagnose(signal, addr, runtime::current_owner());
    write_stderr(report.as_bytes());

    // SAFETY: _exit is async-signal-safe and skips every user-level hook.
    unsafe { libc::_exit(128 + signal) }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    unsafe { (*info).si_addr as usize }
}

/// Raw `write(2)` to fd 2, retrying short writes and EINTR.
fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid slice for the duration of the call.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n > 0 {
            bytes = &bytes[n.unsigned_abs().min(bytes.len())..];
        } else if n < 0 && last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alt_stack_install_is_per_thread_and_idempotent() {
        std::thread::spawn(|| {
            assert!(!has_alt_stack());
            install_alt_stack().unwrap();
            install_alt_stack().unwrap();
            assert!(has_alt_stack());

            let mut current = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: 0,
                ss_size: 0,
            };
            // SAFETY: querying only.
            let rc = unsafe { libc::sigaltstack(ptr::null(), &raw mut current) };
            assert_eq!(rc, 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= ALT_STACK_SIZE);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn write_stderr_accepts_empty_input() {
        write_stderr(b"");
    }
}
