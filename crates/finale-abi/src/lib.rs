//! # finale-abi
//!
//! The unsafe half of finale: everything that touches the OS.
//!
//! - [`runtime`]: the process-wide terminator and stack registry, program
//!   entry ([`runtime::run_main`]) and explicit exit.
//! - [`fault_abi`]: SIGSEGV/SIGBUS handlers and per-thread alternate signal stacks.
//! - [`stack_abi`]: mmap'd fiber stacks with guard zones, thread stack discovery.
//! - [`fiber`]: stackful fibers registered with the stack registry.
//! - [`thread`]: OS threads prepared for fault reporting.
//! - [`exit_abi`]: `extern "C-unwind"` entry points.

#![cfg(unix)]

pub mod exit_abi;
pub mod fault_abi;
pub mod fiber;
pub mod runtime;
pub mod stack_abi;
pub mod thread;

use finale_core::RegistryError;

/// Failures at the OS boundary.
#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("mprotect of guard zone failed: {source}")]
    Protect {
        #[source]
        source: std::io::Error,
    },
    #[error("sigaltstack failed: {source}")]
    AltStack {
        #[source]
        source: std::io::Error,
    },
    #[error("sigaction({signal}) failed: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("pthread_getattr_np failed with code {code}")]
    ThreadAttr { code: i32 },
    #[error("fiber {owner} has already finished")]
    FiberFinished { owner: usize },
    #[error("failed to spawn thread: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub(crate) fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}
