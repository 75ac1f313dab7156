//! OS threads prepared for fault reporting.
//!
//! A thread started through [`spawn`] gets its own alternate signal stack
//! and registers its stack bounds under a fresh owner, so an overflow on it
//! reports `Stack overflow` just like the primary thread.

use std::thread::JoinHandle;

use finale_core::OwnerId;
use finale_core::structured_log::{self, LogEntry, LogLevel};

use crate::{AbiError, fault_abi, runtime, stack_abi};

/// Keeps the calling thread's stack registered; dropping it unregisters.
#[derive(Debug)]
pub struct ThreadRegistration {
    owner: OwnerId,
    previous: Option<OwnerId>,
}

impl ThreadRegistration {
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        runtime::swap_current_owner(self.previous);
        if runtime::registry().unregister(self.owner).is_ok() {
            runtime::log_unregistered(self.owner);
        }
    }
}

/// Register the calling thread's stack and give it an alternate signal stack.
pub fn prepare_current_thread() -> Result<ThreadRegistration, AbiError> {
    fault_abi::install_alt_stack()?;
    let owner = OwnerId::next();
    let region = stack_abi::current_thread_stack()?.region(owner);
    runtime::registry().register(region)?;
    runtime::log_registered(owner, region.base, region.size, "thread");
    Ok(ThreadRegistration {
        owner,
        previous: runtime::swap_current_owner(Some(owner)),
    })
}

/// [`std::thread::spawn`] for code that should get fault reports.
pub fn spawn<F, T>(body: F) -> Result<JoinHandle<T>, AbiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_with(std::thread::Builder::new(), body)
}

/// [`spawn`] with a caller-configured builder (name, stack size).
pub fn spawn_with<F, T>(builder: std::thread::Builder, body: F) -> Result<JoinHandle<T>, AbiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    builder
        .spawn(move || {
            let _registration = match prepare_current_thread() {
                Ok(registration) => Some(registration),
                Err(err) => {
                    structured_log::emit(
                        LogEntry::new(LogLevel::Warn, "thread_unregistered")
                            .with_message(err.to_string()),
                    );
                    None
                }
            };
            body()
        })
        .map_err(|source| AbiError::Spawn { source })
}
