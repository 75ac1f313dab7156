//! Process-wide runtime state.
//!
//! One [`Terminator`] and one [`StackRegistry`] live in statics so that
//! every entry point (Rust callers, the C ABI, the fault handler) sees the
//! same handler stack and the same table of stack regions.

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use finale_core::config::DEFAULT_FIBER_STACK_SIZE;
use finale_core::exit::panic_hook;
use finale_core::structured_log::{self, LogEmitter, LogEntry, LogLevel};
use finale_core::{
    Handler, OwnerId, RuntimeConfig, RuntimeError, StackRegistry, TerminationError, Terminator,
};

use crate::{AbiError, fault_abi, stack_abi};

static TERMINATOR: Terminator = Terminator::new();
static REGISTRY: StackRegistry = StackRegistry::new();

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static FIBER_STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_FIBER_STACK_SIZE);

thread_local! {
    // Raw owner id of the stack executing on this thread, 0 when unregistered.
    static CURRENT_OWNER: Cell<usize> = const { Cell::new(0) };
}

#[must_use]
pub fn terminator() -> &'static Terminator {
    &TERMINATOR
}

#[must_use]
pub fn registry() -> &'static StackRegistry {
    &REGISTRY
}

/// Owner of the stack the calling code is running on.
///
/// Reads a const-initialized thread local, so it is usable from the fault
/// handler; during thread teardown it reports no owner.
#[must_use]
pub fn current_owner() -> Option<OwnerId> {
    OwnerId::from_raw(CURRENT_OWNER.try_with(Cell::get).unwrap_or(0))
}

/// Set the current owner, returning the previous one.
pub(crate) fn swap_current_owner(owner: Option<OwnerId>) -> Option<OwnerId> {
    let raw = owner.map_or(0, OwnerId::as_raw);
    OwnerId::from_raw(CURRENT_OWNER.try_with(|c| c.replace(raw)).unwrap_or(0))
}

/// Usable size given to fibers spawned without an explicit size.
#[must_use]
pub fn fiber_stack_size() -> usize {
    FIBER_STACK_SIZE.load(Ordering::Relaxed)
}

#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// One-time process setup. Later calls are no-ops once a call succeeds.
///
/// Installs the log emitter and the panic hook, registers the primary stack
/// and, unless fault reporting is off, arms the SIGSEGV/SIGBUS handlers on an
/// alternate stack. A failed call leaves the runtime uninitialized.
pub fn init(config: &RuntimeConfig) -> Result<(), AbiError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    setup(config).inspect_err(|_| {
        if REGISTRY.unregister(OwnerId::PRIMARY).is_ok() {
            swap_current_owner(None);
        }
        INITIALIZED.store(false, Ordering::Release);
    })
}

fn setup(config: &RuntimeConfig) -> Result<(), AbiError> {
    panic_hook::install();
    if let Some(path) = &config.log_path {
        match LogEmitter::to_file(path) {
            Ok(emitter) => structured_log::install(emitter),
            Err(err) => eprintln!("finale: cannot open log {}: {err}", path.display()),
        }
    }
    FIBER_STACK_SIZE.store(config.fiber_stack_size, Ordering::Relaxed);

    register_primary()?;

    if config.fault_mode.installs_handlers() {
        fault_abi::install_alt_stack()?;
        fault_abi::install_fault_handlers()?;
        structured_log::emit(
            LogEntry::new(LogLevel::Info, "fault_handlers_installed")
                .with_message(config.fault_mode.as_str()),
        );
    }
    Ok(())
}

fn register_primary() -> Result<(), AbiError> {
    let stack = stack_abi::current_thread_stack()?;
    let region = stack.region(OwnerId::PRIMARY);
    REGISTRY.register(region)?;
    swap_current_owner(Some(OwnerId::PRIMARY));
    log_registered(OwnerId::PRIMARY, region.base, region.size, "primary");
    Ok(())
}

pub(crate) fn log_registered(owner: OwnerId, base: usize, size: usize, kind: &str) {
    structured_log::emit(
        LogEntry::new(LogLevel::Debug, "stack_registered")
            .with_owner(owner.as_raw())
            .with_details(serde_json::json!({
                "kind": kind,
                "base": format!("{base:#x}"),
                "size": size,
            })),
    );
}

pub(crate) fn log_unregistered(owner: OwnerId) {
    structured_log::emit(
        LogEntry::new(LogLevel::Debug, "stack_unregistered").with_owner(owner.as_raw()),
    );
}

/// Register a shutdown handler with the process terminator.
pub fn at_exit(handler: Handler) {
    TERMINATOR.at_exit(handler);
}

/// Current process exit code.
#[must_use]
pub fn exit_code() -> i32 {
    TERMINATOR.exit_code()
}

/// Run `body` as the program's main and end the process with the final code.
///
/// Configuration comes from the environment.
pub fn run_main<F>(body: F) -> !
where
    F: FnOnce() -> Result<(), RuntimeError>,
{
    run_main_with(&RuntimeConfig::from_env(), body)
}

/// [`run_main`] with an explicit configuration.
pub fn run_main_with<F>(config: &RuntimeConfig, body: F) -> !
where
    F: FnOnce() -> Result<(), RuntimeError>,
{
    if let Err(err) = init(config) {
        eprintln!("finale: fault reporting unavailable: {err}");
    }
    finish(TERMINATOR.run(body))
}

/// Explicit exit.
///
/// From a shutdown handler this abandons the rest of that handler and the
/// drain continues with `code`. Anywhere else it runs the shutdown pass and
/// ends the process.
///
/// Called from another thread while the drain is running, it never returns:
/// the caller parks, `code` is dropped (logged as `shutdown_rejected`) and the
/// draining thread decides the final code. A handler that joins such a thread
/// therefore never finishes.
pub fn exit(code: i32) -> ! {
    finish(TERMINATOR.request_exit(code))
}

fn finish(outcome: Result<i32, TerminationError>) -> ! {
    match outcome {
        Ok(code) => {
            flush_streams();
            std::process::exit(code)
        }
        // Another context owns the drain and will end the process.
        Err(TerminationError::AlreadyTerminating) => loop {
            std::thread::park();
        },
    }
}

fn flush_streams() {
    let _ = std::io::stdout().lock().flush();
    let _ = std::io::stderr().lock().flush();
    structured_log::flush();
}
