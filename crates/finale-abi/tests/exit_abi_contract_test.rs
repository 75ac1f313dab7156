//! Integration tests for the C termination ABI and runtime plumbing that
//! can run without ending the test process.

use std::ffi::c_int;
use std::sync::atomic::{AtomicI32, Ordering};

use finale_abi::exit_abi::{finale_at_exit, finale_at_exit_status, finale_exit_code};
use finale_abi::fiber::{Fiber, FiberState};
use finale_abi::runtime;
use finale_core::{FaultClassifier, FaultKind, FaultMode, OwnerId, RuntimeConfig, ShutdownPhase};

static STATUS_SEEN: AtomicI32 = AtomicI32::new(-1);

unsafe extern "C-unwind" fn noop_hook() {}

unsafe extern "C-unwind" fn status_hook(code: c_int) {
    STATUS_SEEN.store(code, Ordering::Relaxed);
}

#[test]
fn null_hooks_are_rejected() {
    // SAFETY: null is explicitly handled.
    assert_eq!(unsafe { finale_at_exit(None) }, -1);
    // SAFETY: null is explicitly handled.
    assert_eq!(unsafe { finale_at_exit_status(None) }, -1);
}

#[test]
fn registration_queues_without_running() {
    let before = runtime::terminator().pending_handlers();
    // SAFETY: hooks are plain functions with no preconditions.
    unsafe {
        assert_eq!(finale_at_exit(Some(noop_hook)), 0);
        assert_eq!(finale_at_exit_status(Some(status_hook)), 0);
    }
    assert!(runtime::terminator().pending_handlers() >= before + 2);
    assert_eq!(STATUS_SEEN.load(Ordering::Relaxed), -1);
    assert_eq!(runtime::terminator().phase(), ShutdownPhase::Idle);
    assert_eq!(finale_exit_code(), 0);
}

#[test]
fn init_registers_primary_stack_once() {
    let config = RuntimeConfig::default().with_fault_mode(FaultMode::Off);
    std::thread::spawn(move || {
        runtime::init(&config).unwrap();
        runtime::init(&config).unwrap();
        assert!(runtime::is_initialized());
        assert_eq!(runtime::current_owner(), Some(OwnerId::PRIMARY));
        let region = runtime::registry().region(OwnerId::PRIMARY).unwrap();
        let local = 0_u32;
        assert!(region.contains(std::ptr::addr_of!(local) as usize));
    })
    .join()
    .unwrap();
}

#[test]
fn fiber_guard_zone_classifies_as_overflow_only_inside_the_fiber() {
    let mut fiber = Fiber::spawn(|y| {
        y.suspend();
    })
    .unwrap();
    let owner = fiber.owner();
    let region = runtime::registry().region(owner).unwrap();
    let classifier = FaultClassifier::new(runtime::registry());
    let guard_addr = region.base - 8;

    assert_eq!(classifier.classify(guard_addr, Some(owner)), FaultKind::StackOverflow);
    assert_eq!(
        classifier.classify(guard_addr, Some(OwnerId::PRIMARY)),
        FaultKind::InvalidMemoryAccess
    );
    assert_eq!(classifier.classify(0x10, Some(owner)), FaultKind::InvalidMemoryAccess);

    assert_eq!(fiber.resume().unwrap(), FiberState::Suspended);
    assert_eq!(fiber.resume().unwrap(), FiberState::Finished(()));
    drop(fiber);
    assert_eq!(classifier.classify(guard_addr, Some(owner)), FaultKind::InvalidMemoryAccess);
}

#[test]
fn configured_fiber_size_is_respected() {
    let fiber = Fiber::with_stack_size(512 * 1024, |_| ()).unwrap();
    let region = runtime::registry().region(fiber.owner()).unwrap();
    assert!(region.size >= 512 * 1024);
}
