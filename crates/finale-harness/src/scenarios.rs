//! Termination scenarios.
//!
//! Each scenario is a program main run under the process runtime by
//! `finale-harness run <name>`. The process it produces (exit status,
//! stdout lines, stderr text) is checked against [`Expectation`] by the
//! runner. Handlers print to stdout so ordering is observable.

use std::hint::black_box;

use finale_abi::fiber::{Fiber, FiberState};
use finale_abi::{runtime, thread};
use finale_core::fault::{INVALID_ACCESS_TEXT, STACK_OVERFLOW_TEXT};
use finale_core::{Handler, RuntimeConfig, RuntimeError};

const SIGSEGV_EXIT: i32 = 128 + 11;

/// What a scenario's process must look like.
#[derive(Debug, Clone, Copy)]
pub struct Expectation {
    pub exit_code: i32,
    /// Exact stdout, line by line.
    pub stdout: &'static [&'static str],
    pub stderr_contains: &'static [&'static str],
    pub stderr_absent: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    /// Extra environment for the child process.
    pub env: &'static [(&'static str, &'static str)],
    pub expected: Expectation,
    body: fn() -> Result<(), RuntimeError>,
}

impl Scenario {
    /// Run this scenario as the process main. Never returns.
    pub fn execute(&self, config: &RuntimeConfig) -> ! {
        runtime::run_main_with(config, self.body)
    }
}

const NO_OVERFLOW: &[&str] = &[STACK_OVERFLOW_TEXT];
const NO_PANIC_REPORT: &[&str] = &[STACK_OVERFLOW_TEXT, "panicked at"];

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "clean",
        description: "main returns normally, handlers drain in reverse order",
        env: &[],
        expected: Expectation {
            exit_code: 0,
            stdout: &["main done", "handler 2", "handler 1"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: clean,
    },
    Scenario {
        name: "reverse-order",
        description: "five handlers run most recent first",
        env: &[],
        expected: Expectation {
            exit_code: 0,
            stdout: &["handler 5", "handler 4", "handler 3", "handler 2", "handler 1"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: reverse_order,
    },
    Scenario {
        name: "nested-registration",
        description: "handlers registered while draining run next",
        env: &[],
        expected: Expectation {
            exit_code: 0,
            stdout: &["3", "4", "1", "2"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: nested_registration,
    },
    Scenario {
        name: "exit-code-chain",
        description: "a mid-drain exit(42) is seen by earlier-registered handlers",
        env: &[],
        expected: Expectation {
            exit_code: 42,
            stdout: &["h3 sees 0", "h1 sees 42"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: exit_code_chain,
    },
    Scenario {
        name: "exit-from-main",
        description: "explicit exit from main drains handlers and skips the rest of main",
        env: &[],
        expected: Expectation {
            exit_code: 5,
            stdout: &["main start", "handler sees 5"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: exit_from_main,
    },
    Scenario {
        name: "handler-raise",
        description: "a raising handler is reported and the drain continues",
        env: &[],
        expected: Expectation {
            exit_code: 1,
            stdout: &["h1 sees 1"],
            stderr_contains: &["Error running at_exit handler: cleanup failed"],
            stderr_absent: NO_OVERFLOW,
        },
        body: handler_raise,
    },
    Scenario {
        name: "raise-then-override",
        description: "an explicit exit drained after a raise decides the code",
        env: &[],
        expected: Expectation {
            exit_code: 7,
            stdout: &[],
            stderr_contains: &["Error running at_exit handler: boom"],
            stderr_absent: NO_OVERFLOW,
        },
        body: raise_then_override,
    },
    Scenario {
        name: "handler-panic",
        description: "a panicking handler counts as a raise",
        env: &[],
        expected: Expectation {
            exit_code: 1,
            stdout: &["after panic"],
            stderr_contains: &["Error running at_exit handler: handler panicked"],
            stderr_absent: NO_PANIC_REPORT,
        },
        body: handler_panic,
    },
    Scenario {
        name: "unhandled",
        description: "an error escaping main is reported after every handler",
        env: &[],
        expected: Expectation {
            exit_code: 1,
            stdout: &["h2 sees 1 outer", "h1 sees 1"],
            stderr_contains: &["Unhandled exception: outer", "Caused by: inner"],
            stderr_absent: NO_OVERFLOW,
        },
        body: unhandled,
    },
    Scenario {
        name: "panic-in-main",
        description: "a panic escaping main is an unhandled error",
        env: &[],
        expected: Expectation {
            exit_code: 1,
            stdout: &["handler sees 1"],
            stderr_contains: &["Unhandled exception: main panicked"],
            stderr_absent: NO_PANIC_REPORT,
        },
        body: panic_in_main,
    },
    Scenario {
        name: "nested-exit-in-handler",
        description: "exit(3) deep inside a handler abandons only that handler",
        env: &[],
        expected: Expectation {
            exit_code: 3,
            stdout: &["h2 start", "h1 sees 3"],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: nested_exit_in_handler,
    },
    Scenario {
        name: "fiber-clean",
        description: "a fiber suspends and resumes, then the process exits cleanly",
        env: &[],
        expected: Expectation {
            exit_code: 0,
            stdout: &[
                "fiber step 1",
                "main between",
                "fiber step 2",
                "fiber result 5",
                "handler",
            ],
            stderr_contains: &[],
            stderr_absent: NO_OVERFLOW,
        },
        body: fiber_clean,
    },
    Scenario {
        name: "null-deref",
        description: "an invalid read is reported as invalid memory access; no handler runs",
        env: &[],
        expected: Expectation {
            exit_code: SIGSEGV_EXIT,
            stdout: &["about to fault"],
            stderr_contains: &["Invalid memory access (signal 11) at address 0x10"],
            stderr_absent: NO_OVERFLOW,
        },
        body: null_deref,
    },
    Scenario {
        name: "null-deref-unreported",
        description: "with fault reporting off the platform default applies",
        env: &[("FINALE_FAULT_HANDLER", "off")],
        expected: Expectation {
            exit_code: SIGSEGV_EXIT,
            stdout: &["about to fault"],
            stderr_contains: &[],
            stderr_absent: &[STACK_OVERFLOW_TEXT, INVALID_ACCESS_TEXT],
        },
        body: null_deref,
    },
    Scenario {
        name: "overflow-main",
        description: "unbounded recursion on the primary stack",
        env: &[],
        expected: Expectation {
            exit_code: SIGSEGV_EXIT,
            stdout: &[],
            stderr_contains: &[STACK_OVERFLOW_TEXT],
            stderr_absent: &[INVALID_ACCESS_TEXT],
        },
        body: overflow_main,
    },
    Scenario {
        name: "overflow-fiber",
        description: "unbounded recursion on a fiber stack",
        env: &[],
        expected: Expectation {
            exit_code: SIGSEGV_EXIT,
            stdout: &[],
            stderr_contains: &[STACK_OVERFLOW_TEXT],
            stderr_absent: &[INVALID_ACCESS_TEXT],
        },
        body: overflow_fiber,
    },
    Scenario {
        name: "overflow-thread",
        description: "unbounded recursion on a runtime thread",
        env: &[],
        expected: Expectation {
            exit_code: SIGSEGV_EXIT,
            stdout: &[],
            stderr_contains: &[STACK_OVERFLOW_TEXT],
            stderr_absent: &[INVALID_ACCESS_TEXT],
        },
        body: overflow_thread,
    },
];

#[must_use]
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn print_handler(line: &'static str) -> Handler {
    Handler::plain(move || {
        println!("{line}");
        Ok(())
    })
}

fn clean() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler 1"));
    runtime::at_exit(print_handler("handler 2"));
    println!("main done");
    Ok(())
}

fn reverse_order() -> Result<(), RuntimeError> {
    for line in ["handler 1", "handler 2", "handler 3", "handler 4", "handler 5"] {
        runtime::at_exit(print_handler(line));
    }
    Ok(())
}

fn nested_registration() -> Result<(), RuntimeError> {
    for (outer, inner) in [("1", "2"), ("3", "4")] {
        runtime::at_exit(Handler::plain(move || {
            println!("{outer}");
            runtime::at_exit(print_handler(inner));
            Ok(())
        }));
    }
    Ok(())
}

fn exit_code_chain() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("h1 sees {code}");
        Ok(())
    }));
    runtime::at_exit(Handler::plain(|| runtime::exit(42)));
    runtime::at_exit(Handler::with_code(|code| {
        println!("h3 sees {code}");
        Ok(())
    }));
    Ok(())
}

fn exit_from_main() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("handler sees {code}");
        Ok(())
    }));
    println!("main start");
    runtime::exit(5)
}

fn handler_raise() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("h1 sees {code}");
        Ok(())
    }));
    runtime::at_exit(Handler::plain(|| Err(RuntimeError::new("cleanup failed").into())));
    Ok(())
}

fn raise_then_override() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::plain(|| runtime::exit(7)));
    runtime::at_exit(Handler::plain(|| Err(RuntimeError::new("boom").into())));
    Ok(())
}

fn handler_panic() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("after panic"));
    runtime::at_exit(Handler::plain(|| panic!("handler panicked")));
    Ok(())
}

fn unhandled() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("h1 sees {code}");
        Ok(())
    }));
    runtime::at_exit(Handler::with_error(|code, err| {
        let message = err.map_or("none", RuntimeError::message);
        println!("h2 sees {code} {message}");
        Ok(())
    }));
    Err(RuntimeError::caused_by("outer", RuntimeError::new("inner")))
}

fn panic_in_main() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("handler sees {code}");
        Ok(())
    }));
    panic!("main panicked")
}

#[inline(never)]
fn exit_at_depth(depth: u32, code: i32) {
    if depth == 0 {
        runtime::exit(code);
    }
    exit_at_depth(black_box(depth - 1), code);
}

fn nested_exit_in_handler() -> Result<(), RuntimeError> {
    runtime::at_exit(Handler::with_code(|code| {
        println!("h1 sees {code}");
        Ok(())
    }));
    runtime::at_exit(Handler::plain(|| {
        println!("h2 start");
        exit_at_depth(4, 3);
        println!("h2 unreachable");
        Ok(())
    }));
    Ok(())
}

fn fiber_clean() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler"));
    let mut fiber = Fiber::spawn(|y| {
        println!("fiber step 1");
        y.suspend();
        println!("fiber step 2");
        5
    })
    .map_err(|err| RuntimeError::from_error(&err))?;

    fiber.resume().map_err(|err| RuntimeError::from_error(&err))?;
    println!("main between");
    match fiber.resume().map_err(|err| RuntimeError::from_error(&err))? {
        FiberState::Finished(value) => println!("fiber result {value}"),
        FiberState::Suspended => return Err(RuntimeError::new("fiber did not finish")),
    }
    Ok(())
}

#[allow(unsafe_code)]
fn read_invalid_address() -> u8 {
    let addr = black_box(0x10_usize) as *const u8;
    // SAFETY: none; this read exists to fault.
    unsafe { addr.read_volatile() }
}

fn null_deref() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler ran"));
    println!("about to fault");
    let byte = read_invalid_address();
    println!("read {byte}");
    Ok(())
}

/// Recursion that keeps a 512-byte frame live and is not a tail call.
#[inline(never)]
fn recurse(depth: u64) -> u64 {
    let frame = black_box([depth.to_le_bytes()[0]; 512]);
    if depth == u64::MAX {
        return u64::from(frame[0]);
    }
    recurse(black_box(depth + 1)).wrapping_add(u64::from(frame[511]))
}

fn overflow_main() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler ran"));
    let total = recurse(0);
    println!("recursion returned {total}");
    Ok(())
}

fn overflow_fiber() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler ran"));
    let fiber = Fiber::spawn(|_| recurse(0)).map_err(|err| RuntimeError::from_error(&err))?;
    let total = fiber
        .run_to_completion()
        .map_err(|err| RuntimeError::from_error(&err))?;
    println!("recursion returned {total}");
    Ok(())
}

fn overflow_thread() -> Result<(), RuntimeError> {
    runtime::at_exit(print_handler("handler ran"));
    let worker = thread::spawn(|| recurse(0)).map_err(|err| RuntimeError::from_error(&err))?;
    let total = worker
        .join()
        .map_err(|payload| RuntimeError::from_panic(&*payload))?;
    println!("recursion returned {total}");
    Ok(())
}
