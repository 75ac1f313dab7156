//! The termination funnel.
//!
//! Every way a program ends (main body returns, main body fails, explicit
//! request) enters through [`Terminator`], which admits exactly one drain.
//! A request issued by a handler while that drain runs on the same thread is
//! turned into an [`ExitRequest`] unwind and caught by the sequencer at the
//! handler boundary; it never starts a second drain.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crate::diagnostics::{DiagnosticSink, StderrSink};
use crate::error::{RuntimeError, TerminationError};
use crate::exit::handlers::{ExitHandlerStack, ExitRequest, Handler};
use crate::exit::panic_hook::QuietPanics;
use crate::exit::sequencer::ShutdownSequencer;
use crate::exit::state::{ShutdownPhase, TerminationState};
use crate::structured_log::{self, LogEntry, LogLevel};

thread_local! {
    // Address of the terminator draining on this thread, 0 when none.
    static DRAINING: Cell<usize> = const { Cell::new(0) };
}

/// Restores the previous `DRAINING` marker when the drain ends, even by unwind.
struct DrainMarker {
    previous: usize,
}

impl DrainMarker {
    fn enter(id: usize) -> Self {
        Self {
            previous: DRAINING.with(|d| d.replace(id)),
        }
    }
}

impl Drop for DrainMarker {
    fn drop(&mut self) {
        DRAINING.with(|d| d.set(self.previous));
    }
}

#[derive(Debug)]
enum Trigger {
    Completed,
    ExitRequested(i32),
    Unhandled(RuntimeError),
}

impl Trigger {
    fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ExitRequested(_) => "exit_requested",
            Self::Unhandled(_) => "unhandled_error",
        }
    }
}

/// Owner of the handler stack and termination state for one process.
#[derive(Debug)]
pub struct Terminator<S: DiagnosticSink = StderrSink> {
    handlers: ExitHandlerStack,
    state: TerminationState,
    sink: S,
}

impl Terminator<StderrSink> {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_sink(StderrSink)
    }
}

impl Default for Terminator<StderrSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DiagnosticSink> Terminator<S> {
    #[must_use]
    pub const fn with_sink(sink: S) -> Self {
        Self {
            handlers: ExitHandlerStack::new(),
            state: TerminationState::new(),
            sink,
        }
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[must_use]
    pub fn state(&self) -> &TerminationState {
        &self.state
    }

    /// Register a shutdown handler. Legal from any thread, and from inside a
    /// running handler, where the new handler runs next.
    pub fn at_exit(&self, handler: Handler) {
        self.handlers.push(handler);
    }

    #[must_use]
    pub fn pending_handlers(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        self.state.phase()
    }

    /// True when this thread is inside this terminator's drain.
    #[must_use]
    pub fn is_draining_here(&self) -> bool {
        DRAINING.with(Cell::get) == self.id()
    }

    /// Explicit termination request.
    ///
    /// Outside a drain this runs the shutdown pass and returns the final
    /// code. Inside a handler it does not return: the rest of the handler's
    /// body is abandoned, the exit code becomes `code`, and the drain moves on
    /// to the next handler.
    pub fn request_exit(&self, code: i32) -> Result<i32, TerminationError> {
        self.shutdown(Trigger::ExitRequested(code))
    }

    /// The program's main body returned normally.
    pub fn complete(&self) -> Result<i32, TerminationError> {
        self.shutdown(Trigger::Completed)
    }

    /// An error escaped the program's main body.
    pub fn fail(&self, err: RuntimeError) -> Result<i32, TerminationError> {
        self.shutdown(Trigger::Unhandled(err))
    }

    /// Run a program main body and drive the process to its final code.
    ///
    /// An `ExitRequest` unwinding out of the body is an explicit request; any
    /// other panic counts as an unhandled error.
    pub fn run<F>(&self, body: F) -> Result<i32, TerminationError>
    where
        F: FnOnce() -> Result<(), RuntimeError>,
    {
        let outcome = {
            let _quiet = QuietPanics::enter();
            panic::catch_unwind(AssertUnwindSafe(body))
        };
        match outcome {
            Ok(Ok(())) => self.complete(),
            Ok(Err(err)) => self.fail(err),
            Err(payload) => match payload.downcast::<ExitRequest>() {
                Ok(request) => self.request_exit(request.code),
                Err(payload) => self.fail(RuntimeError::from_panic(&*payload)),
            },
        }
    }

    fn id(&self) -> usize {
        std::ptr::from_ref(self).addr()
    }

    fn shutdown(&self, trigger: Trigger) -> Result<i32, TerminationError> {
        if self.is_draining_here() {
            return self.nested(trigger);
        }

        match self.state.begin_drain() {
            Ok(()) => {}
            Err(ShutdownPhase::Drained) => {
                // Nothing runs twice; an explicit code still sticks.
                if let Trigger::ExitRequested(code) = trigger {
                    self.state.set_exit_code(code);
                }
                return Ok(self.state.exit_code());
            }
            Err(_) => {
                let mut entry =
                    LogEntry::new(LogLevel::Warn, "shutdown_rejected").with_message(trigger.name());
                if let Trigger::ExitRequested(code) = trigger {
                    entry = entry.with_exit_code(code);
                }
                structured_log::emit(entry);
                return Err(TerminationError::AlreadyTerminating);
            }
        }

        match &trigger {
            Trigger::Completed => self.state.set_exit_code(0),
            Trigger::ExitRequested(code) => self.state.set_exit_code(*code),
            Trigger::Unhandled(err) => {
                self.state.record_unhandled(err.clone());
                self.state.set_exit_code(1);
            }
        }
        structured_log::emit(
            LogEntry::new(LogLevel::Info, "shutdown_begin")
                .with_exit_code(self.state.exit_code())
                .with_message(trigger.name())
                .with_details(serde_json::json!({ "handlers": self.handlers.len() })),
        );

        let code = {
            let _marker = DrainMarker::enter(self.id());
            ShutdownSequencer::new(&self.handlers, &self.state, &self.sink).run()
        };
        self.state.finish_drain();

        structured_log::emit(LogEntry::new(LogLevel::Info, "shutdown_complete").with_exit_code(code));
        structured_log::flush();
        Ok(code)
    }

    /// A termination path entered from inside one of our own handlers.
    fn nested(&self, trigger: Trigger) -> Result<i32, TerminationError> {
        match trigger {
            Trigger::ExitRequested(code) => panic::resume_unwind(Box::new(ExitRequest { code })),
            Trigger::Unhandled(err) => panic::resume_unwind(Box::new(err)),
            Trigger::Completed => Ok(self.state.exit_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CaptureSink;
    use crate::exit::handlers::HandlerEscape;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn terminator() -> Arc<Terminator<CaptureSink>> {
        Arc::new(Terminator::with_sink(CaptureSink::new()))
    }

    #[test]
    fn clean_completion_exits_zero() {
        let t = terminator();
        assert_eq!(t.run(|| Ok(())), Ok(0));
        assert_eq!(t.phase(), ShutdownPhase::Drained);
        assert!(t.sink().lines().is_empty());
    }

    #[test]
    fn nested_request_abandons_body_and_keeps_draining() {
        let t = terminator();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&log);
        t.at_exit(Handler::with_code(move |code| {
            first.lock().push(format!("first sees {code}"));
            Ok(())
        }));
        let inner_t = Arc::clone(&t);
        let second = Arc::clone(&log);
        t.at_exit(Handler::plain(move || {
            second.lock().push("second starts".to_owned());
            let _ = inner_t.request_exit(3);
            second.lock().push("second resumed".to_owned());
            Ok(())
        }));

        assert_eq!(t.run(|| Ok(())), Ok(3));
        assert_eq!(*log.lock(), ["second starts", "first sees 3"]);
    }

    #[test]
    fn shutdown_twice_runs_nothing_twice() {
        let t = terminator();
        let runs = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&runs);
        t.at_exit(Handler::plain(move || {
            *counter.lock() += 1;
            Ok(())
        }));

        assert_eq!(t.fail(RuntimeError::new("once")), Ok(1));
        assert_eq!(t.complete(), Ok(1));
        assert_eq!(t.request_exit(4), Ok(4));
        assert_eq!(*runs.lock(), 1);
        assert_eq!(t.sink().lines(), ["Unhandled exception: once"]);
    }

    #[test]
    fn explicit_request_from_body_drains_once() {
        let t = terminator();
        let inner = Arc::clone(&t);
        let result = t.run(move || {
            assert_eq!(inner.request_exit(12), Ok(12));
            Ok(())
        });
        assert_eq!(result, Ok(12));
    }

    #[test]
    fn exit_request_unwinding_out_of_body_is_explicit() {
        let t = terminator();
        let result = t.run(|| panic::resume_unwind(Box::new(ExitRequest { code: 8 })));
        assert_eq!(result, Ok(8));
        assert!(t.sink().lines().is_empty());
    }

    #[test]
    fn panicking_body_is_unhandled() {
        let t = terminator();
        let result = t.run(|| panic::resume_unwind(Box::new("body blew up")));
        assert_eq!(result, Ok(1));
        assert_eq!(t.sink().lines(), ["Unhandled exception: body blew up"]);
    }

    #[test]
    fn nested_fail_counts_as_handler_error() {
        let t = terminator();
        let inner = Arc::clone(&t);
        t.at_exit(Handler::plain(move || {
            let _ = inner.fail(RuntimeError::new("nested failure"));
            Ok(())
        }));
        assert_eq!(t.complete(), Ok(1));
        assert_eq!(
            t.sink().lines(),
            ["Error running at_exit handler: nested failure"]
        );
    }

    #[test]
    fn handlers_registered_mid_drain_run_next() {
        let t = terminator();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (label, nested) in [(1, 2), (3, 4)] {
            let outer_log = Arc::clone(&log);
            let registrar = Arc::clone(&t);
            t.at_exit(Handler::plain(move || {
                outer_log.lock().push(label);
                let inner_log = Arc::clone(&outer_log);
                registrar.at_exit(Handler::plain(move || {
                    inner_log.lock().push(nested);
                    Ok(())
                }));
                Ok(())
            }));
        }
        assert_eq!(t.complete(), Ok(0));
        assert_eq!(*log.lock(), [3, 4, 1, 2]);
    }

    #[test]
    fn concurrent_entry_while_draining_is_rejected() {
        let t = terminator();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        t.at_exit(Handler::plain(move || {
            entered_tx.send(()).ok();
            release_rx.recv().ok();
            Ok(())
        }));

        let drainer = {
            let t = Arc::clone(&t);
            std::thread::spawn(move || t.request_exit(2))
        };
        entered_rx.recv().unwrap();
        assert_eq!(t.request_exit(9), Err(TerminationError::AlreadyTerminating));
        release_tx.send(()).unwrap();
        assert_eq!(drainer.join().unwrap(), Ok(2));
        assert_eq!(t.exit_code(), 2);
    }

    #[test]
    fn exit_request_escape_and_raise_interleave() {
        let t = terminator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = Arc::clone(&seen);
        t.at_exit(Handler::with_error(move |code, err| {
            watcher
                .lock()
                .push((code, err.map(|e| e.message().to_owned())));
            Ok(())
        }));
        t.at_exit(Handler::plain(|| Err(HandlerEscape::ExitRequested(30))));
        t.at_exit(Handler::plain(|| Err(RuntimeError::new("first").into())));

        assert_eq!(t.complete(), Ok(30));
        assert_eq!(*seen.lock(), [(30, Some("first".to_owned()))]);
    }
}
