//! The single shutdown pass: drain handlers, thread code and error through
//! them, then report whatever escaped the program.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::diagnostics::{self, DiagnosticSink};
use crate::error::{ChainDisplay, RuntimeError};
use crate::exit::handlers::{ExitHandlerStack, ExitRequest, Handler, HandlerEscape};
use crate::exit::panic_hook::QuietPanics;
use crate::exit::state::TerminationState;
use crate::structured_log::{self, LogEntry, LogLevel};

/// Drains an [`ExitHandlerStack`] against a [`TerminationState`].
///
/// Callers are responsible for running this at most once; see
/// [`TerminationState::begin_drain`].
pub struct ShutdownSequencer<'a, S: DiagnosticSink + ?Sized> {
    handlers: &'a ExitHandlerStack,
    state: &'a TerminationState,
    sink: &'a S,
}

impl<'a, S: DiagnosticSink + ?Sized> ShutdownSequencer<'a, S> {
    #[must_use]
    pub fn new(handlers: &'a ExitHandlerStack, state: &'a TerminationState, sink: &'a S) -> Self {
        Self {
            handlers,
            state,
            sink,
        }
    }

    /// Drain every handler, report any unhandled program error, and return
    /// the final exit code.
    pub fn run(&self) -> i32 {
        self.handlers.drain(|handler| self.invoke(handler));

        if let Some(err) = self.state.take_unhandled() {
            diagnostics::report_unhandled(self.sink, &err);
            self.state.set_exit_code(1);
            structured_log::emit(
                LogEntry::new(LogLevel::Error, "unhandled_exception")
                    .with_exit_code(1)
                    .with_message(ChainDisplay(&err).to_string()),
            );
        }
        self.sink.flush();
        self.state.exit_code()
    }

    /// Run one handler with the state as it stands right now. Whatever way
    /// the body leaves, control comes back here and the drain goes on.
    fn invoke(&self, handler: Handler) {
        let code = self.state.exit_code();
        let error = self.state.captured();

        let outcome = {
            let _quiet = QuietPanics::enter();
            panic::catch_unwind(AssertUnwindSafe(move || handler.call(code, error.as_ref())))
        };
        let escape = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(escape)) => escape,
            Err(payload) => escape_from_unwind(payload),
        };

        match escape {
            HandlerEscape::ExitRequested(code) => {
                self.state.set_exit_code(code);
                structured_log::emit(
                    LogEntry::new(LogLevel::Info, "handler_exit_request").with_exit_code(code),
                );
            }
            HandlerEscape::Raised(err) => {
                diagnostics::report_handler_error(self.sink, &err);
                structured_log::emit(
                    LogEntry::new(LogLevel::Error, "handler_error")
                        .with_exit_code(1)
                        .with_message(ChainDisplay(&err).to_string()),
                );
                self.state.capture(err);
                self.state.set_exit_code(1);
            }
        }
    }
}

fn escape_from_unwind(payload: Box<dyn Any + Send>) -> HandlerEscape {
    match payload.downcast::<ExitRequest>() {
        Ok(request) => HandlerEscape::ExitRequested(request.code),
        Err(payload) => HandlerEscape::Raised(RuntimeError::from_panic(&*payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CaptureSink;
    use std::sync::Arc;

    use parking_lot::Mutex;

    struct Fixture {
        handlers: ExitHandlerStack,
        state: TerminationState,
        sink: CaptureSink,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                handlers: ExitHandlerStack::new(),
                state: TerminationState::new(),
                sink: CaptureSink::new(),
            }
        }

        fn run(&self) -> i32 {
            ShutdownSequencer::new(&self.handlers, &self.state, &self.sink).run()
        }
    }

    #[test]
    fn handlers_observe_code_as_of_their_turn() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let h1 = Arc::clone(&seen);
        fx.handlers.push(Handler::with_code(move |code| {
            h1.lock().push(("h1", code));
            Ok(())
        }));
        fx.handlers
            .push(Handler::plain(|| Err(HandlerEscape::ExitRequested(42))));
        let h3 = Arc::clone(&seen);
        fx.handlers.push(Handler::with_code(move |code| {
            h3.lock().push(("h3", code));
            Ok(())
        }));

        assert_eq!(fx.run(), 42);
        assert_eq!(*seen.lock(), [("h3", 0), ("h1", 42)]);
        assert!(fx.sink.lines().is_empty());
    }

    #[test]
    fn raised_error_is_reported_and_drain_continues() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(None));

        let observer = Arc::clone(&seen);
        fx.handlers.push(Handler::with_error(move |code, err| {
            *observer.lock() = Some((code, err.map(|e| e.message().to_owned())));
            Ok(())
        }));
        fx.handlers
            .push(Handler::plain(|| Err(RuntimeError::new("boom").into())));

        assert_eq!(fx.run(), 1);
        assert_eq!(*seen.lock(), Some((1, Some("boom".to_owned()))));
        assert_eq!(fx.sink.lines(), ["Error running at_exit handler: boom"]);
    }

    #[test]
    fn later_drained_exit_request_overrides_raise() {
        let fx = Fixture::new();
        fx.handlers
            .push(Handler::plain(|| Err(HandlerEscape::ExitRequested(7))));
        fx.handlers
            .push(Handler::plain(|| Err(RuntimeError::new("bad").into())));
        assert_eq!(fx.run(), 7);
        assert_eq!(fx.sink.lines(), ["Error running at_exit handler: bad"]);
    }

    #[test]
    fn unwinding_exit_request_abandons_only_that_body() {
        let fx = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let earlier = Arc::clone(&log);
        fx.handlers.push(Handler::with_code(move |code| {
            earlier.lock().push(format!("earlier saw {code}"));
            Ok(())
        }));
        let body = Arc::clone(&log);
        fx.handlers.push(Handler::plain(move || {
            body.lock().push("before".to_owned());
            fn deep(code: i32) {
                panic::resume_unwind(Box::new(ExitRequest { code }));
            }
            deep(5);
            body.lock().push("after".to_owned());
            Ok(())
        }));

        assert_eq!(fx.run(), 5);
        assert_eq!(*log.lock(), ["before", "earlier saw 5"]);
    }

    #[test]
    fn panicking_handler_counts_as_raise() {
        let fx = Fixture::new();
        fx.handlers.push(Handler::plain(|| {
            panic::resume_unwind(Box::new(String::from("kaput")));
        }));
        assert_eq!(fx.run(), 1);
        assert_eq!(fx.sink.lines(), ["Error running at_exit handler: kaput"]);
        assert_eq!(fx.state.captured().map(|e| e.message().to_owned()), Some("kaput".into()));
    }

    #[test]
    fn unhandled_error_is_reported_after_every_handler() {
        let fx = Fixture::new();
        fx.state.record_unhandled(RuntimeError::caused_by(
            "outer",
            RuntimeError::new("inner"),
        ));
        fx.state.set_exit_code(1);

        let sink_len_at_handler = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&sink_len_at_handler);
            fx.handlers.push(Handler::with_error(move |code, err| {
                seen.lock().push((code, err.map(|e| e.message().to_owned())));
                Ok(())
            }));
        }

        assert_eq!(fx.run(), 1);
        assert_eq!(
            *sink_len_at_handler.lock(),
            [(1, Some("outer".to_owned())), (1, Some("outer".to_owned()))]
        );
        assert_eq!(
            fx.sink.lines(),
            ["Unhandled exception: outer", "Caused by: inner"]
        );
    }

    #[test]
    fn unhandled_error_forces_code_one_after_exit_request() {
        let fx = Fixture::new();
        fx.state.record_unhandled(RuntimeError::new("escaped"));
        fx.state.set_exit_code(1);
        fx.handlers
            .push(Handler::plain(|| Err(HandlerEscape::ExitRequested(9))));
        assert_eq!(fx.run(), 1);
        assert_eq!(fx.sink.lines(), ["Unhandled exception: escaped"]);
    }
}
