//! Exit handlers and the LIFO stack they are drained from.

use std::fmt;

use parking_lot::Mutex;

use crate::error::RuntimeError;

/// How a handler body left early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEscape {
    /// The body raised an error.
    Raised(RuntimeError),
    /// The body asked the process to stop with this code.
    ExitRequested(i32),
}

impl From<RuntimeError> for HandlerEscape {
    fn from(err: RuntimeError) -> Self {
        Self::Raised(err)
    }
}

pub type HandlerResult = Result<(), HandlerEscape>;

/// Unwind payload carrying an explicit termination request out of a handler
/// body from arbitrary call depth. Caught at the per-handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest {
    pub code: i32,
}

/// Which termination state a handler wants to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    Code,
    CodeAndError,
}

type PlainFn = Box<dyn FnOnce() -> HandlerResult + Send>;
type CodeFn = Box<dyn FnOnce(i32) -> HandlerResult + Send>;
type CodeErrorFn = Box<dyn FnOnce(i32, Option<&RuntimeError>) -> HandlerResult + Send>;

/// A registered shutdown callback.
pub enum Handler {
    Plain(PlainFn),
    WithCode(CodeFn),
    WithError(CodeErrorFn),
}

impl Handler {
    pub fn plain(f: impl FnOnce() -> HandlerResult + Send + 'static) -> Self {
        Self::Plain(Box::new(f))
    }

    pub fn with_code(f: impl FnOnce(i32) -> HandlerResult + Send + 'static) -> Self {
        Self::WithCode(Box::new(f))
    }

    pub fn with_error(
        f: impl FnOnce(i32, Option<&RuntimeError>) -> HandlerResult + Send + 'static,
    ) -> Self {
        Self::WithError(Box::new(f))
    }

    #[must_use]
    pub fn arity(&self) -> Arity {
        match self {
            Self::Plain(_) => Arity::None,
            Self::WithCode(_) => Arity::Code,
            Self::WithError(_) => Arity::CodeAndError,
        }
    }

    /// Run the body with whatever its arity asks for.
    pub fn call(self, code: i32, error: Option<&RuntimeError>) -> HandlerResult {
        match self {
            Self::Plain(f) => f(),
            Self::WithCode(f) => f(code),
            Self::WithError(f) => f(code, error),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.arity()).finish()
    }
}

/// Registered handlers, most recent on top.
///
/// The lock is only held for a single push or pop, never while a handler
/// runs, so handlers may register further handlers.
#[derive(Debug, Default)]
pub struct ExitHandlerStack {
    handlers: Mutex<Vec<Handler>>,
}

impl ExitHandlerStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, handler: Handler) {
        self.handlers.lock().push(handler);
    }

    pub fn pop(&self) -> Option<Handler> {
        self.handlers.lock().pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Pop and visit the top handler until the stack is empty. The top is
    /// re-read after every visit, so handlers pushed by a visited handler run
    /// next.
    pub fn drain(&self, mut visitor: impl FnMut(Handler)) {
        while let Some(handler) = self.pop() {
            visitor(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn note(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Handler {
        let log = Arc::clone(log);
        Handler::plain(move || {
            log.lock().push(label);
            Ok(())
        })
    }

    #[test]
    fn drain_is_reverse_registration_order() {
        let stack = ExitHandlerStack::new();
        let log = recorder();
        for label in ["a", "b", "c", "d"] {
            stack.push(note(&log, label));
        }
        stack.drain(|h| {
            let _ = h.call(0, None);
        });
        assert_eq!(*log.lock(), ["d", "c", "b", "a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn handlers_pushed_during_drain_run_next() {
        let stack = Arc::new(ExitHandlerStack::new());
        let log = recorder();

        for (label, nested) in [("1", "2"), ("3", "4")] {
            let inner_log = Arc::clone(&log);
            let inner_stack = Arc::clone(&stack);
            stack.push(Handler::plain(move || {
                inner_log.lock().push(label);
                inner_stack.push(note(&inner_log, nested));
                Ok(())
            }));
        }

        stack.drain(|h| {
            let _ = h.call(0, None);
        });
        assert_eq!(*log.lock(), ["3", "4", "1", "2"]);
    }

    #[test]
    fn nesting_goes_arbitrarily_deep() {
        fn chain(stack: Arc<ExitHandlerStack>, log: Arc<Mutex<Vec<usize>>>, depth: usize) -> Handler {
            Handler::plain(move || {
                log.lock().push(depth);
                if depth < 5 {
                    stack.push(chain(Arc::clone(&stack), Arc::clone(&log), depth + 1));
                }
                Ok(())
            })
        }

        let stack = Arc::new(ExitHandlerStack::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tail = Arc::clone(&log);
        stack.push(Handler::plain(move || {
            tail.lock().push(99);
            Ok(())
        }));
        stack.push(chain(Arc::clone(&stack), Arc::clone(&log), 0));
        stack.drain(|h| {
            let _ = h.call(0, None);
        });
        assert_eq!(*log.lock(), [0, 1, 2, 3, 4, 5, 99]);
    }

    #[test]
    fn call_passes_arity_arguments() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let handler = Handler::with_error(move |code, err| {
            *sink.lock() = Some((code, err.map(|e| e.message().to_owned())));
            Ok(())
        });
        assert_eq!(handler.arity(), Arity::CodeAndError);
        handler.call(3, Some(&RuntimeError::new("x"))).unwrap();
        assert_eq!(*seen.lock(), Some((3, Some("x".to_owned()))));

        let code_only = Handler::with_code(|code| {
            if code == 9 {
                Err(HandlerEscape::ExitRequested(10))
            } else {
                Ok(())
            }
        });
        assert_eq!(code_only.arity(), Arity::Code);
        assert_eq!(code_only.call(9, None), Err(HandlerEscape::ExitRequested(10)));
        assert_eq!(Handler::plain(|| Ok(())).arity(), Arity::None);
    }

    #[test]
    fn concurrent_pushes_are_all_kept() {
        let stack = Arc::new(ExitHandlerStack::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stack.push(Handler::plain(|| Ok(())));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(stack.len(), 800);
        let mut ran = 0;
        stack.drain(|_| ran += 1);
        assert_eq!(ran, 800);
    }
}
