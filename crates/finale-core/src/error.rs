//! Error values flowing through the termination path.

use std::any::Any;
use std::fmt;

/// A language-level error value: a message plus an optional cause.
///
/// This is the only view of the host language's error machinery the
/// termination path needs. `Display` prints the message alone; the cause chain
/// is reachable through [`std::error::Error::source`] and [`RuntimeError::chain`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    message: String,
    #[source]
    cause: Option<Box<RuntimeError>>,
}

impl RuntimeError {
    /// Create an error with no cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Create an error caused by `cause`.
    #[must_use]
    pub fn caused_by(message: impl Into<String>, cause: RuntimeError) -> Self {
        Self {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Copy any `std::error::Error` and its `source()` chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut messages = vec![err.to_string()];
        let mut next = err.source();
        while let Some(source) = next {
            messages.push(source.to_string());
            next = source.source();
        }

        let mut built: Option<RuntimeError> = None;
        for message in messages.into_iter().rev() {
            built = Some(Self {
                message,
                cause: built.map(Box::new),
            });
        }
        built.unwrap_or_else(|| Self::new(""))
    }

    /// Build an error from a panic payload, as returned by `catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(msg) = payload.downcast_ref::<String>() {
            return Self::new(msg.clone());
        }
        if let Some(msg) = payload.downcast_ref::<&'static str>() {
            return Self::new(*msg);
        }
        if let Some(err) = payload.downcast_ref::<RuntimeError>() {
            return err.clone();
        }
        Self::new("<non-string panic payload>")
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&RuntimeError> {
        self.cause.as_deref()
    }

    /// Iterate the cause chain, starting with the first cause (not `self`).
    pub fn causes(&self) -> impl Iterator<Item = &RuntimeError> {
        std::iter::successors(self.cause(), |err| err.cause())
    }

    /// Iterate `self` followed by every cause, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &RuntimeError> {
        std::iter::successors(Some(self), |err| err.cause())
    }
}

/// Bookkeeping failures in the fixed-capacity stack table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("stack registry is full ({capacity} regions)")]
    Full { capacity: usize },
    #[error("owner {owner} already has a registered stack")]
    DuplicateOwner { owner: usize },
    #[error("owner {owner} has no registered stack")]
    UnknownOwner { owner: usize },
    #[error("stack region for owner {owner} is empty or wraps the address space")]
    InvalidRegion { owner: usize },
}

/// Failures entering the termination funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TerminationError {
    /// Another execution context won the race to begin the drain.
    #[error("termination already in progress on another execution context")]
    AlreadyTerminating,
}

/// Display adapter printing an error with its cause chain on one line.
pub struct ChainDisplay<'a>(pub &'a RuntimeError);

impl fmt::Display for ChainDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in self.0.chain() {
            if !first {
                f.write_str(": ")?;
            }
            f.write_str(err.message())?;
            first = false;
        }
        Ok(())
    }
}
