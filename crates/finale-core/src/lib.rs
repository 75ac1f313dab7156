//! # finale-core
//!
//! Safe Rust implementation of a language runtime's termination path.
//!
//! This crate owns the semantics: the LIFO exit-handler stack, the single-pass
//! shutdown sequencer, the exit-code/captured-error state it threads through
//! handlers, the fixed-capacity stack registry consulted from fault context,
//! and the allocation-free fault classifier. No `unsafe` code is permitted at
//! the crate level; the OS boundary lives in `finale-abi`.

#![deny(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod exit;
pub mod fault;
pub mod stack;
pub mod structured_log;

pub use config::{FaultMode, RuntimeConfig};
pub use diagnostics::{CaptureSink, DiagnosticSink, StderrSink};
pub use error::{ChainDisplay, RegistryError, RuntimeError, TerminationError};
pub use exit::{
    Arity, ExitHandlerStack, ExitRequest, Handler, HandlerEscape, HandlerResult,
    ShutdownPhase, ShutdownSequencer, TerminationState, Terminator,
};
pub use fault::{FaultClassifier, FaultKind, FaultReport};
pub use stack::{GUARD_ZONE_SIZE, OwnerId, StackClassification, StackRegion, StackRegistry};
