//! Orderly process termination.
//!
//! - [`handlers`]: exit handlers and the LIFO stack they live on.
//! - [`state`]: exit code, captured error, shutdown phase.
//! - [`sequencer`]: the single drain pass.
//! - [`panic_hook`]: silences the default panic report for caught bodies.
//! - [`terminator`]: the funnel every termination path goes through.

pub mod handlers;
pub mod panic_hook;
pub mod sequencer;
pub mod state;
pub mod terminator;

pub use handlers::{Arity, ExitHandlerStack, ExitRequest, Handler, HandlerEscape, HandlerResult};
pub use sequencer::ShutdownSequencer;
pub use state::{ShutdownPhase, TerminationState};
pub use terminator::Terminator;
