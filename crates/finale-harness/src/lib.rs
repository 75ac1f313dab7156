//! Scenario harness for finale.
//!
//! - [`scenarios`]: termination scenarios, each a program main with an
//!   expected exit status and output.
//! - [`runner`]: runs scenarios as child processes and builds a JSON report.

pub mod runner;
pub mod scenarios;

pub use runner::{ScenarioOutcome, ScenarioRunner, VerifyReport};
pub use scenarios::{Expectation, SCENARIOS, Scenario};

use std::path::PathBuf;

/// Harness failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("unknown scenario `{0}` (see `finale-harness list`)")]
    UnknownScenario(String),
    #[error("failed to spawn scenario `{scenario}`: {source}")]
    Spawn {
        scenario: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
    #[error("{failed} of {total} scenario(s) failed")]
    VerifyFailed { failed: usize, total: usize },
}
