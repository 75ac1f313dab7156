//! Child-process scenario execution.
//!
//! Every scenario ends its process (normally, via `exit`, or via a fault),
//! so each one runs in a fresh child of the harness binary and is judged by
//! what the child leaves behind.

use std::fmt::Write as _;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::HarnessError;
use crate::scenarios::{SCENARIOS, Scenario};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub passed: bool,
    pub expected_exit_code: i32,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_sha256: String,
    pub stderr_sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

/// Machine-readable summary of a `verify` pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub schema_version: u32,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub outcomes: Vec<ScenarioOutcome>,
}

impl VerifyReport {
    #[must_use]
    pub fn from_outcomes(outcomes: Vec<ScenarioOutcome>) -> Self {
        let passed = outcomes.iter().filter(|o| o.passed).count();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            total: outcomes.len(),
            passed,
            failed: outcomes.len() - passed,
            outcomes,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), HarnessError> {
        std::fs::write(path, self.to_json()?).map_err(|source| HarnessError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Spawns `<exe> run <scenario>` children.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    exe: PathBuf,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Runner that re-executes the current binary.
    pub fn current() -> Result<Self, HarnessError> {
        let exe = std::env::current_exe().map_err(|source| HarnessError::Io {
            path: PathBuf::from("<current_exe>"),
            source,
        })?;
        Ok(Self::new(exe))
    }

    pub fn run(&self, scenario: &Scenario) -> Result<ScenarioOutcome, HarnessError> {
        let output = Command::new(&self.exe)
            .arg("run")
            .arg(scenario.name)
            .env_remove("FINALE_LOG")
            .envs(scenario.env.iter().copied())
            .output()
            .map_err(|source| HarnessError::Spawn {
                scenario: scenario.name.to_owned(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = effective_exit_code(output.status);
        let failures = judge(scenario, exit_code, &stdout, &stderr);

        Ok(ScenarioOutcome {
            scenario: scenario.name.to_owned(),
            passed: failures.is_empty(),
            expected_exit_code: scenario.expected.exit_code,
            exit_code,
            stdout_sha256: sha256_hex(stdout.as_bytes()),
            stderr_sha256: sha256_hex(stderr.as_bytes()),
            stdout,
            stderr,
            failures,
        })
    }

    pub fn run_all(&self) -> Result<VerifyReport, HarnessError> {
        let outcomes = SCENARIOS
            .iter()
            .map(|scenario| self.run(scenario))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VerifyReport::from_outcomes(outcomes))
    }
}

/// Exit code, or `128 + signal` for a child killed by a signal.
#[must_use]
pub fn effective_exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

/// Every way the observed process differs from the expectation.
#[must_use]
pub fn judge(scenario: &Scenario, exit_code: Option<i32>, stdout: &str, stderr: &str) -> Vec<String> {
    let expected = &scenario.expected;
    let mut failures = Vec::new();

    if exit_code != Some(expected.exit_code) {
        failures.push(format!(
            "exit code {exit_code:?}, expected {}",
            expected.exit_code
        ));
    }

    let lines: Vec<&str> = stdout.lines().collect();
    if lines != expected.stdout {
        failures.push(format!(
            "stdout {lines:?}, expected {:?}",
            expected.stdout
        ));
    }

    for needle in expected.stderr_contains {
        if !stderr.contains(needle) {
            failures.push(format!("stderr missing {needle:?}"));
        }
    }
    for needle in expected.stderr_absent {
        if stderr.contains(needle) {
            failures.push(format!("stderr unexpectedly contains {needle:?}"));
        }
    }
    failures
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        let _ = write!(out, "{b:02x}");
    }
    out
}
