//! CLI entrypoint for the finale scenario harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use finale_core::RuntimeConfig;
use finale_harness::{HarnessError, SCENARIOS, ScenarioRunner, scenarios};

/// Termination scenarios for the finale runtime.
#[derive(Debug, Parser)]
#[command(name = "finale-harness")]
#[command(about = "Run and verify finale termination scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every scenario with its expected exit code.
    List,
    /// Run one scenario as this process's main. Exits with its final code.
    Run {
        /// Scenario name (see `list`).
        scenario: String,
        /// Write a JSONL structured log of termination events here.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run every scenario in a child process and check the outcome.
    Verify {
        /// Output report path (JSON). Printed to stdout when omitted.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("finale-harness: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HarnessError> {
    match cli.command {
        Command::List => {
            for scenario in SCENARIOS {
                println!(
                    "{:<24} exit {:<4} {}",
                    scenario.name, scenario.expected.exit_code, scenario.description
                );
            }
        }
        Command::Run { scenario, log } => {
            let scenario =
                scenarios::find(&scenario).ok_or(HarnessError::UnknownScenario(scenario))?;
            let mut config = RuntimeConfig::from_env();
            if let Some(path) = log {
                config = config.with_log_path(path);
            }
            scenario.execute(&config);
        }
        Command::Verify { report } => {
            let runner = ScenarioRunner::current()?;
            let result = runner.run_all()?;
            for outcome in &result.outcomes {
                if outcome.passed {
                    eprintln!("PASS {}", outcome.scenario);
                } else {
                    eprintln!("FAIL {}: {}", outcome.scenario, outcome.failures.join("; "));
                }
            }
            eprintln!(
                "{} scenarios, {} passed, {} failed",
                result.total, result.passed, result.failed
            );
            match report {
                Some(path) => result.write_to(&path)?,
                None => println!("{}", result.to_json()?),
            }
            if !result.all_passed() {
                return Err(HarnessError::VerifyFailed {
                    failed: result.failed,
                    total: result.total,
                });
            }
        }
    }
    Ok(())
}
