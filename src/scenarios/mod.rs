//! Native acceptance suites
//!
//! Each suite follows the same script:
//!
//! 1. `init` the runner with the suite name
//! 2. connect (fatal: no tests run, exit code 1)
//! 3. switch to the suite's primary tool (fatal: same)
//! 4. run the tests in order
//! 5. disconnect and print the summary
//!
//! Suites return a [`SuiteRun`] rather than exiting the process, so one invocation
//! can run several of them and write reports afterwards.

pub mod power_supply;
pub mod signal_generator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HarnessError, HarnessResult};
use crate::runner::{SuiteSummary, TestResult, TestRunner, EXIT_FAILURE};
use crate::session::{DeviceSession, Tool};

/// The built-in suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuiteKind {
    PowerSupply,
    SignalGenerator,
}

impl SuiteKind {
    pub const ALL: [SuiteKind; 2] = [SuiteKind::PowerSupply, SuiteKind::SignalGenerator];

    /// Command-line identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Self::PowerSupply => "power-supply",
            Self::SignalGenerator => "signal-generator",
        }
    }

    /// Suite name shown in the banner and reports.
    pub fn title(&self) -> &'static str {
        match self {
            Self::PowerSupply => power_supply::SUITE_NAME,
            Self::SignalGenerator => signal_generator::SUITE_NAME,
        }
    }

    /// Tool the suite starts from.
    pub fn primary_tool(&self) -> Tool {
        match self {
            Self::PowerSupply => Tool::PowerSupply,
            Self::SignalGenerator => Tool::SignalGenerator,
        }
    }

    /// Test UIDs in execution order.
    pub fn test_ids(&self) -> &'static [&'static str] {
        match self {
            Self::PowerSupply => &power_supply::TESTS,
            Self::SignalGenerator => &signal_generator::TESTS,
        }
    }

    async fn run_tests(&self, runner: &mut TestRunner, session: &DeviceSession) -> HarnessResult<()> {
        match self {
            Self::PowerSupply => power_supply::run(runner, session).await,
            Self::SignalGenerator => signal_generator::run(runner, session).await,
        }
    }
}

impl fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SuiteKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == wanted)
            .ok_or_else(|| HarnessError::Configuration(format!("Unknown suite '{}'", s)))
    }
}

/// Outcome of one suite invocation.
#[derive(Debug, Clone)]
pub struct SuiteRun {
    pub kind: SuiteKind,
    pub summary: SuiteSummary,
    pub results: Vec<TestResult>,
    pub exit_code: i32,
}

impl SuiteRun {
    /// Whether the suite stopped at a precondition before running any test.
    pub fn aborted(&self) -> bool {
        self.exit_code != 0 && self.results.is_empty()
    }
}

/// Run one suite end to end against `session`.
///
/// A failed connect or initial tool switch is fatal: the suite reports zero tests and
/// exit code [`EXIT_FAILURE`]. Only runner misuse is returned as `Err`.
pub async fn run_suite(
    kind: SuiteKind,
    runner: &mut TestRunner,
    session: &DeviceSession,
) -> HarnessResult<SuiteRun> {
    runner.init(kind.title());
    let console = session.console();

    if !session.connect_to_device(None).await {
        console.print("ERROR: Cannot proceed without device connection");
        tracing::error!(suite = %kind, "aborted: no device connection");
        return Ok(aborted(kind, runner));
    }

    let tool = kind.primary_tool();
    if !session.switch_to_tool(tool.name()).await {
        console.print(format!("ERROR: Cannot access {}", tool));
        tracing::error!(suite = %kind, %tool, "aborted: primary tool unavailable");
        session.disconnect_from_device().await;
        return Ok(aborted(kind, runner));
    }

    kind.run_tests(runner, session).await?;

    session.disconnect_from_device().await;
    let exit_code = runner.print_summary();
    console.print(exit_code.to_string());

    Ok(SuiteRun {
        kind,
        summary: runner.summary(),
        results: runner.results().to_vec(),
        exit_code,
    })
}

fn aborted(kind: SuiteKind, runner: &TestRunner) -> SuiteRun {
    SuiteRun {
        kind,
        summary: runner.summary(),
        results: Vec::new(),
        exit_code: EXIT_FAILURE,
    }
}

/// Combined exit code: the first non-zero code, else 0.
pub fn combined_exit_code(runs: &[SuiteRun]) -> i32 {
    runs.iter()
        .map(|run| run.exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_ids_parse() {
        assert_eq!("power-supply".parse::<SuiteKind>().unwrap(), SuiteKind::PowerSupply);
        assert_eq!(
            "Signal_Generator".parse::<SuiteKind>().unwrap(),
            SuiteKind::SignalGenerator
        );
        assert!("logic".parse::<SuiteKind>().is_err());
    }

    #[test]
    fn suites_list_their_tests() {
        assert_eq!(SuiteKind::PowerSupply.test_ids().len(), 4);
        assert_eq!(SuiteKind::PowerSupply.test_ids()[0], "TST.PS.POSITIVE");
        assert!(SuiteKind::SignalGenerator
            .test_ids()
            .iter()
            .all(|id| id.starts_with("TST.M2K.SG.")));
    }
}
