//! Test runner: ordered, isolated execution of named test cases.
//!
//! Each test case moves through `Pending -> Running -> {Passed, Failed, Errored, Skipped}`
//! and is then recorded. Only one body runs at a time and results keep registration
//! order. A body that returns an error or panics is recorded as `Errored` and the suite
//! carries on with the next test.
//!
//! Native scenarios use the async [`TestRunner::run_test`]. Hosts that drive bodies
//! themselves (the Rhai script host) use the two halves, [`TestRunner::begin`] and
//! [`TestRunner::finish`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut runner = TestRunner::new(assertions.clone());
//! runner.init("Power Supply + Voltmeter Tests");
//! runner.run_test("TST.PS.POSITIVE", || async { Ok(true) }).await?;
//! let exit_code = runner.print_summary();
//! ```

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Serialize, Serializer};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;

use crate::assertions::Assertions;
use crate::console::ConsoleLog;
use crate::error::{HarnessError, HarnessResult};

/// Exit code for a run with at least one failed or errored test.
pub const EXIT_FAILURE: i32 = 1;

/// What a test body decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every check the body cared about held
    Pass,
    /// Failed, optionally with a reason supplied by the body
    Fail(Option<String>),
    /// Not applicable on this setup; does not count as a failure
    Skip,
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        if passed {
            Verdict::Pass
        } else {
            Verdict::Fail(None)
        }
    }
}

/// How a body completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The body returned normally.
    Completed(Verdict),
    /// The body raised an error or panicked; the payload is its description.
    Errored(String),
}

/// Terminal state of a recorded test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestStatus {
    #[serde(rename = "PASS")]
    Passed,
    #[serde(rename = "FAIL")]
    Failed,
    #[serde(rename = "ERROR")]
    Errored,
    #[serde(rename = "SKIP")]
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed => "FAIL",
            Self::Errored => "ERROR",
            Self::Skipped => "SKIP",
        }
    }

    /// Failed or errored.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }
}

/// Immutable record of one executed test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    /// 1-based position in the run
    pub index: usize,
    /// Test UID, e.g. `TST.PS.POSITIVE`
    pub name: String,
    pub status: TestStatus,
    /// Failure reason, failed check labels, or the error/panic text
    pub message: Option<String>,
    /// Wall time of the body
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

/// A test that has been started but not yet recorded.
#[derive(Debug)]
#[must_use = "a started test must be passed to TestRunner::finish"]
pub struct PendingTest {
    index: usize,
    name: String,
    started: Instant,
    assertion_mark: usize,
}

impl PendingTest {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Aggregate counts for a suite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SuiteSummary {
    /// Failed plus errored tests.
    pub fn failures(&self) -> usize {
        self.failed + self.errored
    }

    /// `0` when nothing failed (skips are fine), [`EXIT_FAILURE`] otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failures() == 0 {
            0
        } else {
            EXIT_FAILURE
        }
    }

    /// Pass percentage, `None` for an empty suite.
    pub fn pass_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.passed as f64 / self.total as f64 * 100.0)
    }
}

/// Executes test cases in registration order and keeps their results.
#[derive(Debug)]
pub struct TestRunner {
    suite: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    results: Vec<TestResult>,
    running: Option<String>,
    assertions: Assertions,
    console: ConsoleLog,
}

impl TestRunner {
    /// Runner reporting to the console of `assertions`.
    pub fn new(assertions: Assertions) -> Self {
        let console = assertions.console().clone();
        Self {
            suite: None,
            started_at: Utc::now(),
            started: Instant::now(),
            results: Vec::new(),
            running: None,
            assertions,
            console,
        }
    }

    /// Reset counters and results and print the suite banner.
    ///
    /// May be called again to start a fresh suite in the same process.
    pub fn init(&mut self, suite_name: &str) {
        self.suite = Some(suite_name.to_string());
        self.started_at = Utc::now();
        self.started = Instant::now();
        self.results.clear();
        self.running = None;
        self.assertions.reset();

        tracing::info!(suite = suite_name, "suite initialised");
        self.console.print("=====================================");
        self.console.print(format!("Test Suite: {}", suite_name));
        self.console
            .print(format!("Start Time: {}", self.started_at.to_rfc3339()));
        self.console.print("=====================================\n");
    }

    /// Name passed to the last `init`, if any.
    pub fn suite_name(&self) -> Option<&str> {
        self.suite.as_deref()
    }

    pub fn assertions(&self) -> &Assertions {
        &self.assertions
    }

    /// Run one test body inside the failure boundary and record its result.
    ///
    /// `Ok(true)`/`Ok(Verdict::Pass)` passes, `Ok(false)` fails, `Err(_)` and panics
    /// are recorded as errored. Only misuse of the runner itself returns `Err`.
    pub async fn run_test<F, Fut, V>(&mut self, name: &str, body: F) -> HarnessResult<&TestResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
        V: Into<Verdict>,
    {
        let pending = self.begin(name)?;
        let guarded = AssertUnwindSafe(async move { body().await }).catch_unwind();
        let outcome = match guarded.await {
            Ok(Ok(verdict)) => Outcome::Completed(verdict.into()),
            Ok(Err(error)) => Outcome::Errored(format!("{:#}", error)),
            Err(panic) => Outcome::Errored(panic_message(panic.as_ref())),
        };
        Ok(self.finish(pending, outcome))
    }

    /// Move a test to `Running`.
    pub fn begin(&mut self, name: &str) -> HarnessResult<PendingTest> {
        if self.suite.is_none() {
            return Err(HarnessError::RunnerNotInitialized);
        }
        if let Some(running) = &self.running {
            return Err(HarnessError::TestInFlight {
                requested: name.to_string(),
                running: running.clone(),
            });
        }
        if self.results.iter().any(|result| result.name == name) {
            return Err(HarnessError::DuplicateTest(name.to_string()));
        }

        let index = self.results.len() + 1;
        self.running = Some(name.to_string());

        tracing::info!(test = name, index, "test started");
        self.console.print(format!("Running Test UID: {}", name));
        self.console.print(format!("Test #{} in suite", index));
        self.console.print("-".repeat(40));

        Ok(PendingTest {
            index,
            name: name.to_string(),
            started: Instant::now(),
            assertion_mark: self.assertions.mark(),
        })
    }

    /// Record the outcome of a started test.
    pub fn finish(&mut self, pending: PendingTest, outcome: Outcome) -> &TestResult {
        let duration = pending.started.elapsed();
        let millis = duration.as_millis();
        let failed_checks = self
            .assertions
            .failures_since(pending.assertion_mark)
            .into_iter()
            .map(|outcome| outcome.label)
            .collect::<Vec<_>>();

        let (status, message) = match outcome {
            Outcome::Completed(Verdict::Pass) => {
                self.console.print(format!("✓ PASS ({}ms)\n", millis));
                (TestStatus::Passed, None)
            }
            Outcome::Completed(Verdict::Skip) => {
                self.console.print("⊘ SKIPPED\n");
                (TestStatus::Skipped, None)
            }
            Outcome::Completed(Verdict::Fail(reason)) => {
                self.console.print(format!("✗ FAIL ({}ms)", millis));
                let message = failure_message(reason, &failed_checks);
                if let Some(message) = &message {
                    self.console.print(format!("  Reason: {}", message));
                }
                self.console.print("");
                (TestStatus::Failed, message)
            }
            Outcome::Errored(error) => {
                self.console.print(format!("✗ ERROR: {}\n", error));
                (TestStatus::Errored, Some(error))
            }
        };

        tracing::info!(test = %pending.name, status = status.as_str(), duration_ms = millis as u64, "test finished");
        self.running = None;
        self.results.push(TestResult {
            index: pending.index,
            name: pending.name,
            status,
            message,
            duration,
        });
        &self.results[self.results.len() - 1]
    }

    /// Results in execution order.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn summary(&self) -> SuiteSummary {
        let count = |status: TestStatus| self.results.iter().filter(|r| r.status == status).count();
        SuiteSummary {
            suite: self.suite.clone().unwrap_or_default(),
            total: self.results.len(),
            passed: count(TestStatus::Passed),
            failed: count(TestStatus::Failed),
            errored: count(TestStatus::Errored),
            skipped: count(TestStatus::Skipped),
            duration: self.started.elapsed(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    /// Print totals and return the process exit code.
    pub fn print_summary(&self) -> i32 {
        let summary = self.summary();
        let rate = summary
            .pass_rate()
            .map_or_else(|| "n/a".to_string(), |rate| format!("{}%", rate.round()));

        self.console.print("\n=====================================");
        self.console.print(format!("Test Summary: {}", summary.suite));
        self.console.print("=====================================");
        self.console.print(format!("Total Tests:   {}", summary.total));
        self.console
            .print(format!("Passed:        {} ({})", summary.passed, rate));
        self.console.print(format!("Failed:        {}", summary.failed));
        self.console.print(format!("Errored:       {}", summary.errored));
        self.console.print(format!("Skipped:       {}", summary.skipped));
        self.console
            .print(format!("End Time:      {}", summary.finished_at.to_rfc3339()));
        self.console.print("=====================================\n");

        summary.exit_code()
    }
}

fn failure_message(reason: Option<String>, failed_checks: &[String]) -> Option<String> {
    let checks = (!failed_checks.is_empty())
        .then(|| format!("failed assertions: {}", failed_checks.join("; ")));
    match (reason, checks) {
        (Some(reason), Some(checks)) => Some(format!("{} ({})", reason, checks)),
        (reason, checks) => reason.or(checks),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("panic: {}", text)
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("panic: {}", text)
    } else {
        "panic with non-string payload".to_string()
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
