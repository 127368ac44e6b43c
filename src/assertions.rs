//! Assertion library for scenario bodies.
//!
//! Assertions never fail the calling code: each primitive returns whether it passed,
//! prints a ✓/✗ line with the compared values to the console log and bumps the shared
//! pass/fail counters. A scenario combines the booleans into its own verdict.
//!
//! [`Assertions`] is a cheap handle; clones share one ledger so a scenario body can
//! capture its own copy while the runner reads the outcomes it produced.
//!
//! ```rust,ignore
//! let checks = Assertions::new(ConsoleLog::new());
//! let ok = checks.assert_approx_equal(measured, 3.3, 0.06, "DAC1 output verification");
//! ```

use serde::Serialize;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::console::ConsoleLog;

/// How an assertion compared its operands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Comparison {
    /// `actual == expected`
    Exact,
    /// `|actual - expected| <= tolerance`
    Approx { tolerance: f64 },
    /// `low <= actual <= high`
    Range,
}

/// Record of one assertion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionOutcome {
    /// Caller's label, or a default describing the verdict
    pub label: String,
    pub comparison: Comparison,
    /// Operands as displayed on the console
    pub actual: String,
    pub expected: String,
    pub passed: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    passed: usize,
    failed: usize,
    outcomes: Vec<AssertionOutcome>,
}

/// Shared assertion ledger plus the console it reports to.
#[derive(Debug, Clone)]
pub struct Assertions {
    ledger: Arc<Mutex<Ledger>>,
    console: ConsoleLog,
}

impl Assertions {
    /// A fresh ledger reporting to `console`.
    pub fn new(console: ConsoleLog) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            console,
        }
    }

    /// Passes iff `actual == expected`.
    pub fn assert_equal<T>(&self, actual: T, expected: T, label: &str) -> bool
    where
        T: PartialEq + Display,
    {
        let passed = actual == expected;
        let label = label_or(label, passed, "Values are equal", "Values not equal");
        if passed {
            self.console.print(format!("  ✓ {}", label));
        } else {
            self.console.print(format!("  ✗ {}", label));
            self.console.print(format!("    Expected: {}", expected));
            self.console.print(format!("    Actual: {}", actual));
        }
        self.record(AssertionOutcome {
            label,
            comparison: Comparison::Exact,
            actual: actual.to_string(),
            expected: expected.to_string(),
            passed,
        })
    }

    /// Passes iff `|actual - expected| <= tolerance`.
    ///
    /// The tolerance is absolute; callers wanting a relative bound pre-multiply it
    /// (`freq * 0.01`). NaN operands and negative or NaN tolerances never pass; equal
    /// infinities pass.
    pub fn assert_approx_equal(&self, actual: f64, expected: f64, tolerance: f64, label: &str) -> bool {
        let diff = (actual - expected).abs();
        // inf - inf is NaN
        let passed = tolerance >= 0.0 && (actual == expected || diff <= tolerance);
        let label = label_or(
            label,
            passed,
            "Values approximately equal",
            "Values not approximately equal",
        );
        if passed {
            self.console.print(format!("  ✓ {}", label));
            self.console
                .print(format!("    Value: {} ≈ {} (±{})", actual, expected, tolerance));
        } else {
            self.console.print(format!("  ✗ {}", label));
            self.console
                .print(format!("    Expected: {} ±{}", expected, tolerance));
            self.console
                .print(format!("    Actual: {} (diff: {})", actual, diff));
        }
        self.record(AssertionOutcome {
            label,
            comparison: Comparison::Approx { tolerance },
            actual: actual.to_string(),
            expected: expected.to_string(),
            passed,
        })
    }

    /// Passes iff `low <= actual <= high`; both bounds inclusive.
    pub fn assert_in_range<T>(&self, actual: T, low: T, high: T, label: &str) -> bool
    where
        T: PartialOrd + Display,
    {
        let passed = low <= actual && actual <= high;
        let label = label_or(label, passed, "Value in range", "Value out of range");
        if passed {
            self.console.print(format!("  ✓ {}", label));
            self.console
                .print(format!("    Value: {} (range: {} to {})", actual, low, high));
        } else {
            self.console.print(format!("  ✗ {}", label));
            self.console
                .print(format!("    Value: {} (expected: {} to {})", actual, low, high));
        }
        self.record(AssertionOutcome {
            label,
            comparison: Comparison::Range,
            actual: actual.to_string(),
            expected: format!("{}..={}", low, high),
            passed,
        })
    }

    /// Number of passed assertions since the last reset.
    pub fn passed(&self) -> usize {
        self.lock().passed
    }

    /// Number of failed assertions since the last reset.
    pub fn failed(&self) -> usize {
        self.lock().failed
    }

    /// All outcomes recorded since the last reset.
    pub fn outcomes(&self) -> Vec<AssertionOutcome> {
        self.lock().outcomes.clone()
    }

    /// Position marker for [`Assertions::failures_since`].
    pub fn mark(&self) -> usize {
        self.lock().outcomes.len()
    }

    /// Failed outcomes recorded after `mark`.
    pub fn failures_since(&self, mark: usize) -> Vec<AssertionOutcome> {
        self.lock()
            .outcomes
            .iter()
            .skip(mark)
            .filter(|outcome| !outcome.passed)
            .cloned()
            .collect()
    }

    /// Clear counters and outcomes.
    pub fn reset(&self) {
        *self.lock() = Ledger::default();
    }

    /// The console this ledger reports to.
    pub fn console(&self) -> &ConsoleLog {
        &self.console
    }

    fn record(&self, outcome: AssertionOutcome) -> bool {
        let passed = outcome.passed;
        if passed {
            tracing::debug!(label = %outcome.label, actual = %outcome.actual, expected = %outcome.expected, "assertion passed");
        } else {
            tracing::info!(label = %outcome.label, actual = %outcome.actual, expected = %outcome.expected, "assertion failed");
        }

        let mut ledger = self.lock();
        if passed {
            ledger.passed += 1;
        } else {
            ledger.failed += 1;
        }
        ledger.outcomes.push(outcome);
        passed
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn label_or(label: &str, passed: bool, pass_default: &str, fail_default: &str) -> String {
    if !label.is_empty() {
        label.to_string()
    } else if passed {
        pass_default.to_string()
    } else {
        fail_default.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks() -> Assertions {
        Assertions::new(ConsoleLog::quiet())
    }

    #[test]
    fn approx_within_and_outside_tolerance() {
        let a = checks();
        assert!(a.assert_approx_equal(3.02, 3.0, 0.05, "x"));
        assert!(!a.assert_approx_equal(3.10, 3.0, 0.05, "x"));
        assert_eq!(a.passed(), 1);
        assert_eq!(a.failed(), 1);
    }

    #[test]
    fn approx_is_reflexive_and_symmetric() {
        let a = checks();
        for &(x, y, t) in &[(0.0, 0.0, 0.0), (5.0, -5.0, 10.0), (1.5, 1.55, 0.01), (-3.3, -3.2, 0.2)] {
            assert!(a.assert_approx_equal(x, x, t, "reflexive"));
            assert_eq!(
                a.assert_approx_equal(x, y, t, "forward"),
                a.assert_approx_equal(y, x, t, "backward")
            );
        }
    }

    #[test]
    fn approx_accepts_equal_infinities() {
        let a = checks();
        assert!(a.assert_approx_equal(f64::INFINITY, f64::INFINITY, 0.0, "+inf"));
        assert!(a.assert_approx_equal(f64::NEG_INFINITY, f64::NEG_INFINITY, 0.5, "-inf"));
        assert!(!a.assert_approx_equal(f64::INFINITY, f64::NEG_INFINITY, 1.0, "opposite"));
        assert!(!a.assert_approx_equal(f64::INFINITY, 1.0e308, 1.0, "finite vs inf"));
        assert!(!a.assert_approx_equal(f64::INFINITY, f64::INFINITY, -1.0, "negative tolerance"));
    }

    #[test]
    fn approx_rejects_nan_and_negative_tolerance() {
        let a = checks();
        assert!(!a.assert_approx_equal(f64::NAN, 1.0, 1.0, "nan actual"));
        assert!(!a.assert_approx_equal(1.0, 1.0, -0.1, "negative tolerance"));
        assert!(!a.assert_approx_equal(1.0, 1.0, f64::NAN, "nan tolerance"));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let a = checks();
        assert!(a.assert_in_range(1.0, 1.0, 2.0, "low edge"));
        assert!(a.assert_in_range(2.0, 1.0, 2.0, "high edge"));
        assert!(!a.assert_in_range(0.999, 1.0, 2.0, "below"));
        assert!(!a.assert_in_range(2.001, 1.0, 2.0, "above"));
    }

    #[test]
    fn equal_works_for_strings_and_ints() {
        let a = checks();
        assert!(a.assert_equal("Voltmeter", "Voltmeter", "tool"));
        assert!(!a.assert_equal(3, 4, "count"));
        assert_eq!(a.outcomes().len(), 2);
        assert_eq!(a.outcomes()[1].comparison, Comparison::Exact);
    }

    #[test]
    fn console_lines_describe_failures() {
        let a = checks();
        a.assert_approx_equal(3.10, 3.0, 0.05, "DAC1 output verification");
        let console = a.console();
        assert!(console.contains("✗ DAC1 output verification"));
        assert!(console.contains("Expected: 3 ±0.05"));
    }

    #[test]
    fn default_labels_follow_the_verdict() {
        let a = checks();
        a.assert_in_range(5, 0, 1, "");
        assert_eq!(a.outcomes()[0].label, "Value out of range");
    }

    #[test]
    fn failures_since_mark_only_sees_new_failures() {
        let a = checks();
        a.assert_equal(1, 2, "old failure");
        let mark = a.mark();
        a.assert_equal(1, 1, "new pass");
        a.assert_equal(1, 3, "new failure");
        let failures = a.failures_since(mark);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].label, "new failure");
    }

    #[test]
    fn clones_share_counters_and_reset_clears() {
        let a = checks();
        let b = a.clone();
        b.assert_equal(true, true, "shared");
        assert_eq!(a.passed(), 1);
        a.reset();
        assert_eq!(b.passed(), 0);
        assert!(b.outcomes().is_empty());
    }
}
