//! Result export: JSON, JUnit XML and CSV.
//!
//! All three formats are built from the same pair of inputs, the runner's
//! [`SuiteSummary`] and its ordered [`TestResult`] list, so they never disagree.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::config::ReportConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::runner::{SuiteSummary, TestResult, TestStatus};

/// Counts block of the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl From<&SuiteSummary> for ReportSummary {
    fn from(summary: &SuiteSummary) -> Self {
        Self {
            total: summary.total,
            passed: summary.passed,
            failed: summary.failed,
            errored: summary.errored,
            skipped: summary.skipped,
            duration_ms: summary.duration.as_millis() as u64,
        }
    }
}

/// JSON document written by `saveResults`.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport<'a> {
    pub suite: &'a str,
    pub timestamp: DateTime<Utc>,
    pub summary: ReportSummary,
    pub tests: &'a [TestResult],
}

impl<'a> SuiteReport<'a> {
    pub fn new(summary: &'a SuiteSummary, tests: &'a [TestResult]) -> Self {
        Self {
            suite: &summary.suite,
            timestamp: summary.finished_at,
            summary: ReportSummary::from(summary),
            tests,
        }
    }
}

/// Pretty-printed JSON report.
pub fn to_json(summary: &SuiteSummary, tests: &[TestResult]) -> HarnessResult<String> {
    Ok(serde_json::to_string_pretty(&SuiteReport::new(summary, tests))?)
}

/// JUnit XML for CI dashboards.
pub fn to_junit(summary: &SuiteSummary, tests: &[TestResult]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    // writing into a String cannot fail
    let _ = writeln!(
        xml,
        "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.3}\" timestamp=\"{}\">",
        escape_xml(&summary.suite),
        summary.total,
        summary.failed,
        summary.errored,
        summary.skipped,
        summary.duration.as_secs_f64(),
        summary.started_at.to_rfc3339(),
    );

    for test in tests {
        let open = format!(
            "  <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
            escape_xml(&test.name),
            escape_xml(&summary.suite),
            test.duration.as_secs_f64(),
        );
        let message = escape_xml(test.message.as_deref().unwrap_or_default());
        let _ = match test.status {
            TestStatus::Passed => writeln!(xml, "{} />", open),
            TestStatus::Skipped => writeln!(xml, "{}>\n    <skipped />\n  </testcase>", open),
            TestStatus::Failed => writeln!(
                xml,
                "{}>\n    <failure message=\"{}\" />\n  </testcase>",
                open, message
            ),
            TestStatus::Errored => writeln!(
                xml,
                "{}>\n    <error message=\"{}\" />\n  </testcase>",
                open, message
            ),
        };
    }

    xml.push_str("</testsuite>\n");
    xml
}

/// CSV with one row per test: `name,status,message,duration_ms`.
pub fn to_csv(tests: &[TestResult]) -> HarnessResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["name", "status", "message", "duration_ms"])?;
    for test in tests {
        let millis = test.duration.as_millis().to_string();
        writer.write_record([
            test.name.as_str(),
            test.status.as_str(),
            test.message.as_deref().unwrap_or_default(),
            millis.as_str(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| HarnessError::Report(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| HarnessError::Report(e.to_string()))
}

fn write_file(path: &Path, contents: &str) -> HarnessResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}

/// Write the JSON report.
pub fn save_json(path: &Path, summary: &SuiteSummary, tests: &[TestResult]) -> HarnessResult<()> {
    write_file(path, &to_json(summary, tests)?)
}

/// Write the JUnit XML report.
pub fn save_junit(path: &Path, summary: &SuiteSummary, tests: &[TestResult]) -> HarnessResult<()> {
    write_file(path, &to_junit(summary, tests))
}

/// Write the CSV report.
pub fn save_csv(path: &Path, tests: &[TestResult]) -> HarnessResult<()> {
    write_file(path, &to_csv(tests)?)
}

/// Write every report configured in `config`.
pub fn save_configured(
    config: &ReportConfig,
    summary: &SuiteSummary,
    tests: &[TestResult],
) -> HarnessResult<()> {
    if let Some(path) = &config.json {
        save_json(path, summary, tests)?;
    }
    if let Some(path) = &config.junit {
        save_junit(path, summary, tests)?;
    }
    if let Some(path) = &config.csv {
        save_csv(path, tests)?;
    }
    Ok(())
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
