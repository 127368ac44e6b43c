//! Custom error types for the harness.
//!
//! This module defines the primary error type, `HarnessError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place to describe everything that can
//! go wrong between loading a configuration and writing the final report.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML parse or type errors.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (e.g. a poll interval longer than its timeout). Caught by `HarnessConfig::validate`.
//! - **`Io`**: Wraps `std::io::Error` (script loading, report writing).
//! - **`NotConnected` / `ToolNotActive` / `UnknownTool` / `InvalidChannel`**: Violations of
//!   the device session contract. Panel reads and writes are only meaningful while a
//!   session is connected and the addressed panel is the active tool.
//! - **`InvalidSetting`**: A panel setting the instrument cannot apply (e.g. NaN volts/div).
//! - **`Device`**: Errors reported by the instrument side.
//! - **`SettleTimeout`**: `await_settled` gave up waiting for a condition.
//! - **`RunnerNotInitialized` / `DuplicateTest` / `TestInFlight`**: Misuse of the test runner.
//! - **`Script`** / **`Report`**: Script host and report export failures.
//!
//! Assertion failures are deliberately *not* errors: they are recorded outcomes.

use std::time::Duration;
use thiserror::Error;

use crate::session::Tool;

/// Convenience alias for results using the harness error type.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No device connected")]
    NotConnected,

    #[error("Panel '{requested}' is not the active tool (active: {})", active.map_or("none", |tool| tool.name()))]
    ToolNotActive {
        requested: Tool,
        active: Option<Tool>,
    },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Invalid channel index {index} (panel has {count} channels)")]
    InvalidChannel { index: usize, count: usize },

    #[error("Invalid panel setting: {0}")]
    InvalidSetting(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Condition did not settle within {0:?}")]
    SettleTimeout(Duration),

    #[error("Test runner used before init()")]
    RunnerNotInitialized,

    #[error("Test '{0}' is already registered in this run")]
    DuplicateTest(String),

    #[error("Cannot start '{requested}' while '{running}' is still running")]
    TestInFlight { requested: String, running: String },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Report error: {0}")]
    Report(String),
}

impl From<serde_json::Error> for HarnessError {
    fn from(value: serde_json::Error) -> Self {
        HarnessError::Report(value.to_string())
    }
}

impl From<csv::Error> for HarnessError {
    fn from(value: csv::Error) -> Self {
        HarnessError::Report(value.to_string())
    }
}
