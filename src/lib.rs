//! # Panel Harness Core Library
//!
//! This crate is an acceptance-test harness for the instrument panels of a
//! multi-function lab device (power supply, voltmeter, signal generator and
//! oscilloscope). Tests drive the panels through a device session, measure the
//! result on a loopback-wired instrument, and record pass/fail outcomes with a
//! summary and an exit code suitable for CI.
//!
//! ## Crate Structure
//!
//! - **`assertions`**: `assert_equal`, `assert_approx_equal` and `assert_in_range`. Each
//!   check prints a ✓/✗ line and returns whether it passed; failures never abort a test.
//! - **`runner`**: The `TestRunner` that executes named tests in order, isolates errors
//!   and panics, and prints the suite summary.
//! - **`session`**: The `DeviceSession` façade: connect (with emulator fallback), switch
//!   tools, disconnect, and hand out panel handles only for the active tool.
//! - **`panels`**: Capability traits for the four panels plus their typed settings.
//! - **`simulator`**: An in-process loopback bench implementing the panels, with
//!   realistic output latency and measurement noise.
//! - **`scenarios`**: The native Power Supply and Signal Generator suites.
//! - **`scripting`**: A Rhai host so scenarios can also be written as scripts.
//! - **`report`**: JSON, JUnit XML and CSV result files.
//! - **`config`**: Layered configuration (`config/harness.toml` + environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`console`**: The human-readable test log shared by all of the above.
//! - **`error`**: The crate-wide `HarnessError` type.
//! - **`settle`**: Settle delays and polling helpers.

pub mod assertions;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod panels;
pub mod report;
pub mod runner;
pub mod scenarios;
pub mod scripting;
pub mod session;
pub mod settle;
pub mod simulator;

pub use assertions::Assertions;
pub use config::HarnessConfig;
pub use console::ConsoleLog;
pub use error::{HarnessError, HarnessResult};
pub use runner::{TestRunner, EXIT_FAILURE};
pub use session::{DeviceSession, Tool};
