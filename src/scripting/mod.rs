//! Rhai scripting for acceptance tests.
//!
//! Test scenarios can be written as Rhai scripts instead of native suites. A script
//! drives the same [`DeviceSession`](crate::session::DeviceSession) and
//! [`TestRunner`](crate::runner::TestRunner) the native suites use, so results,
//! console output and reports are identical.
//!
//! # Example
//!
//! ```rhai
//! TestFramework::init("Power Supply Smoke Test");
//! if !TestFramework::connectToDevice() {
//!     printToConsole("ERROR: Cannot proceed without device connection");
//!     exit(1);
//! }
//! switchToTool("Power Supply");
//!
//! TestFramework::runTest("TST.PS.SMOKE", || {
//!     power.dac1_enabled = true;
//!     power.running = true;
//!     power.dac1_value = 3.3;
//!     msleep(500);
//!     TestFramework::assertApproxEqual(power.dac1_value, 3.3, 0.001, "DAC1 set-point")
//! });
//!
//! TestFramework::disconnectFromDevice();
//! exit(TestFramework::printSummary());
//! ```

pub mod bindings;
pub mod engine;

pub use bindings::{ExitRequest, SKIP_MARKER};
pub use engine::{ScriptHost, ScriptOutcome, DEFAULT_OPERATION_LIMIT};
