//! Native suites end to end against the simulated bench.
//!
//! These run on a paused tokio clock: settle delays and instrument latency advance
//! virtual time, so a full suite completes instantly.

use std::sync::Arc;

use panel_harness::config::{DeviceConfig, SettleConfig, SimulatorConfig};
use panel_harness::runner::TestStatus;
use panel_harness::scenarios::{combined_exit_code, run_suite, SuiteKind};
use panel_harness::simulator::SimulatedDevice;
use panel_harness::{Assertions, ConsoleLog, DeviceSession, TestRunner, EXIT_FAILURE};

struct Bench {
    session: DeviceSession,
    console: ConsoleLog,
}

impl Bench {
    fn new(simulator: SimulatorConfig, device: DeviceConfig) -> Self {
        let console = ConsoleLog::quiet();
        let session = DeviceSession::new(
            Arc::new(SimulatedDevice::new(&simulator)),
            device,
            SettleConfig::default(),
            console.clone(),
        );
        Self { session, console }
    }

    fn default_bench() -> Self {
        Self::new(SimulatorConfig::default(), DeviceConfig::default())
    }

    fn runner(&self) -> TestRunner {
        TestRunner::new(Assertions::new(self.console.clone()))
    }
}

#[tokio::test(start_paused = true)]
async fn power_supply_suite_passes_on_the_loopback_bench() {
    let bench = Bench::default_bench();
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::PowerSupply, &mut runner, &bench.session)
        .await
        .unwrap();

    assert_eq!(run.exit_code, 0, "console:\n{}", bench.console.lines().join("\n"));
    assert_eq!(run.summary.total, 4);
    assert_eq!(run.summary.passed, 4);
    assert!(run
        .results
        .iter()
        .map(|result| result.name.as_str())
        .eq(SuiteKind::PowerSupply.test_ids().iter().copied()));
    assert!(!bench.session.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn signal_generator_suite_passes_on_the_loopback_bench() {
    let bench = Bench::default_bench();
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::SignalGenerator, &mut runner, &bench.session)
        .await
        .unwrap();

    assert_eq!(run.exit_code, 0, "console:\n{}", bench.console.lines().join("\n"));
    assert_eq!(run.summary.total, 18);
    assert_eq!(run.summary.passed, 18);
    assert_eq!(run.summary.skipped, 0);
    assert!(run
        .results
        .iter()
        .all(|result| result.status == TestStatus::Passed));
    assert!(bench.console.contains("Testing noise amplitude: 2.5V"));
    assert!(bench.console.contains("Testing math function: 8Vpp @ 1000Hz"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_aborts_before_any_test() {
    let simulator = SimulatorConfig {
        reachable_uris: Vec::new(),
        ..SimulatorConfig::default()
    };
    let bench = Bench::new(simulator, DeviceConfig::default());
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::PowerSupply, &mut runner, &bench.session)
        .await
        .unwrap();

    assert!(run.aborted());
    assert_eq!(run.exit_code, EXIT_FAILURE);
    assert_eq!(run.summary.total, 0);
    assert!(bench.console.contains("✗ Failed to connect to both device and emulator"));
    assert!(bench
        .console
        .contains("ERROR: Cannot proceed without device connection"));
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_the_emulator() {
    let device = DeviceConfig {
        uri: "ip:10.9.9.9".to_string(),
        emulator_uri: "ip:127.0.0.1".to_string(),
    };
    let bench = Bench::new(SimulatorConfig::default(), device);
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::PowerSupply, &mut runner, &bench.session)
        .await
        .unwrap();

    assert_eq!(run.exit_code, 0);
    assert!(bench.console.contains("Device not found, trying emulator..."));
    assert!(bench.console.contains("✓ Successfully connected to emulator"));
}

#[tokio::test(start_paused = true)]
async fn missing_primary_tool_aborts_and_disconnects() {
    let simulator = SimulatorConfig {
        tools: vec!["Power Supply".to_string(), "Voltmeter".to_string()],
        ..SimulatorConfig::default()
    };
    let bench = Bench::new(simulator, DeviceConfig::default());
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::SignalGenerator, &mut runner, &bench.session)
        .await
        .unwrap();

    assert!(run.aborted());
    assert!(bench.console.contains("ERROR: Cannot access Signal Generator"));
    assert!(!bench.session.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn missing_measurement_tool_errors_each_test() {
    let simulator = SimulatorConfig {
        tools: vec!["Power Supply".to_string()],
        ..SimulatorConfig::default()
    };
    let bench = Bench::new(simulator, DeviceConfig::default());
    let mut runner = bench.runner();

    let run = run_suite(SuiteKind::PowerSupply, &mut runner, &bench.session)
        .await
        .unwrap();

    assert_eq!(run.exit_code, EXIT_FAILURE);
    assert_eq!(run.summary.total, 4);
    assert_eq!(run.summary.errored, 4);
    // the failed switch leaves the supply active, so later tests still start
    assert!(run
        .results
        .iter()
        .all(|result| result.status == TestStatus::Errored));
}

#[tokio::test(start_paused = true)]
async fn suites_can_run_back_to_back_on_one_session() {
    let bench = Bench::default_bench();

    let mut runs = Vec::new();
    for kind in SuiteKind::ALL {
        let mut runner = bench.runner();
        runs.push(run_suite(kind, &mut runner, &bench.session).await.unwrap());
    }

    assert_eq!(runs.len(), 2);
    assert_eq!(combined_exit_code(&runs), 0);
}
