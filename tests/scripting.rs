//! Rhai script host against the simulated bench.
//!
//! Script bindings block on the runtime, so these run on a multi-thread runtime with
//! zero latency and settle delays instead of a paused clock.

use std::fs;
use std::sync::Arc;

use panel_harness::config::{DeviceConfig, SettleConfig, SimulatorConfig};
use panel_harness::runner::TestStatus;
use panel_harness::scripting::ScriptHost;
use panel_harness::simulator::SimulatedDevice;
use panel_harness::{Assertions, ConsoleLog, DeviceSession, HarnessError, TestRunner};

fn host() -> ScriptHost {
    let console = ConsoleLog::quiet();
    let simulator = SimulatorConfig {
        latency_ms: 0,
        noise_volts: 0.0,
        ..SimulatorConfig::default()
    };
    let device = DeviceConfig {
        uri: "ip:127.0.0.1".to_string(),
        ..DeviceConfig::default()
    };
    let session = Arc::new(DeviceSession::new(
        Arc::new(SimulatedDevice::new(&simulator)),
        device,
        SettleConfig::immediate(),
        console.clone(),
    ));
    ScriptHost::new(session, TestRunner::new(Assertions::new(console)))
}

/// A host whose `msleep` returns at once; the zero-latency bench needs no waiting.
fn fast_host() -> ScriptHost {
    let mut host = host();
    host.engine_mut().register_fn("msleep", |_ms: i64| {});
    host
}

fn names(host: &ScriptHost) -> Vec<String> {
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    runner.results().iter().map(|result| result.name.clone()).collect()
}

fn statuses(host: &ScriptHost) -> Vec<TestStatus> {
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    runner.results().iter().map(|result| result.status).collect()
}

const PREAMBLE: &str = r#"
    TestFramework::init("Script Suite");
    if !TestFramework::connectToDevice() { exit(1); }
"#;

#[tokio::test(flavor = "multi_thread")]
async fn power_supply_loopback_from_a_script() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Power Supply");

        TestFramework::runTest("TST.PS.SCRIPT", || {{
            power.dac1_enabled = true;
            power.running = true;
            power.dac1_value = 3.3;
            msleep(10);

            switchToTool("Voltmeter");
            dmm.running = true;
            msleep(10);
            let measured = dmm.value_ch1;
            dmm.running = false;
            switchToTool("Power Supply");

            TestFramework::assertApproxEqual(measured, 3.3, 0.06, "DAC1 output verification")
        }});

        TestFramework::disconnectFromDevice();
        exit(TestFramework::printSummary());
        "#
    );

    let outcome = host.run_script(&script).unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(statuses(&host), [TestStatus::Passed]);
    let console = host.session().console();
    assert!(console.contains("✓ DAC1 output verification"));
    assert!(console.contains("Test Summary"));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_assertion_sets_exit_code() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        TestFramework::runTest("TST.EQUAL", || TestFramework::assertEqual(2 + 2, 5, "arithmetic"));
        exit(TestFramework::printSummary());
        "#
    );

    let outcome = host.run_script(&script).unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(statuses(&host), [TestStatus::Failed]);
    let console = host.session().console();
    assert!(console.contains("✗ arithmetic"));
    assert!(console.contains("Expected: 5"));
    assert!(console.contains("Actual: 4"));
}

#[tokio::test(flavor = "multi_thread")]
async fn panel_errors_become_test_errors() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Power Supply");
        TestFramework::runTest("TST.WRONG_TOOL", || {{
            dmm.running = true;
            true
        }});
        TestFramework::runTest("TST.AFTER", || true);
        "#
    );

    host.run_script(&script).unwrap();

    assert_eq!(statuses(&host), [TestStatus::Errored, TestStatus::Passed]);
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    let message = runner.results()[0].message.clone().unwrap_or_default();
    assert!(message.contains("not the active tool"), "{}", message);
}

#[tokio::test(flavor = "multi_thread")]
async fn oscilloscope_refuses_live_reads() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Signal Generator");
        siggen.set_constant(0, 2.5);
        siggen.running = true;

        switchToTool("Oscilloscope");
        osc.enable_channel(0, 1.0);
        osc.running = true;
        TestFramework::runTest("TST.LIVE_READ", || osc.channel(0).mean > 0.0);

        osc.running = false;
        TestFramework::runTest("TST.STOPPED_READ", || {{
            TestFramework::assertApproxEqual(osc.channel(0).mean, 2.5, 0.1, "Constant 2.5V")
        }});
        "#
    );

    host.run_script(&script).unwrap();

    assert_eq!(statuses(&host), [TestStatus::Errored, TestStatus::Passed]);
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    let message = runner.results()[0].message.clone().unwrap_or_default();
    assert!(message.contains("WRITE ALL: -9"), "{}", message);
}

#[tokio::test(flavor = "multi_thread")]
async fn waveform_settings_need_waveform_mode() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Signal Generator");
        siggen.set_constant(1, 1.0);
        siggen.set_offset(1, 0.5);
        "#
    );

    let result = host.run_script(&script);
    assert!(matches!(result, Err(HarnessError::Script(ref msg)) if msg.contains("constant mode")));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_finite_volts_per_div_errors_one_test() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Oscilloscope");
        TestFramework::runTest("TST.NAN_SCALE", || {{
            osc.enable_channel(0, 0.0 / 0.0);
            osc.running = true;
            osc.running = false;
            true
        }});
        TestFramework::runTest("TST.AFTER", || true);
        exit(TestFramework::printSummary());
        "#
    );

    let outcome = host.run_script(&script).unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(statuses(&host), [TestStatus::Errored, TestStatus::Passed]);
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    let message = runner.results()[0].message.clone().unwrap_or_default();
    assert!(message.contains("volts per division"), "{}", message);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_host_call_errors_one_test() {
    let mut host = host();
    host.engine_mut()
        .register_fn("explode", || -> bool { panic!("instrument driver exploded") });
    let script = format!(
        r#"{PREAMBLE}
        TestFramework::runTest("TST.PANIC", || explode());
        TestFramework::runTest("TST.AFTER", || true);
        exit(TestFramework::printSummary());
        "#
    );

    let outcome = host.run_script(&script).unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(statuses(&host), [TestStatus::Errored, TestStatus::Passed]);
    let runner = host.runner();
    let runner = runner.lock().unwrap();
    let message = runner.results()[0].message.clone().unwrap_or_default();
    assert!(message.contains("instrument driver exploded"), "{}", message);
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_inside_a_test_stops_the_script() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        TestFramework::runTest("TST.EXIT", || {{ exit(7); true }});
        TestFramework::runTest("TST.NEVER", || true);
        "#
    );

    let outcome = host.run_script(&script).unwrap();

    assert_eq!(outcome.exit_code, 7);
    assert_eq!(statuses(&host), [TestStatus::Errored]);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_test_names_are_rejected() {
    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        TestFramework::runTest("TST.ONCE", || true);
        TestFramework::runTest("TST.ONCE", || true);
        "#
    );

    assert!(matches!(host.run_script(&script), Err(HarnessError::Script(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn save_results_picks_format_from_extension() {
    let dir = tempfile::tempdir().unwrap();
    let json = dir.path().join("results.json");
    let junit = dir.path().join("reports/results.xml");
    let csv = dir.path().join("results.csv");

    let host = host();
    let script = format!(
        r#"{PREAMBLE}
        TestFramework::runTest("TST.PASS", || true);
        TestFramework::runTest("TST.SKIP", || "SKIP");
        TestFramework::saveResults("{}");
        TestFramework::saveResults("{}");
        TestFramework::saveResults("{}");
        "#,
        json.display(),
        junit.display(),
        csv.display()
    );

    host.run_script(&script).unwrap();

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(report["suite"], "Script Suite");
    assert_eq!(report["summary"]["total"], 2);
    assert_eq!(report["summary"]["skipped"], 1);
    assert_eq!(report["tests"][1]["status"], "SKIP");

    let xml = fs::read_to_string(&junit).unwrap();
    assert!(xml.contains("<testsuite"));
    assert!(xml.contains("<skipped />"));

    let table = fs::read_to_string(&csv).unwrap();
    assert!(table.starts_with("name,status,message,duration_ms"));
    assert!(table.contains("TST.PASS,PASS"));

    assert!(host
        .session()
        .console()
        .contains(&format!("Test results saved to: {}", json.display())));
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_file_resolves_against_the_script_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("banner.rhai"),
        r#"printToConsole("banner loaded");"#,
    )
    .unwrap();
    let main = dir.path().join("main.rhai");
    fs::write(
        &main,
        r#"
        evaluateFile("banner.rhai");
        TestFramework::init("Nested");
        TestFramework::runTest("TST.NESTED", || true);
        exit(TestFramework::printSummary());
        "#,
    )
    .unwrap();

    let mut host = host();
    let outcome = host.run_file(&main).unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(host.session().console().contains("banner loaded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_script_file_is_an_io_error() {
    let mut host = host();
    let result = host.run_file("does/not/exist.rhai");
    assert!(matches!(result, Err(HarnessError::Io(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn shipped_power_supply_script_passes() {
    let mut host = fast_host();

    let outcome = host.run_file("scripts/power_supply.rhai").unwrap();

    assert_eq!(outcome.exit_code, 0, "{}", host.session().console().lines().join("\n"));
    assert_eq!(names(&host), ["TST.PS.SCRIPT.POSITIVE", "TST.PS.SCRIPT.TRACKING"]);
    assert_eq!(statuses(&host), [TestStatus::Passed, TestStatus::Passed]);
    let console = host.session().console();
    assert!(console.contains("Bench wiring"));
    assert!(console.contains("✓ DAC2 tracking slave at 50%"));
    assert!(!host.session().is_connected().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn shipped_signal_generator_script_passes() {
    let mut host = fast_host();

    let outcome = host.run_file("scripts/signal_generator.rhai").unwrap();

    assert_eq!(outcome.exit_code, 0, "{}", host.session().console().lines().join("\n"));
    assert_eq!(
        names(&host),
        [
            "TST.SG.SCRIPT.CONSTANT",
            "TST.SG.SCRIPT.SINE",
            "TST.SG.SCRIPT.NOISE",
            "TST.SG.SCRIPT.MATH"
        ]
    );
    assert!(statuses(&host).iter().all(|status| *status == TestStatus::Passed));
    assert!(host.session().console().contains("✓ Square Vpp with 1V uniform noise"));
}

#[tokio::test(flavor = "multi_thread")]
async fn power_tracking_property_drives_the_slave_rail() {
    let host = fast_host();
    let script = format!(
        r#"{PREAMBLE}
        switchToTool("Power Supply");
        power.tracking = true;
        power.tracking_percent = 25;
        power.dac1_value = 4.0;
        let slave = power.dac2_value;
        power.tracking = false;
        exit(if slave == -1.0 {{ 0 }} else {{ 9 }});
        "#
    );

    assert_eq!(host.run_script(&script).unwrap().exit_code, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shipped_scripts_compile() {
    let host = host();
    for name in [
        "scripts/power_supply.rhai",
        "scripts/signal_generator.rhai",
        "scripts/common.rhai",
        "scripts/banner.rhai",
    ] {
        let source = fs::read_to_string(name).unwrap();
        host.validate_script(&source)
            .unwrap_or_else(|e| panic!("{}: {}", name, e));
    }
}
