//! Layered configuration: defaults, TOML file, environment.

use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use panel_harness::config::HarnessConfig;
use panel_harness::HarnessError;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let config = HarnessConfig::load_from("config/harness.toml").unwrap();
    assert_eq!(config, HarnessConfig::default());
}

#[test]
#[serial]
fn file_overrides_defaults() {
    let file = toml_file(
        r#"
        [device]
        uri = "ip:10.0.0.2"

        [settle]
        scope_ms = 3000

        [report]
        junit = "target/reports/results.xml"
        "#,
    );

    let config = HarnessConfig::load_from(file.path()).unwrap();

    assert_eq!(config.device.uri, "ip:10.0.0.2");
    assert_eq!(config.device.emulator_uri, "ip:127.0.0.1");
    assert_eq!(config.settle.scope(), Duration::from_millis(3000));
    assert_eq!(config.settle.meter(), Duration::from_millis(1000));
    assert!(config.report.junit.is_some());
    assert!(config.report.json.is_none());
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = toml_file("[device]\nuri = \"ip:10.0.0.2\"\n");

    std::env::set_var("PANEL_HARNESS_DEVICE__URI", "ip:10.0.0.3");
    std::env::set_var("PANEL_HARNESS_SIMULATOR__LATENCY_MS", "50");
    let result = HarnessConfig::load_from(file.path());
    std::env::remove_var("PANEL_HARNESS_DEVICE__URI");
    std::env::remove_var("PANEL_HARNESS_SIMULATOR__LATENCY_MS");

    let config = result.unwrap();
    assert_eq!(config.device.uri, "ip:10.0.0.3");
    assert_eq!(config.simulator.latency(), Duration::from_millis(50));
}

#[test]
#[serial]
fn malformed_values_are_config_errors() {
    let file = toml_file("[settle]\nscope_ms = \"soon\"\n");
    let result = HarnessConfig::load_from(file.path());
    assert!(matches!(result, Err(HarnessError::Config(_))));
}

#[test]
#[serial]
fn invalid_values_fail_validation() {
    let file = toml_file("[application]\nlog_format = \"xml\"\n");
    let result = HarnessConfig::load_from(file.path());
    assert!(matches!(result, Err(HarnessError::Configuration(_))));
}
