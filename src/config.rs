//! Harness configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (`HarnessConfig::default()`)
//! 2. `config/harness.toml` (or an explicit file)
//! 3. Environment variables prefixed with `PANEL_HARNESS_`, nested keys split on `__`
//!
//! Example: `PANEL_HARNESS_DEVICE__URI=ip:10.0.0.2`
//!
//! ```no_run
//! use panel_harness::config::HarnessConfig;
//!
//! let config = HarnessConfig::load()?;
//! println!("Device: {}", config.device.uri);
//! # Ok::<(), panel_harness::error::HarnessError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PANEL_HARNESS_";

/// Top-level harness configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device connection settings
    pub device: DeviceConfig,
    /// Named settle delays
    pub settle: SettleConfig,
    /// Simulated instrument settings
    pub simulator: SimulatorConfig,
    /// Report output paths
    pub report: ReportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Panel Harness".to_string(),
            log_level: "warn".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Where to find the device under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Primary device URI
    pub uri: String,
    /// URI tried when the primary device cannot be reached
    pub emulator_uri: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            uri: "ip:192.168.2.1".to_string(),
            emulator_uri: "ip:127.0.0.1".to_string(),
        }
    }
}

/// Settle delays in milliseconds.
///
/// There is no settle signal from the instrument; each value is an empirically tuned
/// wait inserted after a configuration write before the dependent read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// After a successful connection
    pub connect_ms: u64,
    /// After switching tools
    pub tool_switch_ms: u64,
    /// After changing a power supply or signal generator output
    pub output_ms: u64,
    /// After starting the voltmeter, before reading it
    pub meter_ms: u64,
    /// After starting the oscilloscope, before stopping and reading it
    pub scope_ms: u64,
    /// After changing tracking parameters
    pub tracking_ms: u64,
    /// Poll interval for `await_settled`
    pub poll_interval_ms: u64,
    /// Timeout for `await_settled`
    pub timeout_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2000,
            tool_switch_ms: 2000,
            output_ms: 500,
            meter_ms: 1000,
            scope_ms: 2000,
            tracking_ms: 1000,
            poll_interval_ms: 50,
            timeout_ms: 5000,
        }
    }
}

impl SettleConfig {
    /// Connection settle delay.
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Tool switch settle delay.
    pub fn tool_switch(&self) -> Duration {
        Duration::from_millis(self.tool_switch_ms)
    }

    /// Output settle delay.
    pub fn output(&self) -> Duration {
        Duration::from_millis(self.output_ms)
    }

    /// Voltmeter acquisition delay.
    pub fn meter(&self) -> Duration {
        Duration::from_millis(self.meter_ms)
    }

    /// Oscilloscope acquisition delay.
    pub fn scope(&self) -> Duration {
        Duration::from_millis(self.scope_ms)
    }

    /// Tracking settle delay.
    pub fn tracking(&self) -> Duration {
        Duration::from_millis(self.tracking_ms)
    }

    /// Settings with every delay set to zero, for fast simulated runs.
    pub fn immediate() -> Self {
        Self {
            connect_ms: 0,
            tool_switch_ms: 0,
            output_ms: 0,
            meter_ms: 0,
            scope_ms: 0,
            tracking_ms: 0,
            poll_interval_ms: 1,
            timeout_ms: 1000,
        }
    }
}

/// Simulated instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Time for a written output to reach the measurement side
    pub latency_ms: u64,
    /// Peak measurement noise in volts (uniform)
    pub noise_volts: f64,
    /// URIs the simulator accepts connections on
    pub reachable_uris: Vec<String>,
    /// Tool names the simulator exposes
    pub tools: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency_ms: 200,
            noise_volts: 0.005,
            reachable_uris: vec!["ip:127.0.0.1".to_string()],
            tools: vec![
                "Power Supply".to_string(),
                "Voltmeter".to_string(),
                "Signal Generator".to_string(),
                "Oscilloscope".to_string(),
            ],
        }
    }
}

impl SimulatorConfig {
    /// Output latency as a duration.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Report output paths; unset paths are not written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// JSON report path
    pub json: Option<PathBuf>,
    /// JUnit XML report path
    pub junit: Option<PathBuf>,
    /// CSV report path
    pub csv: Option<PathBuf>,
}

impl HarnessConfig {
    /// Load configuration from `config/harness.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> HarnessResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> HarnessResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider chain, exposed so callers can merge more sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HarnessConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HarnessResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(HarnessError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(HarnessError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.uri.trim().is_empty() || self.device.emulator_uri.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "Device URIs must not be empty".to_string(),
            ));
        }

        if self.settle.poll_interval_ms == 0 {
            return Err(HarnessError::Configuration(
                "settle.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.settle.poll_interval_ms > self.settle.timeout_ms {
            return Err(HarnessError::Configuration(format!(
                "settle.poll_interval_ms ({}) exceeds settle.timeout_ms ({})",
                self.settle.poll_interval_ms, self.settle.timeout_ms
            )));
        }

        if !self.simulator.noise_volts.is_finite() || self.simulator.noise_volts < 0.0 {
            return Err(HarnessError::Configuration(format!(
                "Invalid simulator.noise_volts {}. Must be finite and >= 0",
                self.simulator.noise_volts
            )));
        }

        Ok(())
    }

    /// The effective configuration as TOML, in the layout of `config/harness.toml`.
    pub fn to_toml(&self) -> HarnessResult<String> {
        toml::to_string_pretty(self).map_err(|e| HarnessError::Configuration(e.to_string()))
    }
}
