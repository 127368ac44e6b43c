//! Simulated instrument
//!
//! An in-process stand-in for the application under test, wired as the loopback
//! bench the acceptance suites expect:
//!
//! - power supply outputs V+ / V- are measured by voltmeter channels 1 / 2
//! - signal generator outputs W1 / W2 are observed by oscilloscope channels 1 / 2
//!
//! Every write reaches the measurement side only after `latency` (the asynchronous
//! settle the real hardware exhibits); a read before that sees the previous value.
//! Timing uses `tokio::time`, so tests can run it on a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = Arc::new(SimulatedDevice::new(&SimulatorConfig::default()));
//! let session = DeviceSession::new(device, DeviceConfig::default(), SettleConfig::default(), console);
//! ```

mod generator;
mod power;

pub use generator::{SimOscilloscope, SimSignalGenerator};
pub use power::{SimPowerSupply, SimVoltmeter};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::SimulatorConfig;
use crate::panels::{OscilloscopePanel, PowerSupplyPanel, SignalGeneratorPanel, VoltmeterPanel};
use crate::session::{DeviceBackend, DeviceId, Tool};

/// A value that reaches its new target only after the bench latency.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settling<T: Copy> {
    previous: T,
    target: T,
    changed_at: Instant,
}

impl<T: Copy + PartialEq> Settling<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            previous: value,
            target: value,
            changed_at: Instant::now(),
        }
    }

    /// Start moving to `target`. A no-op if it is already the target.
    pub(crate) fn set(&mut self, target: T, latency: Duration) {
        if target == self.target {
            return;
        }
        let now = Instant::now();
        self.previous = self.value_at(now, latency);
        self.target = target;
        self.changed_at = now;
    }

    pub(crate) fn value_at(&self, now: Instant, latency: Duration) -> T {
        if now.saturating_duration_since(self.changed_at) >= latency {
            self.target
        } else {
            self.previous
        }
    }

    pub(crate) fn current(&self, latency: Duration) -> T {
        self.value_at(Instant::now(), latency)
    }
}

/// Shared bench timing and noise.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BenchTiming {
    pub latency: Duration,
    pub noise_volts: f64,
}

impl BenchTiming {
    /// Uniform noise in `[-noise_volts, noise_volts]`.
    pub(crate) fn noise(&self) -> f64 {
        if self.noise_volts > 0.0 {
            rand::thread_rng().gen_range(-self.noise_volts..=self.noise_volts)
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct DeviceEntry {
    uri: String,
    connected: bool,
}

/// Simulated instrument implementing [`DeviceBackend`].
pub struct SimulatedDevice {
    reachable: Vec<String>,
    tools: Vec<Tool>,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    next_id: AtomicU64,
    active_tool: RwLock<Option<Tool>>,
    power: Arc<SimPowerSupply>,
    meter: Arc<SimVoltmeter>,
    generator: Arc<SimSignalGenerator>,
    scope: Arc<SimOscilloscope>,
}

impl SimulatedDevice {
    /// Build the bench from configuration. Unknown tool names are ignored with a warning.
    pub fn new(config: &SimulatorConfig) -> Self {
        let timing = BenchTiming {
            latency: config.latency(),
            noise_volts: config.noise_volts,
        };
        let tools = config
            .tools
            .iter()
            .filter_map(|name| match name.parse::<Tool>() {
                Ok(tool) => Some(tool),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring simulator tool");
                    None
                }
            })
            .collect();

        let power = Arc::new(SimPowerSupply::new(timing));
        let meter = Arc::new(SimVoltmeter::new(power.clone(), timing));
        let generator = Arc::new(SimSignalGenerator::new(timing));
        let scope = Arc::new(SimOscilloscope::new(generator.clone(), timing));

        Self {
            reachable: config.reachable_uris.clone(),
            tools,
            devices: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active_tool: RwLock::new(None),
            power,
            meter,
            generator,
            scope,
        }
    }

    /// Tool activated by the last successful `switch_tool`.
    pub async fn active_tool(&self) -> Option<Tool> {
        *self.active_tool.read().await
    }

    /// Number of registered devices.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Concrete power supply, for test inspection.
    pub fn power_supply_sim(&self) -> Arc<SimPowerSupply> {
        self.power.clone()
    }

    /// Concrete signal generator, for test inspection.
    pub fn signal_generator_sim(&self) -> Arc<SimSignalGenerator> {
        self.generator.clone()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(&SimulatorConfig::default())
    }
}

#[async_trait]
impl DeviceBackend for SimulatedDevice {
    async fn add_device(&self, uri: &str) -> Result<DeviceId> {
        let id = DeviceId(format!("dev{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        tracing::debug!(%id, uri, "SimulatedDevice: add");
        self.devices.write().await.insert(
            id.clone(),
            DeviceEntry {
                uri: uri.to_string(),
                connected: false,
            },
        );
        Ok(id)
    }

    async fn connect_device(&self, id: &DeviceId) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown device {}", id))?;
        entry.connected = self.reachable.iter().any(|uri| *uri == entry.uri);
        tracing::debug!(%id, uri = %entry.uri, connected = entry.connected, "SimulatedDevice: connect");
        Ok(entry.connected)
    }

    async fn disconnect_device(&self, id: &DeviceId) -> Result<()> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown device {}", id))?;
        if !entry.connected {
            bail!("Device {} is not connected", id);
        }
        entry.connected = false;
        *self.active_tool.write().await = None;
        Ok(())
    }

    async fn remove_device(&self, id: &DeviceId) -> Result<()> {
        self.devices
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Unknown device {}", id))
    }

    async fn switch_tool(&self, tool: Tool) -> Result<bool> {
        let any_connected = self.devices.read().await.values().any(|d| d.connected);
        if !any_connected {
            bail!("No connected device");
        }
        if !self.tools.contains(&tool) {
            return Ok(false);
        }
        *self.active_tool.write().await = Some(tool);
        Ok(true)
    }

    fn power_supply(&self) -> Arc<dyn PowerSupplyPanel> {
        self.power.clone()
    }

    fn voltmeter(&self) -> Arc<dyn VoltmeterPanel> {
        self.meter.clone()
    }

    fn signal_generator(&self) -> Arc<dyn SignalGeneratorPanel> {
        self.generator.clone()
    }

    fn oscilloscope(&self) -> Arc<dyn OscilloscopePanel> {
        self.scope.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test(start_paused = true)]
    async fn settling_value_switches_after_latency() {
        let latency = Duration::from_millis(100);
        let mut value = Settling::new(0.0);
        value.set(5.0, latency);
        assert_eq!(value.current(latency), 0.0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(value.current(latency), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn settling_restart_keeps_observed_value() {
        let latency = Duration::from_millis(100);
        let mut value = Settling::new(1.0);
        value.set(2.0, latency);
        tokio::time::advance(Duration::from_millis(50)).await;
        // still showing 1.0, so the next transition starts from 1.0
        value.set(3.0, latency);
        assert_eq!(value.current(latency), 1.0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(value.current(latency), 3.0);
    }

    #[tokio::test]
    async fn only_reachable_uris_connect() {
        let device = SimulatedDevice::default();
        let far = device.add_device("ip:192.168.2.1").await.unwrap();
        let near = device.add_device("ip:127.0.0.1").await.unwrap();
        assert!(!device.connect_device(&far).await.unwrap());
        assert!(device.connect_device(&near).await.unwrap());
        assert_eq!(device.device_count().await, 2);
    }

    #[tokio::test]
    async fn switch_tool_requires_connection_and_known_tool() {
        let config = SimulatorConfig {
            tools: vec!["Voltmeter".to_string()],
            ..Default::default()
        };
        let device = SimulatedDevice::new(&config);
        assert!(device.switch_tool(Tool::Voltmeter).await.is_err());

        let id = device.add_device("ip:127.0.0.1").await.unwrap();
        device.connect_device(&id).await.unwrap();
        assert!(device.switch_tool(Tool::Voltmeter).await.unwrap());
        assert!(!device.switch_tool(Tool::Oscilloscope).await.unwrap());
        assert_eq!(device.active_tool().await, Some(Tool::Voltmeter));
    }

    #[tokio::test]
    async fn disconnect_unknown_device_errors() {
        let device = SimulatedDevice::default();
        assert!(device
            .disconnect_device(&DeviceId("nope".into()))
            .await
            .is_err());
        assert!(device.remove_device(&DeviceId("nope".into())).await.is_err());
    }

    /// Log sink for a scoped subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            let bytes = self.0.lock().unwrap();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_tools_are_ignored_with_a_warning() {
        let config = SimulatorConfig {
            tools: vec!["Voltmeter".to_string(), "Logic Analyzer".to_string()],
            ..Default::default()
        };
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        // scoped to this thread, so a global subscriber installed elsewhere does not matter
        let device = tracing::subscriber::with_default(subscriber, || SimulatedDevice::new(&config));

        assert_eq!(device.tools, vec![Tool::Voltmeter]);
        let text = logs.text();
        assert!(text.contains("ignoring simulator tool"), "{}", text);
        assert!(text.contains("Logic Analyzer"), "{}", text);
    }
}
