//! Simulated power supply and voltmeter.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{BenchTiming, Settling};
use crate::panels::{check_channel, PowerSupplyPanel, VoltmeterPanel, CHANNELS};

/// Positive rail limit of DAC1.
pub const POSITIVE_RAIL: f64 = 5.0;
/// Negative rail limit of DAC2.
pub const NEGATIVE_RAIL: f64 = -5.0;

#[derive(Debug)]
struct SupplyState {
    running: bool,
    enabled: [bool; CHANNELS],
    /// Clamped values written by the user
    programmed: [f64; CHANNELS],
    tracking: bool,
    tracking_percent: f64,
    outputs: [Settling<f64>; CHANNELS],
}

impl SupplyState {
    /// DAC values after tracking is applied.
    fn effective(&self) -> [f64; CHANNELS] {
        let negative = if self.tracking {
            clamp_rail(1, -(self.programmed[0] * self.tracking_percent / 100.0))
        } else {
            self.programmed[1]
        };
        [self.programmed[0], negative]
    }

    /// Volts present on the output terminals once settled.
    fn terminal_targets(&self) -> [f64; CHANNELS] {
        let effective = self.effective();
        std::array::from_fn(|ch| {
            if self.running && self.enabled[ch] {
                effective[ch]
            } else {
                0.0
            }
        })
    }
}

fn clamp_rail(channel: usize, volts: f64) -> f64 {
    if channel == 0 {
        volts.clamp(0.0, POSITIVE_RAIL)
    } else {
        volts.clamp(NEGATIVE_RAIL, 0.0)
    }
}

/// Dual-rail supply whose outputs follow writes after the bench latency.
pub struct SimPowerSupply {
    state: RwLock<SupplyState>,
    timing: BenchTiming,
}

impl SimPowerSupply {
    pub(crate) fn new(timing: BenchTiming) -> Self {
        Self {
            state: RwLock::new(SupplyState {
                running: false,
                enabled: [true; CHANNELS],
                programmed: [0.0; CHANNELS],
                tracking: false,
                tracking_percent: 100.0,
                outputs: [Settling::new(0.0); CHANNELS],
            }),
            timing,
        }
    }

    /// Voltage currently present on an output terminal.
    pub async fn terminal_voltage(&self, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        let state = self.state.read().await;
        Ok(state.outputs[channel].current(self.timing.latency))
    }

    async fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut SupplyState) + Send,
    {
        let mut state = self.state.write().await;
        change(&mut state);
        let targets = state.terminal_targets();
        for (output, target) in state.outputs.iter_mut().zip(targets) {
            output.set(target, self.timing.latency);
        }
        tracing::trace!(?targets, "SimPowerSupply: outputs retargeted");
    }
}

#[async_trait]
impl PowerSupplyPanel for SimPowerSupply {
    async fn set_running(&self, running: bool) -> Result<()> {
        self.update(|s| s.running = running).await;
        Ok(())
    }

    async fn set_dac_enabled(&self, channel: usize, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        self.update(|s| s.enabled[channel] = enabled).await;
        Ok(())
    }

    async fn set_dac_value(&self, channel: usize, volts: f64) -> Result<()> {
        check_channel(channel)?;
        if !volts.is_finite() {
            bail!("Invalid DAC value {}", volts);
        }
        let clamped = clamp_rail(channel, volts);
        if clamped != volts {
            tracing::debug!(channel, volts, clamped, "SimPowerSupply: value clamped to rail");
        }
        self.update(|s| s.programmed[channel] = clamped).await;
        Ok(())
    }

    async fn dac_value(&self, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        Ok(self.state.read().await.effective()[channel])
    }

    async fn set_tracking(&self, tracking: bool) -> Result<()> {
        self.update(|s| s.tracking = tracking).await;
        Ok(())
    }

    async fn set_tracking_percent(&self, percent: f64) -> Result<()> {
        if !percent.is_finite() {
            bail!("Invalid tracking ratio {}", percent);
        }
        let percent = percent.clamp(0.0, 100.0);
        self.update(|s| s.tracking_percent = percent).await;
        Ok(())
    }
}

#[derive(Debug)]
struct MeterState {
    running: bool,
    started_at: Instant,
    last: [f64; CHANNELS],
}

/// Voltmeter wired to the supply terminals: channel 1 reads V+, channel 2 reads V-.
///
/// A reading needs one latency of acquisition after the meter starts; until then
/// (and while stopped) the previous reading is returned.
pub struct SimVoltmeter {
    supply: Arc<SimPowerSupply>,
    state: RwLock<MeterState>,
    timing: BenchTiming,
}

impl SimVoltmeter {
    pub(crate) fn new(supply: Arc<SimPowerSupply>, timing: BenchTiming) -> Self {
        Self {
            supply,
            state: RwLock::new(MeterState {
                running: false,
                started_at: Instant::now(),
                last: [0.0; CHANNELS],
            }),
            timing,
        }
    }
}

#[async_trait]
impl VoltmeterPanel for SimVoltmeter {
    async fn set_running(&self, running: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if running && !state.running {
            state.started_at = Instant::now();
        }
        state.running = running;
        Ok(())
    }

    async fn value(&self, channel: usize) -> Result<f64> {
        check_channel(channel)?;
        let mut state = self.state.write().await;
        let acquired = state.running && state.started_at.elapsed() >= self.timing.latency;
        if acquired {
            let volts = self.supply.terminal_voltage(channel).await? + self.timing.noise();
            state.last[channel] = volts;
        }
        Ok(state.last[channel])
    }
}
