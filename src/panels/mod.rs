//! Instrument panel capabilities
//!
//! Each instrument tool of the application under test is a panel. Instead of a
//! dynamic property bag (`siggen.mode[0] = 1`), every panel is a small capability
//! trait with typed setters and getters per channel index, and multi-field channel
//! settings are explicit structs (see [`types`]).
//!
//! # Contract
//!
//! - All methods are async and take `&self`; implementations use interior mutability.
//! - Writes take effect *asynchronously* relative to the hardware. There is no
//!   completion signal: callers insert a settle delay (or use
//!   [`crate::settle::await_settled`]) before reading a dependent measurement.
//! - Channel indices are `0..CHANNELS`; anything else is an error.
//! - Errors use `anyhow::Result`, like the rest of the device-facing traits.

pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use types::{
    ChannelMeasurements, GeneratorChannel, GeneratorMode, MathFunction, Noise, NoiseKind,
    ScopeChannel, Trigger, TriggerMode, Waveform, WaveformKind,
};

/// Channels per panel on the supported instruments.
pub const CHANNELS: usize = 2;

/// Check a channel index against [`CHANNELS`].
pub fn check_channel(index: usize) -> crate::error::HarnessResult<()> {
    if index < CHANNELS {
        Ok(())
    } else {
        Err(crate::error::HarnessError::InvalidChannel {
            index,
            count: CHANNELS,
        })
    }
}

/// Capability: Dual-rail Power Supply
///
/// DAC1 (channel 0) drives the positive rail, 0 V to +5 V; DAC2 (channel 1) drives the
/// negative rail, 0 V to -5 V. Out-of-range settings are clamped to the rail.
///
/// In tracking mode DAC2 follows DAC1 as `-(DAC1 * tracking_percent / 100)` and direct
/// DAC2 writes have no effect.
#[async_trait]
pub trait PowerSupplyPanel: Send + Sync {
    /// Start or stop the supply outputs.
    async fn set_running(&self, running: bool) -> Result<()>;

    /// Enable or disable one DAC output.
    async fn set_dac_enabled(&self, channel: usize, enabled: bool) -> Result<()>;

    /// Set a DAC output voltage.
    async fn set_dac_value(&self, channel: usize, volts: f64) -> Result<()>;

    /// The programmed DAC value after clamping and tracking.
    async fn dac_value(&self, channel: usize) -> Result<f64>;

    /// `true` selects tracking mode, `false` independent mode.
    async fn set_tracking(&self, tracking: bool) -> Result<()>;

    /// Tracking ratio in percent (0..=100).
    async fn set_tracking_percent(&self, percent: f64) -> Result<()>;
}

/// Capability: DC Voltmeter
#[async_trait]
pub trait VoltmeterPanel: Send + Sync {
    /// Start or stop acquisition.
    async fn set_running(&self, running: bool) -> Result<()>;

    /// Latest reading of one channel in volts.
    async fn value(&self, channel: usize) -> Result<f64>;
}

/// Capability: Signal Generator
#[async_trait]
pub trait SignalGeneratorPanel: Send + Sync {
    /// Start or stop output on all enabled channels.
    async fn set_running(&self, running: bool) -> Result<()>;

    /// Replace the configuration of one channel. Settings failing
    /// [`GeneratorChannel::validate`] are rejected.
    async fn configure_channel(&self, channel: usize, config: GeneratorChannel) -> Result<()>;

    /// Current configuration of one channel.
    async fn channel(&self, channel: usize) -> Result<GeneratorChannel>;
}

/// Capability: Oscilloscope
///
/// # Contract
/// - `measurements` must only be read after `set_running(false)`; reading during a live
///   acquisition is a device error. Scenarios always stop before reading back.
#[async_trait]
pub trait OscilloscopePanel: Send + Sync {
    /// Start or stop acquisition.
    async fn set_running(&self, running: bool) -> Result<()>;

    /// Replace the configuration of one input channel. Settings failing
    /// [`ScopeChannel::validate`] are rejected.
    async fn configure_channel(&self, channel: usize, config: ScopeChannel) -> Result<()>;

    /// Horizontal scale in seconds per division.
    async fn set_time_base(&self, seconds_per_div: f64) -> Result<()>;

    async fn set_trigger(&self, trigger: Trigger) -> Result<()>;

    /// Measurements from the last completed acquisition on one channel.
    async fn measurements(&self, channel: usize) -> Result<ChannelMeasurements>;
}
