//! Typed channel configuration for the panels.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{HarnessError, HarnessResult};

fn finite(value: f64, what: &str) -> HarnessResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(HarnessError::InvalidSetting(format!("{} must be finite, got {}", what, value)))
    }
}

/// Periodic waveform shapes offered by the signal generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    Sine,
    Square,
    Triangle,
    Trapezoidal,
    RisingSawtooth,
    FallingSawtooth,
}

impl WaveformKind {
    pub const ALL: [WaveformKind; 6] = [
        WaveformKind::Sine,
        WaveformKind::Square,
        WaveformKind::Triangle,
        WaveformKind::Trapezoidal,
        WaveformKind::RisingSawtooth,
        WaveformKind::FallingSawtooth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sine => "sine",
            Self::Square => "square",
            Self::Triangle => "triangle",
            Self::Trapezoidal => "trapezoidal",
            Self::RisingSawtooth => "rising_sawtooth",
            Self::FallingSawtooth => "falling_sawtooth",
        }
    }
}

impl FromStr for WaveformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| format!("Unknown waveform '{}'", s))
    }
}

/// Parameters of a periodic output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub kind: WaveformKind,
    /// Peak-to-peak amplitude in volts
    pub amplitude: f64,
    /// Frequency in hertz
    pub frequency: f64,
    /// DC offset in volts
    pub offset: f64,
    /// Phase in degrees
    pub phase: f64,
    /// Duty cycle in percent (square waves)
    pub duty: f64,
}

impl Waveform {
    /// A waveform with zero offset and phase and 50 % duty.
    pub fn new(kind: WaveformKind, amplitude: f64, frequency: f64) -> Self {
        Self {
            kind,
            amplitude,
            frequency,
            offset: 0.0,
            phase: 0.0,
            duty: 50.0,
        }
    }

    /// Trapezoid given its segment durations in seconds. The period is their sum.
    pub fn trapezoidal(amplitude: f64, rise: f64, fall: f64, hold_high: f64, hold_low: f64) -> Self {
        let period = rise + fall + hold_high + hold_low;
        let frequency = if period > 0.0 { 1.0 / period } else { 0.0 };
        Self::new(WaveformKind::Trapezoidal, amplitude, frequency)
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_duty(mut self, duty: f64) -> Self {
        self.duty = duty;
        self
    }
}

/// Noise distributions the generator can add on top of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    #[default]
    None,
    Uniform,
    Gaussian,
    Laplacian,
    Impulse,
}

impl NoiseKind {
    pub const ALL: [NoiseKind; 5] = [
        NoiseKind::None,
        NoiseKind::Uniform,
        NoiseKind::Gaussian,
        NoiseKind::Laplacian,
        NoiseKind::Impulse,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Uniform => "uniform",
            Self::Gaussian => "gaussian",
            Self::Laplacian => "laplacian",
            Self::Impulse => "impulse",
        }
    }
}

impl FromStr for NoiseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| format!("Unknown noise type '{}'", s))
    }
}

/// Additive noise on a generator channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Noise {
    pub kind: NoiseKind,
    /// Volts; the bound for uniform noise, the scale for the other kinds
    pub amplitude: f64,
}

impl Noise {
    /// Uniform noise in `[-amplitude, amplitude]`.
    pub fn uniform(amplitude: f64) -> Self {
        Self {
            kind: NoiseKind::Uniform,
            amplitude,
        }
    }

    pub fn is_active(&self) -> bool {
        self.kind != NoiseKind::None && self.amplitude != 0.0
    }
}

/// Arbitrary output computed from an expression in `t` (seconds), e.g.
/// `5*sin(2*3.14159265*100*t)`. The generator plays one record of
/// `record_length` seconds in a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathFunction {
    pub expression: String,
    /// Samples per second
    pub sample_rate: f64,
    /// Seconds per record
    pub record_length: f64,
}

impl MathFunction {
    pub fn new(expression: impl Into<String>, sample_rate: f64, record_length: f64) -> Self {
        Self {
            expression: expression.into(),
            sample_rate,
            record_length,
        }
    }
}

/// What a generator channel produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GeneratorMode {
    /// DC level in volts
    Constant { volts: f64 },
    Waveform(Waveform),
    Math(MathFunction),
}

/// Full configuration of one signal generator channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorChannel {
    pub enabled: bool,
    pub mode: GeneratorMode,
    #[serde(default)]
    pub noise: Noise,
}

impl Default for GeneratorChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: GeneratorMode::Constant { volts: 0.0 },
            noise: Noise::default(),
        }
    }
}

impl GeneratorChannel {
    /// Enabled constant output.
    pub fn constant(volts: f64) -> Self {
        Self {
            enabled: true,
            mode: GeneratorMode::Constant { volts },
            noise: Noise::default(),
        }
    }

    /// Enabled periodic output.
    pub fn waveform(waveform: Waveform) -> Self {
        Self {
            enabled: true,
            mode: GeneratorMode::Waveform(waveform),
            noise: Noise::default(),
        }
    }

    /// Enabled math-function output.
    pub fn math(function: MathFunction) -> Self {
        Self {
            enabled: true,
            mode: GeneratorMode::Math(function),
            noise: Noise::default(),
        }
    }

    pub fn with_noise(mut self, noise: Noise) -> Self {
        self.noise = noise;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject settings the generator cannot produce (non-finite numbers, empty records).
    pub fn validate(&self) -> HarnessResult<()> {
        match &self.mode {
            GeneratorMode::Constant { volts } => finite(*volts, "constant level")?,
            GeneratorMode::Waveform(wave) => {
                finite(wave.amplitude, "amplitude")?;
                finite(wave.frequency, "frequency")?;
                finite(wave.offset, "offset")?;
                finite(wave.phase, "phase")?;
                finite(wave.duty, "duty cycle")?;
            }
            GeneratorMode::Math(function) => {
                if function.expression.trim().is_empty() {
                    return Err(HarnessError::InvalidSetting(
                        "math function is empty".to_string(),
                    ));
                }
                for (value, what) in [
                    (function.sample_rate, "sample rate"),
                    (function.record_length, "record length"),
                ] {
                    finite(value, what)?;
                    if value <= 0.0 {
                        return Err(HarnessError::InvalidSetting(format!(
                            "{} must be positive, got {}",
                            what, value
                        )));
                    }
                }
            }
        }
        finite(self.noise.amplitude, "noise amplitude")
    }
}

/// Oscilloscope input channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeChannel {
    pub enabled: bool,
    pub volts_per_div: f64,
}

impl Default for ScopeChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            volts_per_div: 1.0,
        }
    }
}

impl ScopeChannel {
    /// An enabled input at `volts_per_div`. Checked by [`ScopeChannel::validate`] when
    /// applied.
    pub fn enabled(volts_per_div: f64) -> Self {
        Self {
            enabled: true,
            volts_per_div,
        }
    }

    /// Volts per division must be finite and positive.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.volts_per_div.is_finite() && self.volts_per_div > 0.0 {
            Ok(())
        } else {
            Err(HarnessError::InvalidSetting(format!(
                "volts per division must be finite and positive, got {}",
                self.volts_per_div
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Auto,
    Normal,
}

/// Oscilloscope trigger settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Source channel index
    pub source: usize,
    /// Level in volts
    pub level: f64,
    pub mode: TriggerMode,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            source: 0,
            level: 0.0,
            mode: TriggerMode::Auto,
        }
    }
}

impl Trigger {
    /// Auto trigger at 0 V on `source`.
    pub fn auto(source: usize) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }
}

/// Automatic measurements of one oscilloscope channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelMeasurements {
    pub mean: f64,
    pub peak_to_peak: f64,
    /// Period in seconds; 0 when no periodic signal was found
    pub period: f64,
    pub min: f64,
    pub max: f64,
    pub rms: f64,
}

impl ChannelMeasurements {
    /// `1 / period`, or 0 when no period was measured.
    pub fn frequency(&self) -> f64 {
        if self.period > 0.0 {
            1.0 / self.period
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waveform_kind_parses_loose_names() {
        assert_eq!("Sine".parse::<WaveformKind>(), Ok(WaveformKind::Sine));
        assert_eq!(
            "rising sawtooth".parse::<WaveformKind>(),
            Ok(WaveformKind::RisingSawtooth)
        );
        assert_eq!(
            "falling-sawtooth".parse::<WaveformKind>(),
            Ok(WaveformKind::FallingSawtooth)
        );
        assert!("noise".parse::<WaveformKind>().is_err());
    }

    #[test]
    fn noise_kind_parses_names() {
        assert_eq!("Uniform".parse::<NoiseKind>(), Ok(NoiseKind::Uniform));
        assert_eq!(" none ".parse::<NoiseKind>(), Ok(NoiseKind::None));
        assert!("pink".parse::<NoiseKind>().is_err());
        assert!(!Noise::default().is_active());
        assert!(Noise::uniform(0.5).is_active());
    }

    #[test]
    fn non_finite_settings_are_rejected() {
        assert!(ScopeChannel::enabled(1.0).validate().is_ok());
        assert!(ScopeChannel::default().validate().is_ok());
        assert!(matches!(
            ScopeChannel::enabled(f64::NAN).validate(),
            Err(HarnessError::InvalidSetting(_))
        ));
        assert!(ScopeChannel::enabled(f64::INFINITY).validate().is_err());
        assert!(ScopeChannel::enabled(0.0).validate().is_err());

        assert!(GeneratorChannel::constant(f64::NAN).validate().is_err());
        let wave = Waveform::new(WaveformKind::Sine, 2.0, f64::INFINITY);
        assert!(GeneratorChannel::waveform(wave).validate().is_err());
        let noisy = GeneratorChannel::constant(1.0).with_noise(Noise::uniform(f64::NAN));
        assert!(noisy.validate().is_err());
    }

    #[test]
    fn math_records_must_be_non_empty() {
        let ok = MathFunction::new("sin(t)", 1e6, 0.01);
        assert!(GeneratorChannel::math(ok).validate().is_ok());
        let empty = MathFunction::new("  ", 1e6, 0.01);
        assert!(GeneratorChannel::math(empty).validate().is_err());
        let no_record = MathFunction::new("sin(t)", 1e6, 0.0);
        assert!(GeneratorChannel::math(no_record).validate().is_err());
    }

    #[test]
    fn frequency_is_zero_without_period() {
        let m = ChannelMeasurements::default();
        assert_eq!(m.frequency(), 0.0);
        let m = ChannelMeasurements {
            period: 0.001,
            ..Default::default()
        };
        assert!((m.frequency() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn trapezoid_period_is_segment_sum() {
        let wave = Waveform::trapezoidal(5.0, 1e-6, 1e-6, 1e-6, 1e-6);
        assert!((wave.frequency - 250_000.0).abs() < 1e-3);
        assert_eq!(wave.kind, WaveformKind::Trapezoidal);
    }

    #[test]
    fn builders_fill_defaults() {
        let wave = Waveform::new(WaveformKind::Square, 5.0, 1000.0).with_duty(25.0);
        assert_eq!(wave.offset, 0.0);
        assert_eq!(wave.duty, 25.0);
        let channel = GeneratorChannel::waveform(wave);
        assert!(channel.enabled);
        assert!(!channel.disabled().enabled);
    }
}
