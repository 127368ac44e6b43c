//! Simulated signal generator and oscilloscope loopback.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{BenchTiming, Settling};
use crate::panels::{
    check_channel, ChannelMeasurements, GeneratorChannel, GeneratorMode, MathFunction, Noise,
    NoiseKind, OscilloscopePanel, ScopeChannel, SignalGeneratorPanel, Trigger, Waveform,
    WaveformKind, CHANNELS,
};

/// Output swing limit of the generator in volts.
pub const OUTPUT_LIMIT: f64 = 5.0;
/// Horizontal divisions on screen.
pub const HORIZONTAL_DIVS: f64 = 10.0;
/// Vertical divisions either side of zero.
pub const VERTICAL_HALF_DIVS: f64 = 5.0;
/// Upper bound on the samples evaluated per math record.
pub const MATH_SAMPLES: usize = 4096;

/// Returned by the instrument when measurements are read mid-acquisition.
pub const LIVE_READ_ERROR: &str = "ERROR: WRITE ALL: -9";

/// Ideal measurements of what a generator channel drives onto its output.
///
/// Fails only for math functions that do not evaluate to a finite number.
pub fn ideal_measurements(channel: &GeneratorChannel) -> Result<ChannelMeasurements> {
    if !channel.enabled {
        return Ok(ChannelMeasurements::default());
    }
    let clean = match &channel.mode {
        GeneratorMode::Constant { volts } => {
            let v = volts.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT);
            ChannelMeasurements {
                mean: v,
                peak_to_peak: 0.0,
                period: 0.0,
                min: v,
                max: v,
                rms: v.abs(),
            }
        }
        GeneratorMode::Waveform(wave) => waveform_measurements(wave),
        GeneratorMode::Math(function) => sample_math(function)?,
    };
    Ok(with_noise(clean, &channel.noise))
}

fn waveform_measurements(wave: &Waveform) -> ChannelMeasurements {
    let half = (wave.amplitude.abs() / 2.0).min(OUTPUT_LIMIT);
    let offset = wave.offset;
    let max = (offset + half).min(OUTPUT_LIMIT);
    let min = (offset - half).max(-OUTPUT_LIMIT);
    let period = if wave.frequency > 0.0 {
        1.0 / wave.frequency
    } else {
        0.0
    };
    let (mean, mean_square) = match wave.kind {
        WaveformKind::Sine => (offset, offset * offset + half * half / 2.0),
        WaveformKind::Square => {
            let duty = (wave.duty / 100.0).clamp(0.0, 1.0);
            let mean = duty * max + (1.0 - duty) * min;
            (mean, duty * max * max + (1.0 - duty) * min * min)
        }
        WaveformKind::Triangle | WaveformKind::RisingSawtooth | WaveformKind::FallingSawtooth => {
            (offset, offset * offset + half * half / 3.0)
        }
        WaveformKind::Trapezoidal => (offset, offset * offset + half * half * 2.0 / 3.0),
    };
    ChannelMeasurements {
        mean,
        peak_to_peak: max - min,
        period,
        min,
        max,
        rms: mean_square.sqrt(),
    }
}

/// Widen the extremes by the excursion one capture sees, and add the noise power.
fn with_noise(clean: ChannelMeasurements, noise: &Noise) -> ChannelMeasurements {
    if !noise.is_active() {
        return clean;
    }
    let a = noise.amplitude.abs();
    // (peak excursion, variance) per distribution
    let (peak, variance) = match noise.kind {
        NoiseKind::None => (0.0, 0.0),
        NoiseKind::Uniform => (0.95 * a, a * a / 3.0),
        NoiseKind::Gaussian => (3.0 * a, a * a),
        NoiseKind::Laplacian => (4.0 * a, 2.0 * a * a),
        NoiseKind::Impulse => (a, a * a / 10.0),
    };
    let max = (clean.max + peak).min(OUTPUT_LIMIT);
    let min = (clean.min - peak).max(-OUTPUT_LIMIT);
    ChannelMeasurements {
        peak_to_peak: max - min,
        min,
        max,
        rms: (clean.rms * clean.rms + variance).sqrt(),
        ..clean
    }
}

/// Evaluate one record of a math function and measure it.
///
/// The record repeats, so the period is the record length divided by the number of
/// rising crossings of the mean within it.
fn sample_math(function: &MathFunction) -> Result<ChannelMeasurements> {
    let engine = Engine::new();
    let ast = engine
        .compile_expression(&function.expression)
        .map_err(|e| anyhow!("Invalid math function '{}': {}", function.expression, e))?;

    let samples = ((function.sample_rate * function.record_length).round() as usize)
        .clamp(2, MATH_SAMPLES);
    let dt = function.record_length / samples as f64;

    let mut scope = Scope::new();
    let mut values = Vec::with_capacity(samples);
    for i in 0..samples {
        scope.set_value("t", i as f64 * dt);
        let value: Dynamic = engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| anyhow!("Math function '{}' failed: {}", function.expression, e))?;
        let v = value
            .as_float()
            .or_else(|_| value.as_int().map(|i| i as f64))
            .map_err(|ty| anyhow!("Math function '{}' returned {}", function.expression, ty))?;
        if !v.is_finite() {
            bail!("Math function '{}' is not finite at t={}", function.expression, i as f64 * dt);
        }
        values.push(v.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT));
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let rising = (0..values.len())
        .filter(|&i| values[i] < mean && values[(i + 1) % values.len()] >= mean)
        .count();
    let period = if rising > 0 {
        function.record_length / rising as f64
    } else {
        0.0
    };

    Ok(ChannelMeasurements {
        mean,
        peak_to_peak: max - min,
        period,
        min,
        max,
        rms,
    })
}

#[derive(Debug)]
struct GeneratorState {
    running: bool,
    channels: [GeneratorChannel; CHANNELS],
    /// Ideal output of each channel while running
    signals: [ChannelMeasurements; CHANNELS],
    outputs: [Settling<ChannelMeasurements>; CHANNELS],
}

impl GeneratorState {
    fn retarget(&mut self, timing: &BenchTiming) {
        for (output, signal) in self.outputs.iter_mut().zip(self.signals) {
            let target = if self.running {
                signal
            } else {
                ChannelMeasurements::default()
            };
            output.set(target, timing.latency);
        }
    }
}

/// Two-channel generator. Outputs change one latency after a write.
pub struct SimSignalGenerator {
    state: RwLock<GeneratorState>,
    timing: BenchTiming,
}

impl SimSignalGenerator {
    pub(crate) fn new(timing: BenchTiming) -> Self {
        Self {
            state: RwLock::new(GeneratorState {
                running: false,
                channels: std::array::from_fn(|_| GeneratorChannel::default()),
                signals: [ChannelMeasurements::default(); CHANNELS],
                outputs: [Settling::new(ChannelMeasurements::default()); CHANNELS],
            }),
            timing,
        }
    }

    /// What is on an output connector right now.
    pub async fn output(&self, channel: usize) -> Result<ChannelMeasurements> {
        check_channel(channel)?;
        Ok(self.state.read().await.outputs[channel].current(self.timing.latency))
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }
}

#[async_trait]
impl SignalGeneratorPanel for SimSignalGenerator {
    async fn set_running(&self, running: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.running = running;
        state.retarget(&self.timing);
        Ok(())
    }

    async fn configure_channel(&self, channel: usize, config: GeneratorChannel) -> Result<()> {
        check_channel(channel)?;
        config.validate()?;
        tracing::debug!(channel, ?config, "SimSignalGenerator: configure");
        let signal = ideal_measurements(&config)?;
        let mut state = self.state.write().await;
        state.channels[channel] = config;
        state.signals[channel] = signal;
        state.retarget(&self.timing);
        Ok(())
    }

    async fn channel(&self, channel: usize) -> Result<GeneratorChannel> {
        check_channel(channel)?;
        Ok(self.state.read().await.channels[channel].clone())
    }
}

#[derive(Debug)]
struct ScopeState {
    running: bool,
    started_at: Instant,
    channels: [ScopeChannel; CHANNELS],
    time_base: f64,
    trigger: Trigger,
    acquired: [ChannelMeasurements; CHANNELS],
}

/// Oscilloscope observing the generator outputs (W1 → 1+, W2 → 2+).
///
/// An acquisition completes once the scope has run for one latency; stopping it
/// earlier keeps the previous capture. Measurements are clipped to the visible
/// screen, and no period is reported when a full cycle does not fit on it.
pub struct SimOscilloscope {
    generator: Arc<SimSignalGenerator>,
    state: RwLock<ScopeState>,
    timing: BenchTiming,
}

impl SimOscilloscope {
    pub(crate) fn new(generator: Arc<SimSignalGenerator>, timing: BenchTiming) -> Self {
        Self {
            generator,
            state: RwLock::new(ScopeState {
                running: false,
                started_at: Instant::now(),
                channels: [ScopeChannel::default(); CHANNELS],
                time_base: 1e-3,
                trigger: Trigger::default(),
                acquired: [ChannelMeasurements::default(); CHANNELS],
            }),
            timing,
        }
    }

    fn capture(
        &self,
        signal: ChannelMeasurements,
        channel: &ScopeChannel,
        time_base: f64,
    ) -> ChannelMeasurements {
        if !channel.enabled {
            return ChannelMeasurements::default();
        }
        let limit = channel.volts_per_div.abs() * VERTICAL_HALF_DIVS;
        let noise = self.timing.noise();
        let min = signal.min.clamp(-limit, limit);
        let max = signal.max.clamp(-limit, limit);
        let screen = time_base * HORIZONTAL_DIVS;
        let period = if signal.period > 0.0 && signal.period <= screen * (1.0 + 1e-9) {
            signal.period
        } else {
            0.0
        };
        ChannelMeasurements {
            mean: signal.mean.clamp(-limit, limit) + noise,
            peak_to_peak: max - min,
            period,
            min,
            max,
            rms: signal.rms.min(limit),
        }
    }
}

#[async_trait]
impl OscilloscopePanel for SimOscilloscope {
    async fn set_running(&self, running: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if running && !state.running {
            state.started_at = Instant::now();
        } else if !running && state.running {
            if state.started_at.elapsed() >= self.timing.latency {
                for ch in 0..CHANNELS {
                    let signal = self.generator.output(ch).await?;
                    let captured = self.capture(signal, &state.channels[ch], state.time_base);
                    state.acquired[ch] = captured;
                }
                tracing::trace!(trigger = ?state.trigger, "SimOscilloscope: acquisition complete");
            } else {
                tracing::debug!("SimOscilloscope: stopped before acquisition completed");
            }
        }
        state.running = running;
        Ok(())
    }

    async fn configure_channel(&self, channel: usize, config: ScopeChannel) -> Result<()> {
        check_channel(channel)?;
        config.validate()?;
        self.state.write().await.channels[channel] = config;
        Ok(())
    }

    async fn set_time_base(&self, seconds_per_div: f64) -> Result<()> {
        if !(seconds_per_div.is_finite() && seconds_per_div > 0.0) {
            bail!("Invalid time base {}", seconds_per_div);
        }
        self.state.write().await.time_base = seconds_per_div;
        Ok(())
    }

    async fn set_trigger(&self, trigger: Trigger) -> Result<()> {
        check_channel(trigger.source)?;
        self.state.write().await.trigger = trigger;
        Ok(())
    }

    async fn measurements(&self, channel: usize) -> Result<ChannelMeasurements> {
        check_channel(channel)?;
        let state = self.state.read().await;
        if state.running {
            bail!(LIVE_READ_ERROR);
        }
        Ok(state.acquired[channel])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timing() -> BenchTiming {
        BenchTiming {
            latency: Duration::from_millis(200),
            noise_volts: 0.0,
        }
    }

    fn bench() -> (Arc<SimSignalGenerator>, SimOscilloscope) {
        let generator = Arc::new(SimSignalGenerator::new(timing()));
        let scope = SimOscilloscope::new(generator.clone(), timing());
        (generator, scope)
    }

    #[test]
    fn sine_ideal_measurements() {
        let m = ideal_measurements(&GeneratorChannel::waveform(Waveform::new(
            WaveformKind::Sine,
            5.0,
            200.0,
        )))
        .unwrap();
        assert_eq!(m.peak_to_peak, 5.0);
        assert_eq!(m.mean, 0.0);
        assert!((m.frequency() - 200.0).abs() < 1e-9);
        assert!((m.rms - 2.5 / 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn square_mean_follows_duty() {
        let wave = Waveform::new(WaveformKind::Square, 4.0, 1000.0).with_duty(25.0);
        let m = ideal_measurements(&GeneratorChannel::waveform(wave)).unwrap();
        assert!((m.mean - (-1.0)).abs() < 1e-9);
        assert_eq!(m.peak_to_peak, 4.0);
    }

    #[test]
    fn constant_is_clamped_and_disabled_is_zero() {
        let m = ideal_measurements(&GeneratorChannel::constant(8.0)).unwrap();
        assert_eq!(m.mean, 5.0);
        let m = ideal_measurements(&GeneratorChannel::constant(3.0).disabled()).unwrap();
        assert_eq!(m, ChannelMeasurements::default());
    }

    #[test]
    fn uniform_noise_widens_peak_to_peak() {
        let square = Waveform::new(WaveformKind::Square, 3.0, 1000.0).with_offset(1.5);
        for amplitude in [0.5, 1.0, 1.5, 2.0, 2.5] {
            let channel = GeneratorChannel::waveform(square).with_noise(Noise::uniform(amplitude));
            let m = ideal_measurements(&channel).unwrap();
            assert!(m.peak_to_peak > 3.0 + 0.5 * amplitude, "{:?}", m);
            assert!(m.peak_to_peak <= 3.0 + 2.0 * amplitude, "{:?}", m);
            assert!(m.max <= OUTPUT_LIMIT);
            assert!((m.mean - 1.5).abs() < 1e-9);
        }
    }

    #[test]
    fn math_sine_measures_amplitude_and_frequency() {
        let function = MathFunction::new("5*sin(2*3.14159265*100*t)", 37.5e6, 0.01);
        let m = ideal_measurements(&GeneratorChannel::math(function)).unwrap();
        assert!((m.peak_to_peak - 10.0).abs() < 0.05, "{:?}", m);
        assert!((m.frequency() - 100.0).abs() < 1e-6, "{:?}", m);
        assert!(m.mean.abs() < 0.01);

        let function = MathFunction::new("4*sin(2*3.14159265*1000*t)", 37.5e6, 0.002);
        let m = ideal_measurements(&GeneratorChannel::math(function)).unwrap();
        assert!((m.peak_to_peak - 8.0).abs() < 0.05, "{:?}", m);
        assert!((m.frequency() - 1000.0).abs() < 1e-6, "{:?}", m);
    }

    #[test]
    fn math_constant_has_no_period() {
        let function = MathFunction::new("1.25", 1e6, 0.001);
        let m = ideal_measurements(&GeneratorChannel::math(function)).unwrap();
        assert_eq!(m.period, 0.0);
        assert_eq!(m.mean, 1.25);
    }

    #[test]
    fn broken_math_functions_are_errors() {
        for expression in ["5*sin(", "\"volts\"", "1.0 / 0.0"] {
            let function = MathFunction::new(expression, 1e6, 0.001);
            assert!(
                ideal_measurements(&GeneratorChannel::math(function)).is_err(),
                "{}",
                expression
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_settings_are_refused() {
        let (generator, scope) = bench();
        generator.configure_channel(0, GeneratorChannel::constant(1.0)).await.unwrap();
        generator.set_running(true).await.unwrap();
        scope.configure_channel(0, ScopeChannel::enabled(2.0)).await.unwrap();

        assert!(scope
            .configure_channel(0, ScopeChannel::enabled(f64::NAN))
            .await
            .is_err());
        assert!(generator
            .configure_channel(0, GeneratorChannel::constant(f64::INFINITY))
            .await
            .is_err());

        // rejected settings leave the previous configuration in place
        scope.set_running(true).await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        scope.set_running(false).await.unwrap();
        assert!((scope.measurements(0).await.unwrap().mean - 1.0).abs() < 1e-9);
        assert_eq!(generator.channel(0).await.unwrap(), GeneratorChannel::constant(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_while_running_is_a_device_error() {
        let (_generator, scope) = bench();
        scope.set_running(true).await.unwrap();
        let err = scope.measurements(0).await.unwrap_err();
        assert!(err.to_string().contains("WRITE ALL: -9"));
        scope.set_running(false).await.unwrap();
        assert!(scope.measurements(0).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn loopback_capture_after_settle() {
        let (generator, scope) = bench();
        generator
            .configure_channel(0, GeneratorChannel::constant(3.3))
            .await
            .unwrap();
        generator.set_running(true).await.unwrap();
        scope.configure_channel(0, ScopeChannel::enabled(2.0)).await.unwrap();

        scope.set_running(true).await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        scope.set_running(false).await.unwrap();

        let m = scope.measurements(0).await.unwrap();
        assert!((m.mean - 3.3).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn early_stop_keeps_previous_capture() {
        let (generator, scope) = bench();
        generator
            .configure_channel(0, GeneratorChannel::constant(1.0))
            .await
            .unwrap();
        generator.set_running(true).await.unwrap();
        scope.configure_channel(0, ScopeChannel::enabled(1.0)).await.unwrap();

        scope.set_running(true).await.unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        scope.set_running(false).await.unwrap();
        assert_eq!(scope.measurements(0).await.unwrap().mean, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_is_clipped_to_screen() {
        let (generator, scope) = bench();
        generator
            .configure_channel(0, GeneratorChannel::waveform(Waveform::new(WaveformKind::Sine, 10.0, 1000.0)))
            .await
            .unwrap();
        generator.set_running(true).await.unwrap();
        scope.configure_channel(0, ScopeChannel::enabled(0.5)).await.unwrap();
        scope.set_time_base(1e-4).await.unwrap();

        scope.set_running(true).await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        scope.set_running(false).await.unwrap();

        let m = scope.measurements(0).await.unwrap();
        assert_eq!(m.peak_to_peak, 5.0);
        assert!((m.frequency() - 1000.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn no_period_when_cycle_exceeds_screen() {
        let (generator, scope) = bench();
        generator
            .configure_channel(0, GeneratorChannel::waveform(Waveform::new(WaveformKind::Sine, 2.0, 100.0)))
            .await
            .unwrap();
        generator.set_running(true).await.unwrap();
        scope.configure_channel(0, ScopeChannel::enabled(1.0)).await.unwrap();
        scope.set_time_base(1e-4).await.unwrap();

        scope.set_running(true).await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        scope.set_running(false).await.unwrap();
        assert_eq!(scope.measurements(0).await.unwrap().period, 0.0);
    }
}
