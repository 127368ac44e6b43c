//! Signal Generator + Oscilloscope suite.
//!
//! Generator output W1 feeds oscilloscope input 1+, W2 feeds 2+. A step programs the
//! generator (stopped while reconfigured), waits for the output to settle, switches to
//! the oscilloscope, acquires, **stops the acquisition before reading** the automatic
//! measurements, and switches back to the generator.

use anyhow::Result;

use crate::assertions::Assertions;
use crate::error::HarnessResult;
use crate::panels::{
    ChannelMeasurements, GeneratorChannel, MathFunction, Noise, ScopeChannel, Trigger, Waveform,
    WaveformKind, CHANNELS,
};
use crate::runner::TestRunner;
use crate::session::{DeviceSession, Tool};
use crate::settle::settle_delay;

/// Suite name printed in the banner and reports.
pub const SUITE_NAME: &str = "Signal Generator + Oscilloscope Tests";

pub const CH1_CONSTANT: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.9_11";
pub const CH1_SINE: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.26_30";
pub const CH1_SQUARE_DUTY: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.34_35";
pub const CH1_TRIANGLE: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.36_38";
pub const CH1_SAWTOOTH: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.39_44";
pub const CH2_CONSTANT: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.9_11";
pub const CH1_SQUARE: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.31_33";
pub const CH1_TRAPEZOIDAL: &str = "TST.M2K.SG.CHANNEL_1_OPERATION.45_48";
pub const DUAL_WAVEFORMS: &str = "TST.M2K.SG.CHANNEL_1_AND_CHANNEL_2_OPERATION.6_8";
pub const CH2_SINE: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.26_30";
pub const CH2_SQUARE: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.31_35";
pub const CH2_TRIANGLE: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.36_38";
pub const CH2_SAWTOOTH: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.39_44";
pub const CH2_TRAPEZOIDAL: &str = "TST.M2K.SG.CHANNEL_2_OPERATION.45_48";
pub const DUAL_CONSTANT: &str = "TST.M2K.SG.CHANNEL_1_AND_CHANNEL_2_OPERATION.1_5";
pub const DUAL_PHASE: &str = "TST.M2K.SG.CHANNEL_1_AND_CHANNEL_2_OPERATION.9_13";
pub const NOISE: &str = "TST.M2K.SG.ADDITIONAL_FEATURES.1_6";
pub const MATH: &str = "TST.M2K.SG.ADDITIONAL_FEATURES.15_23";

/// Test UIDs in execution order.
pub const TESTS: [&str; 18] = [
    CH1_CONSTANT,
    CH1_SINE,
    CH1_SQUARE_DUTY,
    CH1_TRIANGLE,
    CH1_SAWTOOTH,
    CH2_CONSTANT,
    CH1_SQUARE,
    CH1_TRAPEZOIDAL,
    DUAL_WAVEFORMS,
    CH2_SINE,
    CH2_SQUARE,
    CH2_TRIANGLE,
    CH2_SAWTOOTH,
    CH2_TRAPEZOIDAL,
    DUAL_CONSTANT,
    DUAL_PHASE,
    NOISE,
    MATH,
];

const CH1_LEVELS: [f64; 7] = [-5.0, -3.3, -1.0, 0.0, 1.0, 3.3, 5.0];
const CH2_LEVELS: [f64; 2] = [4.5, -4.5];
const CONSTANT_TOLERANCE: f64 = 0.1;
/// Vpp tolerance as a fraction of the programmed amplitude
const VPP_TOLERANCE: f64 = 0.05;

/// Horizontal scale for the channel 1 sine sweep.
pub fn sine_time_base(frequency: f64) -> f64 {
    if frequency >= 5e6 {
        200e-9
    } else if frequency >= 500e3 {
        1e-6
    } else if frequency > 100e3 {
        2e-6
    } else {
        1.0 / (frequency * 10.0)
    }
}

/// Vertical scale for a constant level: coarser above 2 V.
pub fn constant_volts_per_div(volts: f64) -> f64 {
    if volts.abs() > 2.0 {
        2.0
    } else {
        1.0
    }
}

/// Run every test of the suite in order. Only runner misuse is returned as an error.
pub async fn run(runner: &mut TestRunner, session: &DeviceSession) -> HarnessResult<()> {
    let checks = runner.assertions().clone();
    let checks = &checks;

    runner
        .run_test(CH1_CONSTANT, || channel_constant(session, checks, 0, &CH1_LEVELS))
        .await?;
    runner.run_test(CH1_SINE, || sweep(session, checks, Sweep::ch1_sine())).await?;
    runner.run_test(CH1_SQUARE_DUTY, || square_duty(session)).await?;
    runner.run_test(CH1_TRIANGLE, || sweep(session, checks, Sweep::triangle(0))).await?;
    runner.run_test(CH1_SAWTOOTH, || sawtooth(session, checks, 0)).await?;
    runner
        .run_test(CH2_CONSTANT, || channel_constant(session, checks, 1, &CH2_LEVELS))
        .await?;
    runner.run_test(CH1_SQUARE, || sweep(session, checks, Sweep::square(0))).await?;
    runner.run_test(CH1_TRAPEZOIDAL, || sweep(session, checks, Sweep::trapezoidal(0))).await?;
    runner.run_test(DUAL_WAVEFORMS, || dual_waveforms(session, checks)).await?;
    runner.run_test(CH2_SINE, || sweep(session, checks, Sweep::ch2_sine())).await?;
    runner.run_test(CH2_SQUARE, || sweep(session, checks, Sweep::square(1))).await?;
    runner.run_test(CH2_TRIANGLE, || sweep(session, checks, Sweep::triangle(1))).await?;
    runner.run_test(CH2_SAWTOOTH, || sawtooth(session, checks, 1)).await?;
    runner.run_test(CH2_TRAPEZOIDAL, || sweep(session, checks, Sweep::trapezoidal(1))).await?;
    runner.run_test(DUAL_CONSTANT, || dual_constant(session, checks)).await?;
    runner.run_test(DUAL_PHASE, || dual_phase(session, checks)).await?;
    runner.run_test(NOISE, || noise(session, checks)).await?;
    runner.run_test(MATH, || math_function(session, checks)).await?;
    Ok(())
}

/// Stop the generator, apply channel settings, restart, and wait for the output.
async fn drive(session: &DeviceSession, settings: &[(usize, GeneratorChannel)]) -> Result<()> {
    let siggen = session.signal_generator().await?;
    siggen.set_running(false).await?;
    for (channel, config) in settings {
        siggen.configure_channel(*channel, config.clone()).await?;
    }
    siggen.set_running(true).await?;
    settle_delay(session.settle().output()).await;
    Ok(())
}

/// Stop the generator and disable the given channels.
async fn release(session: &DeviceSession, channels: &[usize]) -> Result<()> {
    let siggen = session.signal_generator().await?;
    siggen.set_running(false).await?;
    for &channel in channels {
        let config = siggen.channel(channel).await?;
        siggen.configure_channel(channel, config.disabled()).await?;
    }
    Ok(())
}

/// One oscilloscope acquisition; inputs not listed in `inputs` are disabled.
struct Capture<'a> {
    inputs: &'a [(usize, f64)],
    time_base: Option<f64>,
    trigger: Trigger,
}

/// Switch to the oscilloscope, acquire, stop, read both channels, switch back.
async fn acquire(
    session: &DeviceSession,
    capture: Capture<'_>,
) -> Result<[ChannelMeasurements; CHANNELS]> {
    session.switch_to(Tool::Oscilloscope).await?;
    let osc = session.oscilloscope().await?;
    for channel in 0..CHANNELS {
        let config = capture
            .inputs
            .iter()
            .find(|(input, _)| *input == channel)
            .map_or_else(ScopeChannel::default, |(_, vpd)| ScopeChannel::enabled(*vpd));
        osc.configure_channel(channel, config).await?;
    }
    if let Some(time_base) = capture.time_base {
        osc.set_time_base(time_base).await?;
    }
    osc.set_trigger(capture.trigger).await?;

    osc.set_running(true).await?;
    settle_delay(session.settle().scope()).await;
    // measurements are only valid once acquisition is stopped
    osc.set_running(false).await?;
    let readings = [osc.measurements(0).await?, osc.measurements(1).await?];

    session.switch_to(Tool::SignalGenerator).await?;
    Ok(readings)
}

async fn channel_constant(
    session: &DeviceSession,
    checks: &Assertions,
    channel: usize,
    levels: &[f64],
) -> Result<bool> {
    let mut all_pass = true;
    for &volts in levels {
        let label = if channel == 0 {
            format!("Constant {}V", volts)
        } else {
            format!("Channel 2 constant {}V", volts)
        };
        session
            .console()
            .print(format!("  Testing CH{} constant voltage: {}V", channel + 1, volts));
        drive(session, &[(channel, GeneratorChannel::constant(volts))]).await?;

        let vpd = if channel == 0 {
            constant_volts_per_div(volts)
        } else {
            2.0
        };
        let readings = acquire(
            session,
            Capture {
                inputs: &[(channel, vpd)],
                time_base: None,
                trigger: Trigger::auto(channel),
            },
        )
        .await?;
        all_pass &=
            checks.assert_approx_equal(readings[channel].mean, volts, CONSTANT_TOLERANCE, &label);
    }

    release(session, &[channel]).await?;
    Ok(all_pass)
}

/// A waveform sweep on one channel, checking Vpp and optionally frequency.
struct Sweep {
    channel: usize,
    title: &'static str,
    cases: Vec<(Waveform, f64)>,
    vpp_label: &'static str,
    /// Label and relative tolerance of the frequency check
    frequency: Option<(&'static str, f64)>,
}

impl Sweep {
    fn ch1_sine() -> Self {
        let cases = [(5.0, 200.0), (10.0, 500e3), (10.0, 5e6)]
            .into_iter()
            .map(|(amp, freq)| (Waveform::new(WaveformKind::Sine, amp, freq), sine_time_base(freq)))
            .collect();
        Self {
            channel: 0,
            title: "",
            cases,
            vpp_label: "Vpp measurement",
            frequency: Some(("Frequency measurement", 0.01)),
        }
    }

    fn ch2_sine() -> Self {
        Self {
            channel: 1,
            title: "CH2",
            cases: vec![
                (Waveform::new(WaveformKind::Sine, 5.0, 200.0), 5e-3),
                (Waveform::new(WaveformKind::Sine, 10.0, 500e3), 1e-6),
                (Waveform::new(WaveformKind::Sine, 10.0, 5e6), 200e-9),
            ],
            vpp_label: "CH2 Sine Vpp",
            frequency: Some(("CH2 Sine freq", 0.02)),
        }
    }

    fn square(channel: usize) -> Self {
        let cases = vec![
            (Waveform::new(WaveformKind::Square, 5.0, 200.0), 5e-3),
            (Waveform::new(WaveformKind::Square, 10.0, 5e6), 100e-9),
        ];
        if channel == 0 {
            Self {
                channel,
                title: "square",
                cases,
                vpp_label: "Square Vpp",
                frequency: Some(("Square frequency", 0.02)),
            }
        } else {
            Self {
                channel,
                title: "CH2 square",
                cases,
                vpp_label: "CH2 Square Vpp",
                frequency: None,
            }
        }
    }

    fn triangle(channel: usize) -> Self {
        let cases = vec![
            (Waveform::new(WaveformKind::Triangle, 5.0, 200.0), 2e-3),
            (Waveform::new(WaveformKind::Triangle, 8.0, 2e6), 100e-9),
        ];
        if channel == 0 {
            Self {
                channel,
                title: "triangle",
                cases,
                vpp_label: "Triangle Vpp",
                frequency: Some(("Triangle frequency", 0.02)),
            }
        } else {
            Self {
                channel,
                title: "CH2 triangle",
                cases,
                vpp_label: "CH2 Triangle Vpp",
                frequency: None,
            }
        }
    }

    fn sawtooth(channel: usize, kind: WaveformKind) -> Self {
        let rising = kind == WaveformKind::RisingSawtooth;
        let (title, vpp_label) = match (channel, rising) {
            (0, true) => ("rising sawtooth", "Rising sawtooth Vpp"),
            (0, false) => ("falling sawtooth", "Falling sawtooth Vpp"),
            (_, true) => ("CH2 rising sawtooth", "CH2 Rising Saw Vpp"),
            (_, false) => ("CH2 falling sawtooth", "CH2 Falling Saw Vpp"),
        };
        Self {
            channel,
            title,
            cases: vec![
                (Waveform::new(kind, 5.0, 200.0), 2e-3),
                (Waveform::new(kind, 8.0, 1e6), 1e-6),
            ],
            vpp_label,
            frequency: None,
        }
    }

    fn trapezoidal(channel: usize) -> Self {
        let cases = vec![
            (Waveform::trapezoidal(5.0, 1e-6, 1e-6, 1e-6, 1e-6), 1e-6),
            (Waveform::trapezoidal(10.0, 1e-6, 1e-6, 1e-6, 1e-6), 1e-6),
            (Waveform::trapezoidal(10.0, 200e-9, 200e-9, 200e-9, 200e-9), 200e-9),
        ];
        if channel == 0 {
            Self {
                channel,
                title: "trapezoidal",
                cases,
                vpp_label: "Trapezoidal Vpp",
                frequency: Some(("Trapezoidal frequency", 0.05)),
            }
        } else {
            Self {
                channel,
                title: "CH2 trapezoidal",
                cases,
                vpp_label: "CH2 Trap Vpp",
                frequency: None,
            }
        }
    }
}

async fn sweep(session: &DeviceSession, checks: &Assertions, sweep: Sweep) -> Result<bool> {
    let mut all_pass = true;
    for (wave, time_base) in &sweep.cases {
        let title = if sweep.title.is_empty() {
            String::new()
        } else {
            format!(" {}", sweep.title)
        };
        session.console().print(format!(
            "  Testing{}: {}Vpp @ {}Hz",
            title, wave.amplitude, wave.frequency
        ));
        drive(session, &[(sweep.channel, GeneratorChannel::waveform(*wave))]).await?;

        let readings = acquire(
            session,
            Capture {
                inputs: &[(sweep.channel, wave.amplitude / 4.0)],
                time_base: Some(*time_base),
                trigger: Trigger::auto(sweep.channel),
            },
        )
        .await?;
        let measured = readings[sweep.channel];

        all_pass &= checks.assert_approx_equal(
            measured.peak_to_peak,
            wave.amplitude,
            wave.amplitude * VPP_TOLERANCE,
            sweep.vpp_label,
        );
        if let Some((label, ratio)) = sweep.frequency {
            all_pass &= checks.assert_approx_equal(
                measured.frequency(),
                wave.frequency,
                wave.frequency * ratio,
                label,
            );
        }
    }

    release(session, &[sweep.channel]).await?;
    Ok(all_pass)
}

async fn sawtooth(session: &DeviceSession, checks: &Assertions, channel: usize) -> Result<bool> {
    let rising = sweep(session, checks, Sweep::sawtooth(channel, WaveformKind::RisingSawtooth)).await?;
    let falling =
        sweep(session, checks, Sweep::sawtooth(channel, WaveformKind::FallingSawtooth)).await?;
    Ok(rising && falling)
}

/// Duty cycle sweep. The panel exposes no duty measurement, so only the
/// configuration path is exercised.
async fn square_duty(session: &DeviceSession) -> Result<bool> {
    for duty in [10.0, 25.0, 50.0, 75.0, 90.0] {
        session
            .console()
            .print(format!("  Testing duty cycle: {}%", duty));
        let wave = Waveform::new(WaveformKind::Square, 5.0, 1000.0).with_duty(duty);
        drive(session, &[(0, GeneratorChannel::waveform(wave))]).await?;

        let readings = acquire(
            session,
            Capture {
                inputs: &[(0, 2.0)],
                time_base: Some(200e-6),
                trigger: Trigger::auto(0),
            },
        )
        .await?;
        tracing::debug!(duty, mean = readings[0].mean, "duty sweep capture");
        session.console().print(
            "    [Note: Duty cycle measurement not directly available, skipping verification]",
        );
    }

    release(session, &[0]).await?;
    Ok(true)
}

async fn dual_waveforms(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    drive(
        session,
        &[
            (0, GeneratorChannel::waveform(Waveform::new(WaveformKind::Sine, 2.0, 1000.0))),
            (1, GeneratorChannel::waveform(Waveform::new(WaveformKind::Square, 3.0, 500.0))),
        ],
    )
    .await?;

    let [ch1, ch2] = acquire(
        session,
        Capture {
            inputs: &[(0, 0.5), (1, 1.0)],
            time_base: Some(1e-3),
            trigger: Trigger::auto(0),
        },
    )
    .await?;

    let ch1_vpp = checks.assert_approx_equal(ch1.peak_to_peak, 2.0, 0.1, "CH1 Vpp");
    let ch1_freq = checks.assert_approx_equal(ch1.frequency(), 1000.0, 10.0, "CH1 freq");
    // square edges overshoot on this channel
    let ch2_vpp = checks.assert_approx_equal(ch2.peak_to_peak, 3.0, 0.45, "CH2 Vpp");
    let ch2_freq = checks.assert_approx_equal(ch2.frequency(), 500.0, 5.0, "CH2 freq");

    release(session, &[0, 1]).await?;
    Ok(ch1_vpp && ch1_freq && ch2_vpp && ch2_freq)
}

async fn dual_constant(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let mut all_pass = true;
    for (ch1_volts, ch2_volts) in [(4.5, -4.0), (-4.5, 4.0)] {
        session.console().print(format!(
            "  Testing: CH1={}V, CH2={}V",
            ch1_volts, ch2_volts
        ));
        drive(
            session,
            &[
                (0, GeneratorChannel::constant(ch1_volts)),
                (1, GeneratorChannel::constant(ch2_volts)),
            ],
        )
        .await?;

        let [ch1, ch2] = acquire(
            session,
            Capture {
                inputs: &[(0, 2.0), (1, 2.0)],
                time_base: None,
                trigger: Trigger::auto(0),
            },
        )
        .await?;
        let ch1_ok = checks.assert_approx_equal(
            ch1.mean,
            ch1_volts,
            CONSTANT_TOLERANCE,
            &format!("CH1 constant {}V", ch1_volts),
        );
        let ch2_ok = checks.assert_approx_equal(
            ch2.mean,
            ch2_volts,
            CONSTANT_TOLERANCE,
            &format!("CH2 constant {}V", ch2_volts),
        );
        all_pass &= ch1_ok && ch2_ok;
    }

    release(session, &[0, 1]).await?;
    Ok(all_pass)
}

/// Two sines 180° apart. Only amplitudes are checked; the phase relation would need a
/// math channel.
async fn dual_phase(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let base = Waveform::new(WaveformKind::Sine, 5.0, 5000.0);
    drive(
        session,
        &[
            (0, GeneratorChannel::waveform(base)),
            (1, GeneratorChannel::waveform(base.with_phase(180.0))),
        ],
    )
    .await?;

    let [ch1, ch2] = acquire(
        session,
        Capture {
            inputs: &[(0, 1.5), (1, 1.5)],
            time_base: Some(200e-6),
            trigger: Trigger::auto(0),
        },
    )
    .await?;
    let ch1_ok = checks.assert_approx_equal(ch1.peak_to_peak, 5.0, 0.25, "CH1 phase test Vpp");
    let ch2_ok = checks.assert_approx_equal(ch2.peak_to_peak, 5.0, 0.25, "CH2 phase test Vpp");
    session.console().print(
        "  [Note: Phase difference verification requires visual inspection or math channel]",
    );

    release(session, &[0, 1]).await?;
    Ok(ch1_ok && ch2_ok)
}

/// Uniform noise on a 0 V to 3 V square wave. Vpp must grow to between
/// `3 + 0.5 * noise` and `3 + 2 * noise`.
async fn noise(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let square = Waveform::new(WaveformKind::Square, 3.0, 1000.0).with_offset(1.5);
    let mut all_pass = true;
    for amplitude in [0.5, 1.0, 1.5, 2.0, 2.5] {
        session
            .console()
            .print(format!("  Testing noise amplitude: {}V", amplitude));
        let channel = GeneratorChannel::waveform(square).with_noise(Noise::uniform(amplitude));
        drive(session, &[(0, channel)]).await?;

        let [ch1, _] = acquire(
            session,
            Capture {
                inputs: &[(0, 1.0)],
                time_base: Some(100e-6),
                trigger: Trigger {
                    level: 1.5,
                    ..Trigger::auto(0)
                },
            },
        )
        .await?;
        all_pass &= checks.assert_in_range(
            ch1.peak_to_peak,
            3.0 + amplitude * 0.5,
            3.0 + amplitude * 2.0,
            &format!("Vpp with {}V noise", amplitude),
        );
    }

    release(session, &[0]).await?;
    let siggen = session.signal_generator().await?;
    let quiet = siggen.channel(0).await?.with_noise(Noise::default());
    siggen.configure_channel(0, quiet).await?;
    Ok(all_pass)
}

/// Math-function mode: expected Vpp within 10 % and frequency within 5 %.
async fn math_function(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let cases = [
        (MathFunction::new("5*sin(2*3.14159265*100*t)", 37.5e6, 0.01), 10.0, 100.0, 2e-3),
        (MathFunction::new("4*sin(2*3.14159265*1000*t)", 37.5e6, 0.002), 8.0, 1000.0, 200e-6),
    ];

    let mut all_pass = true;
    for (function, vpp, frequency, time_base) in cases {
        session.console().print(format!(
            "  Testing math function: {}Vpp @ {}Hz",
            vpp, frequency
        ));
        drive(session, &[(0, GeneratorChannel::math(function))]).await?;

        let [ch1, _] = acquire(
            session,
            Capture {
                inputs: &[(0, vpp / 4.0)],
                time_base: Some(time_base),
                trigger: Trigger::auto(0),
            },
        )
        .await?;
        let vpp_ok = checks.assert_approx_equal(ch1.peak_to_peak, vpp, vpp * 0.1, "Math Vpp");
        let freq_ok =
            checks.assert_approx_equal(ch1.frequency(), frequency, frequency * 0.05, "Math freq");
        all_pass &= vpp_ok && freq_ok;
    }

    release(session, &[0]).await?;
    Ok(all_pass)
}
