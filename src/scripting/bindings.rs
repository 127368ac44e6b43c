//! Harness Bindings for Rhai Scripts
//!
//! Bridges the async harness (session, panels, runner) to synchronous Rhai scripts.
//!
//! # Script Surface
//!
//! - Host functions: `printToConsole(msg)`, `msleep(ms)`, `switchToTool(name)`,
//!   `exit(code)`, `evaluateFile(path)` (registered by the host, see `engine.rs`)
//! - `TestFramework::` module: `init`, `connectToDevice`, `disconnectFromDevice`, `runTest`,
//!   `assertEqual`, `assertApproxEqual`, `assertInRange`, `printSummary`, `saveResults`
//! - Panels: `power`, `dmm`, `siggen`, `osc`
//!
//! # Async→Sync Bridge
//!
//! Every call into the harness goes through `tokio::task::block_in_place()`, so the
//! host must run on a multi-thread tokio runtime.
//!
//! ```rhai
//! TestFramework::runTest("TST.DEMO", || {
//!     power.dac1_value = 3.3;
//!     msleep(500);
//!     switchToTool("Voltmeter");
//!     dmm.running = true;
//!     msleep(1000);
//!     TestFramework::assertApproxEqual(dmm.value_ch1, 3.3, 0.06, "DAC1")
//! });
//! ```

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Module, NativeCallContext, Position};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::block_in_place;

use crate::assertions::Assertions;
use crate::panels::{
    check_channel, ChannelMeasurements, GeneratorChannel, GeneratorMode, MathFunction, Noise,
    NoiseKind, ScopeChannel, Trigger, Waveform, WaveformKind,
};
use crate::report;
use crate::runner::{panic_message, Outcome, TestRunner, Verdict};
use crate::session::DeviceSession;

/// Value a test body returns to be recorded as skipped.
pub const SKIP_MARKER: &str = "SKIP";

/// Payload of the termination raised by `exit(code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest(pub i32);

pub(crate) type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

pub(crate) fn runtime_error(context: &str, error: impl fmt::Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        format!("{} failed: {}", context, error).into(),
        Position::NONE,
    ))
}

pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    block_in_place(|| Handle::current().block_on(future))
}

/// Run an async harness call, mapping its error into a script runtime error.
fn drive<T, F>(context: &str, future: F) -> ScriptResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    block_on(future).map_err(|e| runtime_error(context, format!("{:#}", e)))
}

/// Whether an evaluation error must end the whole script (exit or safety limit).
pub fn is_termination(error: &EvalAltResult) -> bool {
    match error {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_termination(inner),
        _ => false,
    }
}

/// The exit code carried by an `exit(code)` termination.
pub fn exit_code_of(error: &EvalAltResult) -> Option<i32> {
    match error {
        EvalAltResult::ErrorTerminated(token, _) => {
            token.clone().try_cast::<ExitRequest>().map(|exit| exit.0)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => exit_code_of(inner),
        _ => None,
    }
}

pub(crate) fn exit_request(code: i64) -> Box<EvalAltResult> {
    let code = i32::try_from(code).unwrap_or(crate::runner::EXIT_FAILURE);
    Box::new(EvalAltResult::ErrorTerminated(
        Dynamic::from(ExitRequest(code)),
        Position::NONE,
    ))
}

fn number(value: &Dynamic, context: &str) -> ScriptResult<f64> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as f64))
        .map_err(|type_name| runtime_error(context, format!("expected a number, got {}", type_name)))
}

fn channel(index: i64, context: &str) -> ScriptResult<usize> {
    let index = usize::try_from(index).map_err(|_| runtime_error(context, "negative channel"))?;
    check_channel(index).map_err(|e| runtime_error(context, e))?;
    Ok(index)
}

/// Dynamic value compared the way scripts expect: ints and floats compare numerically.
#[derive(Clone)]
struct ScriptValue(Dynamic);

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.0, &other.0);
        if a.is_int() && b.is_int() {
            return a.as_int() == b.as_int();
        }
        if let (Ok(x), Ok(y)) = (number(a, ""), number(b, "")) {
            return x == y;
        }
        a.type_name() == b.type_name() && a.to_string() == b.to_string()
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a test body's return value is judged: only `true` passes.
pub fn verdict_of(value: Dynamic) -> Verdict {
    if let Some(passed) = value.clone().try_cast::<bool>() {
        return Verdict::from(passed);
    }
    if value.is_string() {
        let text = value.to_string();
        return if text == SKIP_MARKER {
            Verdict::Skip
        } else {
            Verdict::Fail(Some(text))
        };
    }
    Verdict::Fail(None)
}

// =============================================================================
// TestFramework
// =============================================================================

/// Shared state behind the `TestFramework` module.
#[derive(Clone)]
pub struct TestFrameworkHandle {
    pub runner: Arc<Mutex<TestRunner>>,
    pub session: Arc<DeviceSession>,
}

impl TestFrameworkHandle {
    pub fn new(runner: Arc<Mutex<TestRunner>>, session: Arc<DeviceSession>) -> Self {
        Self { runner, session }
    }

    fn runner(&self) -> MutexGuard<'_, TestRunner> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assertions(&self) -> Assertions {
        self.runner().assertions().clone()
    }

    fn save_results(&self, path: &str) -> crate::error::HarnessResult<()> {
        let runner = self.runner();
        let summary = runner.summary();
        let path = Path::new(path);
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("xml") => report::save_junit(path, &summary, runner.results()),
            Some("csv") => report::save_csv(path, runner.results()),
            _ => report::save_json(path, &summary, runner.results()),
        }
    }

    /// Run one script test body through the runner.
    fn run_test(&self, ctx: &NativeCallContext, name: &str, body: &FnPtr) -> ScriptResult<bool> {
        let pending = self
            .runner()
            .begin(name)
            .map_err(|e| runtime_error("runTest", e))?;

        // the runner lock is not held while the body runs
        let called = catch_unwind(AssertUnwindSafe(|| {
            body.call_within_context::<Dynamic>(ctx, ())
        }));
        let outcome = match called {
            Ok(Ok(value)) => Outcome::Completed(verdict_of(value)),
            Ok(Err(error)) if is_termination(&error) => {
                self.runner()
                    .finish(pending, Outcome::Errored("script terminated".to_string()));
                return Err(error);
            }
            Ok(Err(error)) => Outcome::Errored(error.to_string()),
            Err(panic) => Outcome::Errored(panic_message(panic.as_ref())),
        };

        let mut runner = self.runner();
        Ok(!runner.finish(pending, outcome).status.is_failure())
    }
}

fn numbers<const N: usize>(values: [&Dynamic; N], context: &str) -> ScriptResult<[f64; N]> {
    let mut out = [0.0; N];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = number(value, context)?;
    }
    Ok(out)
}

/// Build the `TestFramework` module.
///
/// It is a static module (`TestFramework::runTest(...)`) rather than a scope variable so
/// that test bodies can call back into it while `runTest` is still executing.
pub fn test_framework_module(tf: TestFrameworkHandle) -> Module {
    let mut module = Module::new();

    // TestFramework::init("Suite name")
    let h = tf.clone();
    module.set_native_fn("init", move |name: &str| -> ScriptResult<()> {
        h.runner().init(name);
        Ok(())
    });

    // TestFramework::connectToDevice() / connectToDevice("ip:...")
    let h = tf.clone();
    module.set_native_fn("connectToDevice", move || -> ScriptResult<bool> {
        Ok(block_on(h.session.connect_to_device(None)))
    });
    let h = tf.clone();
    module.set_native_fn("connectToDevice", move |uri: &str| -> ScriptResult<bool> {
        Ok(block_on(h.session.connect_to_device(Some(uri))))
    });

    let h = tf.clone();
    module.set_native_fn("disconnectFromDevice", move || -> ScriptResult<()> {
        block_on(h.session.disconnect_from_device());
        Ok(())
    });

    // TestFramework::runTest("UID", || { ...; true })
    let h = tf.clone();
    module.set_native_fn(
        "runTest",
        move |ctx: NativeCallContext, name: &str, body: FnPtr| -> ScriptResult<bool> {
            h.run_test(&ctx, name, &body)
        },
    );

    // Assertions; the message argument is optional
    let h = tf.clone();
    module.set_native_fn(
        "assertEqual",
        move |actual: Dynamic, expected: Dynamic, message: &str| -> ScriptResult<bool> {
            Ok(h.assertions()
                .assert_equal(ScriptValue(actual), ScriptValue(expected), message))
        },
    );
    let h = tf.clone();
    module.set_native_fn(
        "assertEqual",
        move |actual: Dynamic, expected: Dynamic| -> ScriptResult<bool> {
            Ok(h.assertions()
                .assert_equal(ScriptValue(actual), ScriptValue(expected), ""))
        },
    );

    let h = tf.clone();
    module.set_native_fn(
        "assertApproxEqual",
        move |actual: Dynamic, expected: Dynamic, tolerance: Dynamic, message: &str| -> ScriptResult<bool> {
            let [actual, expected, tolerance] =
                numbers([&actual, &expected, &tolerance], "assertApproxEqual")?;
            Ok(h.assertions()
                .assert_approx_equal(actual, expected, tolerance, message))
        },
    );
    let h = tf.clone();
    module.set_native_fn(
        "assertApproxEqual",
        move |actual: Dynamic, expected: Dynamic, tolerance: Dynamic| -> ScriptResult<bool> {
            let [actual, expected, tolerance] =
                numbers([&actual, &expected, &tolerance], "assertApproxEqual")?;
            Ok(h.assertions()
                .assert_approx_equal(actual, expected, tolerance, ""))
        },
    );

    let h = tf.clone();
    module.set_native_fn(
        "assertInRange",
        move |value: Dynamic, low: Dynamic, high: Dynamic, message: &str| -> ScriptResult<bool> {
            let [value, low, high] = numbers([&value, &low, &high], "assertInRange")?;
            Ok(h.assertions().assert_in_range(value, low, high, message))
        },
    );
    let h = tf.clone();
    module.set_native_fn(
        "assertInRange",
        move |value: Dynamic, low: Dynamic, high: Dynamic| -> ScriptResult<bool> {
            let [value, low, high] = numbers([&value, &low, &high], "assertInRange")?;
            Ok(h.assertions().assert_in_range(value, low, high, ""))
        },
    );

    // let code = TestFramework::printSummary();
    let h = tf.clone();
    module.set_native_fn("printSummary", move || -> ScriptResult<i64> {
        Ok(i64::from(h.runner().print_summary()))
    });

    // TestFramework::saveResults("results.json" | "results.xml" | "results.csv")
    let h = tf;
    module.set_native_fn("saveResults", move |path: &str| -> ScriptResult<()> {
        h.save_results(path)
            .map_err(|e| runtime_error("saveResults", e))?;
        h.session
            .console()
            .print(format!("Test results saved to: {}", path));
        Ok(())
    });

    module
}

// =============================================================================
// Panel Handles
// =============================================================================

/// `power`: dual-rail power supply.
#[derive(Clone)]
pub struct PowerHandle {
    pub session: Arc<DeviceSession>,
}

/// `dmm`: voltmeter.
#[derive(Clone)]
pub struct VoltmeterHandle {
    pub session: Arc<DeviceSession>,
}

/// `siggen`: signal generator.
#[derive(Clone)]
pub struct GeneratorHandle {
    pub session: Arc<DeviceSession>,
}

/// `osc`: oscilloscope.
#[derive(Clone)]
pub struct ScopeHandle {
    pub session: Arc<DeviceSession>,
}

/// Register panel types, properties and methods.
pub fn register_panels(engine: &mut Engine) {
    engine.register_type_with_name::<PowerHandle>("PowerSupply");
    engine.register_type_with_name::<VoltmeterHandle>("Voltmeter");
    engine.register_type_with_name::<GeneratorHandle>("SignalGenerator");
    engine.register_type_with_name::<ScopeHandle>("Oscilloscope");
    engine.register_type_with_name::<ChannelMeasurements>("Measurements");

    register_power(engine);
    register_voltmeter(engine);
    register_generator(engine);
    register_scope(engine);

    // osc.channel(0).mean
    engine.register_get("mean", |m: &mut ChannelMeasurements| m.mean);
    engine.register_get("peak_to_peak", |m: &mut ChannelMeasurements| m.peak_to_peak);
    engine.register_get("period", |m: &mut ChannelMeasurements| m.period);
    engine.register_get("min", |m: &mut ChannelMeasurements| m.min);
    engine.register_get("max", |m: &mut ChannelMeasurements| m.max);
    engine.register_get("rms", |m: &mut ChannelMeasurements| m.rms);
    engine.register_get("frequency", |m: &mut ChannelMeasurements| m.frequency());
}

fn register_power(engine: &mut Engine) {
    engine.register_set("running", |h: &mut PowerHandle, running: bool| -> ScriptResult<()> {
        drive("power.running", async {
            h.session.power().await?.set_running(running).await
        })
    });

    for (index, name) in [(0usize, "dac1"), (1, "dac2")] {
        let enabled = format!("{}_enabled", name);
        let value = format!("{}_value", name);

        engine.register_set(
            &enabled,
            move |h: &mut PowerHandle, enabled: bool| -> ScriptResult<()> {
                drive("power.dac_enabled", async {
                    h.session.power().await?.set_dac_enabled(index, enabled).await
                })
            },
        );
        engine.register_set(
            &value,
            move |h: &mut PowerHandle, volts: Dynamic| -> ScriptResult<()> {
                let volts = number(&volts, "power.dac_value")?;
                drive("power.dac_value", async {
                    h.session.power().await?.set_dac_value(index, volts).await
                })
            },
        );
        engine.register_get(&value, move |h: &mut PowerHandle| -> ScriptResult<f64> {
            drive("power.dac_value", async {
                h.session.power().await?.dac_value(index).await
            })
        });
    }

    // power.tracking = true makes DAC2 follow DAC1
    engine.register_set("tracking", |h: &mut PowerHandle, tracking: bool| -> ScriptResult<()> {
        drive("power.tracking", async {
            h.session.power().await?.set_tracking(tracking).await
        })
    });

    engine.register_set(
        "tracking_percent",
        |h: &mut PowerHandle, percent: Dynamic| -> ScriptResult<()> {
            let percent = number(&percent, "power.tracking_percent")?;
            drive("power.tracking_percent", async {
                h.session.power().await?.set_tracking_percent(percent).await
            })
        },
    );
}

fn register_voltmeter(engine: &mut Engine) {
    engine.register_set(
        "running",
        |h: &mut VoltmeterHandle, running: bool| -> ScriptResult<()> {
            drive("dmm.running", async {
                h.session.voltmeter().await?.set_running(running).await
            })
        },
    );

    for (index, name) in [(0usize, "value_ch1"), (1, "value_ch2")] {
        engine.register_get(name, move |h: &mut VoltmeterHandle| -> ScriptResult<f64> {
            drive("dmm.value", async {
                h.session.voltmeter().await?.value(index).await
            })
        });
    }
}

/// Read-modify-write of one generator channel.
fn update_generator<F>(h: &GeneratorHandle, context: &str, index: i64, change: F) -> ScriptResult<()>
where
    F: FnOnce(GeneratorChannel) -> Result<GeneratorChannel, String>,
{
    let index = channel(index, context)?;
    let siggen = block_on(h.session.signal_generator()).map_err(|e| runtime_error(context, e))?;
    let current = drive(context, siggen.channel(index))?;
    let updated = change(current).map_err(|e| runtime_error(context, e))?;
    drive(context, siggen.configure_channel(index, updated))
}

fn update_waveform<F>(h: &GeneratorHandle, context: &str, index: i64, change: F) -> ScriptResult<()>
where
    F: FnOnce(Waveform) -> Waveform,
{
    update_generator(h, context, index, |current| match current.mode {
        GeneratorMode::Waveform(wave) => Ok(GeneratorChannel {
            mode: GeneratorMode::Waveform(change(wave)),
            ..current
        }),
        GeneratorMode::Constant { .. } => Err("channel is in constant mode".to_string()),
        GeneratorMode::Math(_) => Err("channel is in math mode".to_string()),
    })
}

fn register_generator(engine: &mut Engine) {
    engine.register_set(
        "running",
        |h: &mut GeneratorHandle, running: bool| -> ScriptResult<()> {
            drive("siggen.running", async {
                h.session.signal_generator().await?.set_running(running).await
            })
        },
    );

    // siggen.set_enabled(0, false)
    engine.register_fn(
        "set_enabled",
        |h: &mut GeneratorHandle, index: i64, enabled: bool| -> ScriptResult<()> {
            update_generator(h, "siggen.set_enabled", index, |current| {
                Ok(GeneratorChannel { enabled, ..current })
            })
        },
    );

    engine.register_fn(
        "is_enabled",
        |h: &mut GeneratorHandle, index: i64| -> ScriptResult<bool> {
            let index = channel(index, "siggen.is_enabled")?;
            drive("siggen.is_enabled", async {
                Ok(h.session.signal_generator().await?.channel(index).await?.enabled)
            })
        },
    );

    // siggen.set_constant(0, 3.3)
    engine.register_fn(
        "set_constant",
        |h: &mut GeneratorHandle, index: i64, volts: Dynamic| -> ScriptResult<()> {
            let volts = number(&volts, "siggen.set_constant")?;
            update_generator(h, "siggen.set_constant", index, |current| {
                Ok(GeneratorChannel::constant(volts).with_noise(current.noise))
            })
        },
    );

    // siggen.set_waveform(0, "sine", 5.0, 1000.0)
    engine.register_fn(
        "set_waveform",
        |h: &mut GeneratorHandle,
         index: i64,
         kind: &str,
         amplitude: Dynamic,
         frequency: Dynamic|
         -> ScriptResult<()> {
            let kind: WaveformKind = kind
                .parse()
                .map_err(|e| runtime_error("siggen.set_waveform", e))?;
            let amplitude = number(&amplitude, "siggen.set_waveform")?;
            let frequency = number(&frequency, "siggen.set_waveform")?;
            update_generator(h, "siggen.set_waveform", index, |current| {
                Ok(GeneratorChannel::waveform(Waveform::new(kind, amplitude, frequency))
                    .with_noise(current.noise))
            })
        },
    );

    // siggen.set_math(0, "5*sin(2*3.14159265*100*t)", 37500000, 0.01)
    engine.register_fn(
        "set_math",
        |h: &mut GeneratorHandle,
         index: i64,
         expression: &str,
         sample_rate: Dynamic,
         record_length: Dynamic|
         -> ScriptResult<()> {
            let sample_rate = number(&sample_rate, "siggen.set_math")?;
            let record_length = number(&record_length, "siggen.set_math")?;
            let function = MathFunction::new(expression, sample_rate, record_length);
            update_generator(h, "siggen.set_math", index, |current| {
                Ok(GeneratorChannel::math(function).with_noise(current.noise))
            })
        },
    );

    // siggen.set_noise(0, "uniform", 0.5); "none" switches it off
    engine.register_fn(
        "set_noise",
        |h: &mut GeneratorHandle, index: i64, kind: &str, amplitude: Dynamic| -> ScriptResult<()> {
            let kind: NoiseKind = kind
                .parse()
                .map_err(|e| runtime_error("siggen.set_noise", e))?;
            let amplitude = number(&amplitude, "siggen.set_noise")?;
            update_generator(h, "siggen.set_noise", index, |current| {
                Ok(current.with_noise(Noise { kind, amplitude }))
            })
        },
    );

    engine.register_fn(
        "set_offset",
        |h: &mut GeneratorHandle, index: i64, volts: Dynamic| -> ScriptResult<()> {
            let volts = number(&volts, "siggen.set_offset")?;
            update_waveform(h, "siggen.set_offset", index, |wave| wave.with_offset(volts))
        },
    );

    engine.register_fn(
        "set_phase",
        |h: &mut GeneratorHandle, index: i64, degrees: Dynamic| -> ScriptResult<()> {
            let degrees = number(&degrees, "siggen.set_phase")?;
            update_waveform(h, "siggen.set_phase", index, |wave| wave.with_phase(degrees))
        },
    );

    engine.register_fn(
        "set_duty",
        |h: &mut GeneratorHandle, index: i64, percent: Dynamic| -> ScriptResult<()> {
            let percent = number(&percent, "siggen.set_duty")?;
            update_waveform(h, "siggen.set_duty", index, |wave| wave.with_duty(percent))
        },
    );
}

fn register_scope(engine: &mut Engine) {
    engine.register_set(
        "running",
        |h: &mut ScopeHandle, running: bool| -> ScriptResult<()> {
            drive("osc.running", async {
                h.session.oscilloscope().await?.set_running(running).await
            })
        },
    );

    engine.register_set(
        "time_base",
        |h: &mut ScopeHandle, seconds: Dynamic| -> ScriptResult<()> {
            let seconds = number(&seconds, "osc.time_base")?;
            drive("osc.time_base", async {
                h.session.oscilloscope().await?.set_time_base(seconds).await
            })
        },
    );

    // osc.enable_channel(0, 2.0) with volts per division
    engine.register_fn(
        "enable_channel",
        |h: &mut ScopeHandle, index: i64, volts_per_div: Dynamic| -> ScriptResult<()> {
            let index = channel(index, "osc.enable_channel")?;
            let volts_per_div = number(&volts_per_div, "osc.enable_channel")?;
            drive("osc.enable_channel", async {
                h.session
                    .oscilloscope()
                    .await?
                    .configure_channel(index, ScopeChannel::enabled(volts_per_div))
                    .await
            })
        },
    );

    engine.register_fn(
        "disable_channel",
        |h: &mut ScopeHandle, index: i64| -> ScriptResult<()> {
            let index = channel(index, "osc.disable_channel")?;
            drive("osc.disable_channel", async {
                h.session
                    .oscilloscope()
                    .await?
                    .configure_channel(index, ScopeChannel::default())
                    .await
            })
        },
    );

    // osc.trigger(0, 0.0): auto trigger on a source at a level
    engine.register_fn(
        "trigger",
        |h: &mut ScopeHandle, source: i64, level: Dynamic| -> ScriptResult<()> {
            let source = channel(source, "osc.trigger")?;
            let level = number(&level, "osc.trigger")?;
            let trigger = Trigger {
                level,
                ..Trigger::auto(source)
            };
            drive("osc.trigger", async {
                h.session.oscilloscope().await?.set_trigger(trigger).await
            })
        },
    );

    // let m = osc.channel(0); only valid after osc.running = false
    engine.register_fn(
        "channel",
        |h: &mut ScopeHandle, index: i64| -> ScriptResult<ChannelMeasurements> {
            let index = channel(index, "osc.channel")?;
            drive("osc.channel", async {
                h.session.oscilloscope().await?.measurements(index).await
            })
        },
    );
}
