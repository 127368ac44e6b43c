//! Rhai script host.
//!
//! Owns the Rhai engine, the device session and the test runner a script drives.
//! Scripts see:
//!
//! - globals `power`, `dmm`, `siggen`, `osc` (panel handles)
//! - the `TestFramework::` module
//! - host functions `printToConsole`, `msleep`, `switchToTool`, `evaluateFile`, `exit`
//!
//! # Safety Limits
//!
//! This host enforces a 10,000 operation limit by default to prevent infinite loops.
//! Suites with long sweeps raise it with [`ScriptHost::with_operation_limit`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut host = ScriptHost::new(session, runner);
//! let outcome = host.run_file("scripts/power_supply.rhai")?;
//! std::process::exit(outcome.exit_code);
//! ```

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, NativeCallContext, Scope};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};
use crate::runner::TestRunner;
use crate::scripting::bindings::{
    self, block_on, exit_code_of, exit_request, is_termination, runtime_error, GeneratorHandle,
    PowerHandle, ScopeHandle, TestFrameworkHandle, VoltmeterHandle,
};
use crate::session::DeviceSession;
use crate::settle::settle_delay;

/// Default maximum number of Rhai operations per evaluation.
pub const DEFAULT_OPERATION_LIMIT: u64 = 10_000;

/// How a script run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// Code passed to `exit`, or 0 when the script ran to completion
    pub exit_code: i32,
}

/// Everything a script evaluation shares with nested `evaluateFile` calls.
#[derive(Clone)]
struct ScriptGlobals {
    session: Arc<DeviceSession>,
    base_dir: Arc<RwLock<PathBuf>>,
}

impl ScriptGlobals {
    /// A fresh scope holding the panel handles.
    fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        let session = self.session.clone();
        scope.push("power", PowerHandle { session: session.clone() });
        scope.push("dmm", VoltmeterHandle { session: session.clone() });
        scope.push("siggen", GeneratorHandle { session: session.clone() });
        scope.push("osc", ScopeHandle { session });
        scope
    }

    fn base_dir(&self) -> PathBuf {
        self.base_dir
            .read()
            .map(|dir| dir.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_base_dir(&self, dir: PathBuf) {
        match self.base_dir.write() {
            Ok(mut guard) => *guard = dir,
            Err(poisoned) => *poisoned.into_inner() = dir,
        }
    }
}

/// Rhai host for harness scripts.
pub struct ScriptHost {
    /// Rhai engine instance
    engine: Engine,
    globals: ScriptGlobals,
    runner: Arc<Mutex<TestRunner>>,
}

impl ScriptHost {
    /// Create a host with the default safety limit (10,000 operations).
    ///
    /// Must be called inside a multi-thread tokio runtime; every harness call made
    /// by a script blocks on it.
    pub fn new(session: Arc<DeviceSession>, runner: TestRunner) -> Self {
        let runner = Arc::new(Mutex::new(runner));
        let globals = ScriptGlobals {
            session: session.clone(),
            base_dir: Arc::new(RwLock::new(PathBuf::from("."))),
        };

        let mut engine = Engine::new();
        Self::set_limit(&mut engine, DEFAULT_OPERATION_LIMIT);

        bindings::register_panels(&mut engine);
        engine.register_static_module(
            "TestFramework",
            bindings::test_framework_module(TestFrameworkHandle::new(runner.clone(), session))
                .into(),
        );
        register_host_functions(&mut engine, &globals);

        Self {
            engine,
            globals,
            runner,
        }
    }

    /// Replace the operation limit.
    pub fn with_operation_limit(mut self, limit: u64) -> Self {
        Self::set_limit(&mut self.engine, limit);
        self
    }

    fn set_limit(engine: &mut Engine, limit: u64) {
        engine.on_progress(move |count| {
            if count > limit {
                Some(format!("Safety limit exceeded: maximum {} operations", limit).into())
            } else {
                None
            }
        });
    }

    /// Evaluate script source. Relative `evaluateFile` paths resolve against the
    /// current directory.
    pub fn run_script(&self, script: &str) -> HarnessResult<ScriptOutcome> {
        let mut scope = self.globals.scope();
        let result = self.engine.eval_with_scope::<Dynamic>(&mut scope, script);
        Self::outcome(result)
    }

    /// Evaluate a script file. Relative `evaluateFile` paths and `import`s resolve
    /// against the script's directory.
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> HarnessResult<ScriptOutcome> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        self.engine
            .set_module_resolver(FileModuleResolver::new_with_path(dir.clone()));
        self.globals.set_base_dir(dir);

        tracing::info!(script = %path.display(), "running script");
        self.run_script(&source)
    }

    /// Check a script for syntax errors without running it.
    pub fn validate_script(&self, script: &str) -> HarnessResult<()> {
        self.engine
            .compile(script)
            .map(|_| ())
            .map_err(|e| HarnessError::Script(e.to_string()))
    }

    fn outcome(result: Result<Dynamic, Box<EvalAltResult>>) -> HarnessResult<ScriptOutcome> {
        match result {
            Ok(_) => Ok(ScriptOutcome { exit_code: 0 }),
            Err(error) => match exit_code_of(&error) {
                Some(exit_code) => {
                    tracing::info!(exit_code, "script exited");
                    Ok(ScriptOutcome { exit_code })
                }
                None => {
                    tracing::error!(error = %error, "script failed");
                    Err(HarnessError::Script(error.to_string()))
                }
            },
        }
    }

    /// The runner the script's `TestFramework` records into.
    pub fn runner(&self) -> Arc<Mutex<TestRunner>> {
        self.runner.clone()
    }

    /// The device session behind the panel globals.
    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.globals.session
    }

    /// Get mutable access to the underlying Rhai engine.
    ///
    /// Useful for registering additional functions in tests.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

fn register_host_functions(engine: &mut Engine, globals: &ScriptGlobals) {
    // printToConsole("text") accepts any printable value
    let console = globals.session.console().clone();
    engine.register_fn("printToConsole", move |message: Dynamic| {
        console.print(message.to_string());
    });

    // msleep(500)
    engine.register_fn("msleep", |millis: i64| {
        let millis = u64::try_from(millis).unwrap_or(0);
        block_on(settle_delay(Duration::from_millis(millis)));
    });

    // switchToTool("Voltmeter") -> bool
    let session = globals.session.clone();
    engine.register_fn("switchToTool", move |name: &str| -> bool {
        block_on(session.switch_to_tool(name))
    });

    // exit(code) ends the whole script, including from inside a test body
    engine.register_fn("exit", |code: i64| -> Result<(), Box<EvalAltResult>> {
        Err(exit_request(code))
    });
    engine.register_fn("exit", || -> Result<(), Box<EvalAltResult>> {
        Err(exit_request(0))
    });

    // evaluateFile("helpers.rhai") runs another file with fresh panel globals
    let nested = globals.clone();
    engine.register_fn(
        "evaluateFile",
        move |ctx: NativeCallContext, path: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let resolved = nested.base_dir().join(path);
            let mut scope = nested.scope();
            ctx.engine()
                .eval_file_with_scope::<Dynamic>(&mut scope, resolved)
                .map_err(|error| {
                    if is_termination(&error) {
                        error
                    } else {
                        runtime_error(&format!("evaluateFile({})", path), error)
                    }
                })
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::Assertions;
    use crate::config::{DeviceConfig, SettleConfig, SimulatorConfig};
    use crate::console::ConsoleLog;
    use crate::simulator::SimulatedDevice;

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

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_script_completes_with_zero() {
        let host = host();
        let outcome = host.run_script("let x = 10; x * 2").unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exit_carries_the_code() {
        let host = host();
        let outcome = host.run_script("exit(3); printToConsole(\"unreachable\");").unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!host.session().console().contains("unreachable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn safety_limit_stops_infinite_loops() {
        let host = host();
        let result = host.run_script("loop { }");
        assert!(matches!(result, Err(HarnessError::Script(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operation_limit_is_configurable() {
        let host = host().with_operation_limit(100_000);
        let outcome = host
            .run_script("let sum = 0; for i in 0..5000 { sum += i; } sum")
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn syntax_errors_are_reported() {
        let host = host();
        assert!(host.validate_script("let x = ;").is_err());
        assert!(host.validate_script("let x = 1;").is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn print_to_console_records_lines() {
        let host = host();
        host.run_script(r#"printToConsole("hello"); printToConsole(42);"#)
            .unwrap();
        let console = host.session().console();
        assert!(console.contains("hello"));
        assert!(console.contains("42"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panel_access_requires_the_tool() {
        let host = host();
        let result = host.run_script(
            r#"
            TestFramework::connectToDevice();
            power.dac1_value = 1.0;
            "#,
        );
        assert!(matches!(result, Err(HarnessError::Script(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runner_records_script_tests() {
        let host = host();
        host.run_script(
            r#"
            TestFramework::init("Script Suite");
            TestFramework::runTest("TST.PASS", || true);
            TestFramework::runTest("TST.FAIL", || "no signal");
            TestFramework::runTest("TST.SKIP", || "SKIP");
            TestFramework::runTest("TST.ERROR", || { throw "boom"; });
            "#,
        )
        .unwrap();

        let runner = host.runner();
        let runner = runner.lock().unwrap();
        let summary = runner.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errored, 1);
    }
}
