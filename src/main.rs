//! CLI Entry Point for panel-harness
//!
//! Provides command-line interface for:
//! - Running the built-in acceptance suites against the simulated bench
//! - Running Rhai test scripts
//! - Listing suites and their test UIDs
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Run a suite and write a JUnit report:
//! ```bash
//! panel-harness suite power-supply --junit target/power.xml
//! ```
//!
//! Run a script:
//! ```bash
//! panel-harness run scripts/power_supply.rhai
//! ```
//!
//! The process exit code is 0 when every test passed (or was skipped) and 1 otherwise.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use panel_harness::config::{HarnessConfig, ReportConfig};
use panel_harness::scenarios::{self, SuiteKind, SuiteRun};
use panel_harness::scripting::{ScriptHost, DEFAULT_OPERATION_LIMIT};
use panel_harness::simulator::SimulatedDevice;
use panel_harness::{logging, report, Assertions, ConsoleLog, DeviceSession, TestRunner};

#[derive(Parser)]
#[command(name = "panel-harness")]
#[command(about = "Acceptance tests for instrument-control panels", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/harness.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device URI, overriding the configuration
    #[arg(long, global = true)]
    uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Rhai test script
    Run {
        /// Path to .rhai script file
        script: PathBuf,

        /// Maximum Rhai operations per evaluation
        #[arg(long, default_value_t = DEFAULT_OPERATION_LIMIT)]
        operation_limit: u64,
    },

    /// Run a built-in suite (power-supply, signal-generator or all)
    Suite {
        suite: String,

        /// Write a JSON report
        #[arg(long)]
        json: Option<PathBuf>,

        /// Write a JUnit XML report
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Write a CSV report
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// List the built-in suites and their tests
    List,

    /// Print the effective configuration (file + environment + --uri)
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load_from(path),
        None => HarnessConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(uri) = cli.uri {
        config.device.uri = uri;
    }

    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("⚠️  Logging disabled: {}", e);
    }

    match cli.command {
        Commands::Run {
            script,
            operation_limit,
        } => run_script(&config, &script, operation_limit),
        Commands::Suite {
            suite,
            json,
            junit,
            csv,
        } => {
            let reports = ReportConfig {
                json: json.or(config.report.json.clone()),
                junit: junit.or(config.report.junit.clone()),
                csv: csv.or(config.report.csv.clone()),
            };
            run_suites(&config, &suite, &reports).await
        }
        Commands::List => {
            list_suites();
            Ok(0)
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(0)
        }
    }
}

fn build_session(config: &HarnessConfig, console: &ConsoleLog) -> Arc<DeviceSession> {
    let backend = Arc::new(SimulatedDevice::new(&config.simulator));
    Arc::new(DeviceSession::new(
        backend,
        config.device.clone(),
        config.settle.clone(),
        console.clone(),
    ))
}

fn run_script(config: &HarnessConfig, script: &Path, operation_limit: u64) -> Result<i32> {
    let console = ConsoleLog::new();
    let session = build_session(config, &console);
    let runner = TestRunner::new(Assertions::new(console));

    let mut host = ScriptHost::new(session, runner).with_operation_limit(operation_limit);
    let outcome = host
        .run_file(script)
        .with_context(|| format!("running {}", script.display()))?;
    Ok(outcome.exit_code)
}

async fn run_suites(config: &HarnessConfig, suite: &str, reports: &ReportConfig) -> Result<i32> {
    let kinds: Vec<SuiteKind> = if suite.eq_ignore_ascii_case("all") {
        SuiteKind::ALL.to_vec()
    } else {
        vec![suite.parse()?]
    };

    let console = ConsoleLog::new();
    let session = build_session(config, &console);

    let mut runs: Vec<SuiteRun> = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        let mut runner = TestRunner::new(Assertions::new(console.clone()));
        let run = scenarios::run_suite(*kind, &mut runner, &session).await?;

        let paths = reports_for(reports, *kind, kinds.len() > 1);
        report::save_configured(&paths, &run.summary, &run.results)
            .with_context(|| format!("writing reports for {}", kind))?;
        runs.push(run);
    }

    Ok(scenarios::combined_exit_code(&runs))
}

/// Report paths for one suite; with several suites each file gets the suite id appended.
fn reports_for(reports: &ReportConfig, kind: SuiteKind, several: bool) -> ReportConfig {
    if !several {
        return reports.clone();
    }
    let tag = |path: &PathBuf| {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
        let name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}-{}.{}", stem, kind.id(), ext),
            None => format!("{}-{}", stem, kind.id()),
        };
        path.with_file_name(name)
    };
    ReportConfig {
        json: reports.json.as_ref().map(tag),
        junit: reports.junit.as_ref().map(tag),
        csv: reports.csv.as_ref().map(tag),
    }
}

fn list_suites() {
    for kind in SuiteKind::ALL {
        println!("{} ({})", kind.id(), kind.title());
        for test in kind.test_ids() {
            println!("  {}", test);
        }
    }
}
