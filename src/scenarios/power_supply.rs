//! Power Supply + Voltmeter suite.
//!
//! The voltmeter is wired to the supply terminals: channel 1 measures V+ (DAC1),
//! channel 2 measures V- (DAC2). Every step writes the supply, waits for the output
//! to settle, switches to the voltmeter, lets it acquire, reads, and switches back.

use anyhow::Result;

use crate::assertions::Assertions;
use crate::error::{HarnessError, HarnessResult};
use crate::runner::TestRunner;
use crate::session::{DeviceSession, Tool};
use crate::settle::{await_settled, settle_delay, SettlePolicy};

/// Suite name printed in the banner and reports.
pub const SUITE_NAME: &str = "Power Supply + Voltmeter Tests";

pub const POSITIVE: &str = "TST.PS.POSITIVE";
pub const NEGATIVE: &str = "TST.PS.NEGATIVE";
pub const FINE_TUNING: &str = "TST.PS.FINE_TUNING";
pub const TRACKING: &str = "TST.PS.TRACKING";

/// Test UIDs in execution order.
pub const TESTS: [&str; 4] = [POSITIVE, NEGATIVE, FINE_TUNING, TRACKING];

const POSITIVE_SET_POINTS: [f64; 7] = [0.1, 0.5, 1.0, 2.0, 3.3, 4.5, 5.0];
const NEGATIVE_SET_POINTS: [f64; 7] = [-0.1, -0.5, -1.0, -2.0, -3.3, -4.5, -5.0];
const FINE_BASE: f64 = 3.3;
const FINE_STEPS: [f64; 7] = [-0.1, -0.05, -0.01, 0.0, 0.01, 0.05, 0.1];
const FINE_TOLERANCE: f64 = 0.1;
const TRACKING_MASTER_TOLERANCE: f64 = 0.1;
const TRACKING_SLAVE_TOLERANCE: f64 = 0.15;

/// One tracking-mode step: ratio, DAC1 set-point and the expected DAC2 output.
#[derive(Debug, Clone, Copy)]
struct TrackingStep {
    percent: f64,
    dac1: f64,
    expected_dac2: f64,
}

const TRACKING_STEPS: [TrackingStep; 4] = [
    TrackingStep { percent: 100.0, dac1: 3.0, expected_dac2: -3.0 },
    TrackingStep { percent: 50.0, dac1: 4.0, expected_dac2: -2.0 },
    TrackingStep { percent: 75.0, dac1: 4.0, expected_dac2: -3.0 },
    TrackingStep { percent: 25.0, dac1: 4.0, expected_dac2: -1.0 },
];

/// Output accuracy is looser near the top of the rail.
pub fn rail_tolerance(volts: f64) -> f64 {
    if volts.abs() >= 4.5 {
        0.1
    } else {
        0.06
    }
}

/// Run every test of the suite in order. Only runner misuse is returned as an error.
pub async fn run(runner: &mut TestRunner, session: &DeviceSession) -> HarnessResult<()> {
    let checks = runner.assertions().clone();
    runner.run_test(POSITIVE, || positive_output(session, &checks)).await?;
    runner.run_test(NEGATIVE, || negative_output(session, &checks)).await?;
    runner.run_test(FINE_TUNING, || fine_tuning(session, &checks)).await?;
    runner.run_test(TRACKING, || tracking(session, &checks)).await?;
    Ok(())
}

/// Switch to the voltmeter, acquire both channels and come back to the supply.
async fn read_meter(session: &DeviceSession) -> Result<[f64; 2]> {
    session.switch_to(Tool::Voltmeter).await?;
    let dmm = session.voltmeter().await?;
    dmm.set_running(true).await?;
    settle_delay(session.settle().meter()).await;
    let readings = [dmm.value(0).await?, dmm.value(1).await?];
    dmm.set_running(false).await?;
    session.switch_to(Tool::PowerSupply).await?;
    Ok(readings)
}

async fn positive_output(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let power = session.power().await?;
    power.set_dac_enabled(0, true).await?;
    power.set_running(true).await?;

    let mut all_pass = true;
    for volts in POSITIVE_SET_POINTS {
        let power = session.power().await?;
        session.console().print(format!("  Setting DAC1 to {}V", volts));
        power.set_dac_value(0, volts).await?;
        settle_delay(session.settle().output()).await;

        let [measured, _] = read_meter(session).await?;
        all_pass &= checks.assert_approx_equal(
            measured,
            volts,
            rail_tolerance(volts),
            "DAC1 output verification",
        );
    }

    session.power().await?.set_dac_enabled(0, false).await?;
    Ok(all_pass)
}

async fn negative_output(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let power = session.power().await?;
    // DAC2 writes only apply in independent mode
    power.set_tracking(false).await?;
    power.set_dac_enabled(1, true).await?;
    power.set_running(true).await?;

    session.console().print("  Testing DAC2 negative voltage output");
    let mut all_pass = true;
    for volts in NEGATIVE_SET_POINTS {
        let power = session.power().await?;
        session.console().print(format!("  Setting DAC2 to {}V", volts));
        power.set_dac_value(1, volts).await?;
        settle_delay(session.settle().output()).await;

        let [_, measured] = read_meter(session).await?;
        all_pass &= checks.assert_approx_equal(
            measured,
            volts,
            rail_tolerance(volts),
            "DAC2 negative voltage output",
        );
    }

    session.power().await?.set_dac_enabled(1, false).await?;
    Ok(all_pass)
}

async fn fine_tuning(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let power = session.power().await?;
    power.set_dac_enabled(0, true).await?;
    power.set_running(true).await?;

    let mut all_pass = true;
    for step in FINE_STEPS {
        let power = session.power().await?;
        let volts = FINE_BASE + step;
        session.console().print(format!("  Fine tuning to {:.3}V", volts));
        power.set_dac_value(0, volts).await?;
        settle_delay(session.settle().output()).await;

        let [measured, _] = read_meter(session).await?;
        all_pass &=
            checks.assert_approx_equal(measured, volts, FINE_TOLERANCE, "Fine tuning verification");
    }

    session.power().await?.set_dac_enabled(0, false).await?;
    Ok(all_pass)
}

async fn tracking(session: &DeviceSession, checks: &Assertions) -> Result<bool> {
    let power = session.power().await?;
    power.set_dac_enabled(0, true).await?;
    power.set_dac_enabled(1, true).await?;
    power.set_running(true).await?;
    power.set_tracking(true).await?;

    session
        .console()
        .print("  Testing tracking mode with positive master (DAC1)");
    let mut all_pass = true;
    for step in TRACKING_STEPS {
        let power = session.power().await?;
        session
            .console()
            .print(format!("  Testing tracking at {}%", step.percent));
        power.set_tracking_percent(step.percent).await?;
        power.set_dac_value(0, step.dac1).await?;

        // the slave set-point follows the master before the terminals can settle
        await_settled(
            || {
                let power = power.clone();
                async move {
                    let slave = power
                        .dac_value(1)
                        .await
                        .map_err(|e| HarnessError::Device(format!("{:#}", e)))?;
                    Ok((slave - step.expected_dac2).abs() < 1e-9)
                }
            },
            SettlePolicy::from(session.settle()),
        )
        .await?;
        settle_delay(session.settle().tracking()).await;

        let [master, slave] = read_meter(session).await?;
        let master_ok = checks.assert_approx_equal(
            master,
            step.dac1,
            TRACKING_MASTER_TOLERANCE,
            "DAC1 tracking master",
        );
        let slave_ok = checks.assert_approx_equal(
            slave,
            step.expected_dac2,
            TRACKING_SLAVE_TOLERANCE,
            &format!("DAC2 tracking slave at {}%", step.percent),
        );
        all_pass &= master_ok && slave_ok;
    }

    let power = session.power().await?;
    power.set_tracking(false).await?;
    power.set_dac_enabled(0, false).await?;
    power.set_dac_enabled(1, false).await?;
    Ok(all_pass)
}
