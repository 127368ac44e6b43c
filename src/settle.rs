//! Waiting for the instrument to settle.
//!
//! Panel writes have no completion event. Two ways to wait are offered:
//!
//! - [`settle_delay`]: the plain fixed wall-clock wait (`msleep`), not cancellable.
//! - [`await_settled`]: poll a predicate at a fixed interval until it holds, giving up
//!   with [`HarnessError::SettleTimeout`] after a timeout.
//!
//! Neither detects settling from the signal itself; the fixed delays in
//! [`crate::config::SettleConfig`] are empirically tuned per measurement type.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::SettleConfig;
use crate::error::{HarnessError, HarnessResult};

/// Poll schedule for [`await_settled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl SettlePolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl From<&SettleConfig> for SettlePolicy {
    fn from(config: &SettleConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Block for a fixed time so the hardware can stabilise.
pub async fn settle_delay(duration: Duration) {
    if !duration.is_zero() {
        tracing::trace!(ms = duration.as_millis() as u64, "settle delay");
        sleep(duration).await;
    }
}

/// Poll `predicate` until it returns `Ok(true)`.
///
/// The predicate is always evaluated at least once, and once more at the deadline.
/// Errors from the predicate are returned immediately.
pub async fn await_settled<P, Fut>(mut predicate: P, policy: SettlePolicy) -> HarnessResult<()>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<bool>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut polls = 0u32;
    loop {
        polls += 1;
        if predicate().await? {
            tracing::debug!(polls, "settled");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(polls, timeout_ms = policy.timeout.as_millis() as u64, "settle timeout");
            return Err(HarnessError::SettleTimeout(policy.timeout));
        }
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}
