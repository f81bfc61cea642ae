//! Fixed-interval convergence polling
//!
//! Remote lifecycle state is eventually consistent, so most operations end in
//! a wait. A check returns one of three things:
//! - `Ok(PollOutcome::Converged(v))`: done, `v` is returned
//! - `Ok(PollOutcome::Pending(reason))`: not yet, try again after `interval`
//! - `Err(e)`: hard failure, the wait aborts immediately with `e`
//!
//! The wait fails with [`Error::Timeout`] (carrying the last pending reason)
//! once `timeout` has elapsed, and with [`Error::Cancelled`] as soon as the
//! cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Result of a single convergence check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The awaited state was reached
    Converged(T),
    /// Not there yet, with a human-readable reason
    Pending(String),
}

impl<T> PollOutcome<T> {
    /// Shorthand for a pending outcome
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending(reason.into())
    }
}

/// Interval and total budget of a wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Fixed delay between checks
    pub interval: Duration,
    /// Total wall-clock budget
    pub timeout: Duration,
}

impl PollSettings {
    /// Create poll settings
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Run `check` every `settings.interval` until it converges
pub async fn poll_until_converged<T, F, Fut>(
    operation: &str,
    settings: PollSettings,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>>>,
{
    let deadline = Instant::now() + settings.timeout;
    let cancelled = || Error::Cancelled {
        operation: operation.to_string(),
    };
    let timeout = |last: String| Error::Timeout {
        operation: operation.to_string(),
        last,
    };
    let mut attempt: u32 = 0;
    let mut last: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        attempt += 1;
        // a check still running at the deadline counts as a timeout
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            outcome = check() => match outcome? {
                PollOutcome::Converged(value) => {
                    debug!(operation, attempt, "converged");
                    return Ok(value);
                }
                PollOutcome::Pending(reason) => reason,
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(timeout(
                    last.unwrap_or_else(|| "check did not complete before the deadline".to_string()),
                ));
            }
        };

        debug!(operation, attempt, reason = %reason, "not converged yet");

        let now = Instant::now();
        if now >= deadline {
            return Err(timeout(reason));
        }
        last = Some(reason);

        // the last sleep is clipped so one check runs at the deadline itself
        let wake = (now + settings.interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
