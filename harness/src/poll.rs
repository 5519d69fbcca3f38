/*!

Polling that requires a condition to hold for a number of consecutive attempts before it is
trusted. Mesh policy takes a while to reach every sidecar, so a single success is not enough to say
that traffic is flowing.

!*/

use log::{debug, info, warn};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// The time between two probe attempts unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Calls a probe on a fixed cadence until it has succeeded `required` times in a row or `max_wait`
/// has passed.
///
/// The deadline is only checked between attempts. A probe that is already running when the deadline
/// passes is allowed to finish, and if it hangs the poller hangs with it. Probes that need a bound
/// must carry their own timeout.
#[derive(Debug, Clone, Copy)]
pub struct RepeatedSuccess {
    required: NonZeroU32,
    max_wait: Duration,
    interval: Duration,
}

impl RepeatedSuccess {
    pub fn new(required: NonZeroU32, max_wait: Duration) -> Self {
        Self {
            required,
            max_wait,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the sleep between attempts. The interval is constant, there is no backoff.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn required(&self) -> NonZeroU32 {
        self.required
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Returns `true` once `probe` has returned `true` for `required` consecutive calls. Any
    /// `false` resets the streak to zero. Returns `false` if the deadline is reached first.
    pub async fn wait<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let required = self.required.get();
        let mut streak = 0u32;
        let mut attempts = 0u32;

        while start.elapsed() < self.max_wait {
            attempts += 1;
            if probe().await {
                streak += 1;
                debug!(
                    "Attempt {} succeeded ({}/{} consecutive)",
                    attempts, streak, required
                );
                if streak >= required {
                    info!(
                        "Observed {} consecutive successes after {} attempts in {:?}",
                        required,
                        attempts,
                        start.elapsed()
                    );
                    return true;
                }
            } else {
                if streak > 0 {
                    debug!(
                        "Attempt {} failed, resetting streak of {}",
                        attempts, streak
                    );
                } else {
                    debug!("Attempt {} failed", attempts);
                }
                streak = 0;
            }
            sleep(self.interval).await;
        }

        warn!(
            "Did not observe {} consecutive successes within {:?} ({} attempts, final streak {})",
            required, self.max_wait, attempts, streak
        );
        false
    }
}

/// Shorthand for `RepeatedSuccess::new(required, max_wait).wait(probe)` with the default
/// one-second cadence.
pub async fn wait_for_repeated_success<F, Fut>(
    probe: F,
    required: NonZeroU32,
    max_wait: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    RepeatedSuccess::new(required, max_wait).wait(probe).await
}
