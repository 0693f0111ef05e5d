//! Sliding-window throttle for calls to the generation service.
//!
//! At most `max_per_minute` acquisitions are granted in any trailing
//! 60-second window. Waiters sleep in short steps with the lock released, so
//! other callers (and [`RateLimiter::reset`]) proceed while someone waits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::agent::interrupt::{InterruptSignal, Interrupted, NoInterrupt};
use crate::clock::{Clock, Deadline, SystemClock};

/// Length of the rolling window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Slack added to a computed wait so the oldest grant has surely aged out.
const EPSILON: Duration = Duration::from_millis(10);

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Grants allowed per rolling minute. Zero is treated as one.
    pub max_per_minute: usize,
    /// Default wait bound used by callers that go through the runtime.
    /// `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Longest single sleep while waiting for a slot.
    pub max_sleep_step: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 10,
            acquire_timeout: Some(Duration::from_secs(120)),
            max_sleep_step: Duration::from_millis(250),
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_per_minute(mut self, max: usize) -> Self {
        self.max_per_minute = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_sleep_step(mut self, step: Duration) -> Self {
        self.max_sleep_step = step;
        self
    }
}

/// Thread-safe sliding-window rate limiter.
///
/// # Example
///
/// ```ignore
/// let limiter = RateLimiter::new(RateLimitConfig::default().with_max_per_minute(5));
/// if limiter.acquire(Some(Duration::from_secs(30))).await {
///     // call the service
/// }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    max_per_minute: usize,
    max_sleep_step: Duration,
    /// Grant timestamps, oldest first.
    grants: Mutex<VecDeque<Duration>>,
    clock: Arc<dyn Clock>,
}

/// Outcome of one locked attempt.
enum Attempt {
    Granted,
    Wait(Duration),
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let max_per_minute = config.max_per_minute.max(1);
        if config.max_per_minute == 0 {
            warn!("max_per_minute of 0 clamped to 1");
        }
        Self {
            max_per_minute,
            max_sleep_step: config.max_sleep_step.max(Duration::from_millis(1)),
            grants: Mutex::new(VecDeque::with_capacity(max_per_minute)),
            clock,
        }
    }

    pub fn max_per_minute(&self) -> usize {
        self.max_per_minute
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn grants(&self) -> MutexGuard<'_, VecDeque<Duration>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop grants that have left the window.
    fn prune(grants: &mut VecDeque<Duration>, now: Duration) {
        while let Some(&oldest) = grants.front() {
            if now.saturating_sub(oldest) >= WINDOW {
                grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn attempt(&self) -> Attempt {
        let now = self.clock.now();
        let mut grants = self.grants();
        Self::prune(&mut grants, now);
        if grants.len() < self.max_per_minute {
            grants.push_back(now);
            trace!("Rate limit slot granted ({}/{})", grants.len(), self.max_per_minute);
            return Attempt::Granted;
        }
        let oldest = grants.front().copied().unwrap_or(now);
        Attempt::Wait((oldest + WINDOW).saturating_sub(now) + EPSILON)
    }

    /// Grant a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        matches!(self.attempt(), Attempt::Granted)
    }

    /// Wait for a slot. `None` waits indefinitely.
    ///
    /// Returns `false` once `timeout` has elapsed without a grant.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        match self.acquire_interruptible(timeout, &NoInterrupt).await {
            Ok(granted) => granted,
            Err(_) => false,
        }
    }

    /// Like [`acquire`](Self::acquire), checking `signal` before every sleep.
    pub async fn acquire_interruptible(
        &self,
        timeout: Option<Duration>,
        signal: &dyn InterruptSignal,
    ) -> Result<bool, Interrupted> {
        let deadline = Deadline::after(self.clock.as_ref(), timeout);
        let mut logged = false;
        loop {
            let wait = match self.attempt() {
                Attempt::Granted => return Ok(true),
                Attempt::Wait(wait) => wait,
            };
            if deadline.is_expired(self.clock.as_ref()) {
                debug!("Rate limit acquire timed out");
                return Ok(false);
            }
            signal.check()?;
            if !logged {
                debug!(
                    "Rate limit reached ({}/min), waiting up to {:.1}s for a slot",
                    self.max_per_minute,
                    wait.as_secs_f64()
                );
                logged = true;
            }
            let step = deadline.clamp(self.clock.as_ref(), wait.min(self.max_sleep_step));
            self.clock.sleep(step).await;
        }
    }

    /// Slots free in the current window.
    pub fn available(&self) -> usize {
        let now = self.clock.now();
        let mut grants = self.grants();
        Self::prune(&mut grants, now);
        self.max_per_minute.saturating_sub(grants.len())
    }

    /// Forget every recorded grant. Safe while others are waiting.
    pub fn reset(&self) {
        self.grants().clear();
        debug!("Rate limiter reset");
    }
}
