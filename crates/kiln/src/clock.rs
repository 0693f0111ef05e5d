//! Pluggable monotonic time for every wait loop in the crate.
//!
//! The rate limiter, approval gate, ticket waits and run loop all measure
//! deadlines and sleep through a [`Clock`]. Production code uses
//! [`SystemClock`]; tests use [`ManualClock`], whose `sleep` advances virtual
//! time instantly so a 60-second window can elapse in microseconds.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Boxed future returned by [`Clock::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Monotonic time source with an injectable sleep.
///
/// `now()` is an offset from an arbitrary origin fixed at construction. It
/// never goes backwards and is unaffected by wall-clock adjustments.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Elapsed monotonic time since the clock's origin.
    fn now(&self) -> Duration;

    /// Suspend the caller for `duration`.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Real time, backed by [`Instant`] and `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// A shareable system clock.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual time for deterministic tests.
///
/// `sleep(d)` advances the clock by `d` and yields once to the scheduler, so
/// concurrent tasks still interleave while no real time passes.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(async move {
            self.advance(duration);
            tokio::task::yield_now().await;
        })
    }
}

/// A point in monotonic time after which a wait gives up.
///
/// `None` means "wait forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Duration>);

impl Deadline {
    /// Deadline `timeout` from the clock's current time.
    pub fn after(clock: &dyn Clock, timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| clock.now().saturating_add(t)))
    }

    pub fn never() -> Self {
        Self(None)
    }

    /// Time left before expiry; `None` for an unbounded deadline.
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.0.map(|at| at.saturating_sub(clock.now()))
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        self.0.is_some_and(|at| clock.now() >= at)
    }

    /// Clamp a desired sleep so it never overshoots the deadline.
    pub fn clamp(&self, clock: &dyn Clock, step: Duration) -> Duration {
        match self.remaining(clock) {
            Some(left) => step.min(left),
            None => step,
        }
    }
}
