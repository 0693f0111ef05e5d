//! Error classification and rate-limited retry for the generation service.
//!
//! Retries transient failures (429, 5xx, connect/timeout errors) with
//! exponential backoff and jitter. Client errors, policy rejections and
//! invalid input fail on the first attempt. Every attempt, retries included,
//! takes a fresh slot from the [`RateLimiter`].

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::rate_limit::RateLimiter;
use crate::agent::interrupt::{InterruptSignal, Interrupted};

/// How failed generations are retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first; each takes its own limiter slot.
    pub max_retries: u32,
    /// Pause after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single pause.
    pub max_delay: Duration,
    /// Growth of the pause per failed attempt.
    pub multiplier: f64,
    /// Shorten pauses by a per-attempt factor so workers retrying the same
    /// outage drift apart.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default backoff with the given number of retries.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pause before retry `attempt`, counted from 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let mut secs = grown.min(self.max_delay.as_secs_f64());
        if self.jitter {
            secs *= JITTER[attempt as usize % JITTER.len()];
        }
        Duration::from_secs_f64(secs)
    }
}

/// Fixed shrink factors cycled by attempt number, so backoff stays
/// reproducible in tests.
const JITTER: [f64; 4] = [0.8, 0.65, 0.9, 0.7];

/// Failure of one call to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection, DNS or timeout failure before a response arrived.
    #[error("request failed: {0}")]
    Transport(String),

    /// The service refused the content.
    #[error("rejected by content policy: {0}")]
    Policy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No rate-limit slot within the wait bound.
    #[error("timed out after {}s waiting for a rate-limit slot", .0.as_secs())]
    RateLimitTimeout(Duration),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("{0}")]
    Other(String),
}

impl GenerationError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// 429 and 5xx responses and transport failures are retryable. A
    /// rate-limit wait timeout is not: the limiter already waited.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Transport(_) => true,
            Self::Policy(_)
            | Self::InvalidInput(_)
            | Self::RateLimitTimeout(_)
            | Self::Interrupted(_)
            | Self::Other(_) => false,
        }
    }

    /// The interrupt carried by this error, if any.
    pub fn as_interrupt(&self) -> Option<&Interrupted> {
        match self {
            Self::Interrupted(interrupt) => Some(interrupt),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::http(status.as_u16(), e.to_string()),
            None if e.is_builder() => Self::InvalidInput(e.to_string()),
            None if e.is_decode() => Self::Other(e.to_string()),
            None => Self::Transport(e.to_string()),
        }
    }
}

/// Run `op` behind the limiter, retrying transient failures.
///
/// Each attempt first checks `signal`, then waits up to `acquire_timeout`
/// for a slot. A missed slot fails with
/// [`GenerationError::RateLimitTimeout`]; an interrupt fails with
/// [`GenerationError::Interrupted`].
pub async fn retry_rate_limited<T, F, Fut>(
    limiter: &RateLimiter,
    config: &RetryConfig,
    acquire_timeout: Option<Duration>,
    signal: &dyn InterruptSignal,
    mut op: F,
) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let mut attempt = 0u32;
    loop {
        signal.check()?;
        if !limiter.acquire_interruptible(acquire_timeout, signal).await? {
            return Err(GenerationError::RateLimitTimeout(
                acquire_timeout.unwrap_or_default(),
            ));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    "Generation attempt {attempt} failed ({e}), retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                limiter.clock().sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::interrupt::{InterruptAction, NoInterrupt};
    use crate::agent::job::JobHandle;
    use crate::api::rate_limit::RateLimitConfig;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(max: usize) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig::default().with_max_per_minute(max);
        (RateLimiter::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn delay_increases_and_caps() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(4),
            ..RetryConfig::with_retries(10)
        };
        assert!(config.delay_for_attempt(1) > config.delay_for_attempt(0));
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(4));
    }

    #[test]
    fn jittered_backoff_is_reproducible() {
        let config = RetryConfig::with_retries(3);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1300));
        assert_eq!(config.delay_for_attempt(1), config.delay_for_attempt(1));
    }

    #[test]
    fn jitter_never_lengthens_delay() {
        let jittered = RetryConfig::with_retries(3);
        let plain = RetryConfig::with_retries(3).with_jitter(false);
        for attempt in 0..4 {
            assert!(jittered.delay_for_attempt(attempt) <= plain.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(GenerationError::http(429, "slow down").is_retryable());
        assert!(GenerationError::http(503, "unavailable").is_retryable());
        assert!(GenerationError::Transport("connection reset".into()).is_retryable());

        assert!(!GenerationError::http(400, "bad request").is_retryable());
        assert!(!GenerationError::http(401, "unauthorized").is_retryable());
        assert!(!GenerationError::Policy("nsfw".into()).is_retryable());
        assert!(!GenerationError::InvalidInput("empty prompt".into()).is_retryable());
        assert!(!GenerationError::RateLimitTimeout(Duration::from_secs(1)).is_retryable());
    }

    #[tokio::test]
    async fn each_attempt_consumes_a_slot() {
        let (limiter, _) = limiter(10);
        let calls = AtomicU32::new(0);
        let config = RetryConfig::with_retries(3);

        let result = retry_rate_limited(&limiter, &config, None, &NoInterrupt, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GenerationError::http(502, "bad gateway"))
                } else {
                    Ok("artifact.png")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("artifact.png"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.available(), 7);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let (limiter, _) = limiter(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> =
            retry_rate_limited(&limiter, &RetryConfig::with_retries(5), None, &NoInterrupt, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GenerationError::http(422, "unprocessable")) }
            })
            .await;

        assert_eq!(result, Err(GenerationError::http(422, "unprocessable")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.available(), 9);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (limiter, clock) = limiter(10);
        let calls = AtomicU32::new(0);
        let config = RetryConfig::with_retries(2).with_jitter(false);

        let result: Result<(), _> = retry_rate_limited(&limiter, &config, None, &NoInterrupt, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GenerationError::http(429, "too many requests")) }
        })
        .await;

        assert!(matches!(result, Err(GenerationError::Http { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff.
        assert!(clock.now() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn exhausted_limiter_reports_timeout() {
        let (limiter, _) = limiter(1);
        assert!(limiter.try_acquire());

        let result: Result<(), _> = retry_rate_limited(
            &limiter,
            &RetryConfig::default(),
            Some(Duration::from_secs(5)),
            &NoInterrupt,
            || async { Ok(()) },
        )
        .await;

        assert_eq!(
            result,
            Err(GenerationError::RateLimitTimeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test]
    async fn interrupt_stops_before_calling() {
        let (limiter, _) = limiter(10);
        let job = JobHandle::new("run-1", "campaign");
        job.request_interrupt(InterruptAction::Redirect, Some("new brief".into()));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> =
            retry_rate_limited(&limiter, &RetryConfig::default(), None, &job, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.as_interrupt().map(|i| i.action),
            Some(InterruptAction::Redirect)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.available(), 10);
    }
}
