//! Call discipline for the external generation service.
//!
//! - [`rate_limit`]: sliding-window [`RateLimiter`] bounding calls to N per
//!   rolling minute, with a pluggable clock.
//! - [`retry`]: [`GenerationError`] classification (429/5xx/transport are
//!   retryable) and [`retry_rate_limited`], which takes a fresh slot for every
//!   attempt.

pub mod rate_limit;
pub mod retry;

pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{GenerationError, RetryConfig, retry_rate_limited};
