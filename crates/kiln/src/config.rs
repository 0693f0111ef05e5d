//! Aggregate configuration for a [`GenerationRuntime`](crate::runtime::GenerationRuntime).
//!
//! Each component owns its config struct; `RuntimeConfig` only bundles them
//! so the binary and tests can build a whole runtime from one value.
//!
//! ```ignore
//! let config = RuntimeConfig::default()
//!     .with_rate_limit(RateLimitConfig::default().with_max_per_minute(30))
//!     .with_pool(PoolConfig::default().with_workers(8));
//! ```

use std::time::Duration;

use crate::agent::approval::ApprovalConfig;
use crate::api::rate_limit::RateLimitConfig;
use crate::api::retry::RetryConfig;
use crate::context::budget::ContextBudgetConfig;
use crate::generation::pool::PoolConfig;

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub rate_limit: RateLimitConfig,
    pub pool: PoolConfig,
    pub approval: ApprovalConfig,
    /// Backoff between generation attempts. Every attempt takes its own
    /// rate-limit slot.
    pub retry: RetryConfig,
    pub context: ContextBudgetConfig,
}

impl RuntimeConfig {
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn with_approval(mut self, config: ApprovalConfig) -> Self {
        self.approval = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_context(mut self, config: ContextBudgetConfig) -> Self {
        self.context = config;
        self
    }

    /// Shorthand for the two knobs most deployments touch.
    pub fn with_limits(mut self, max_per_minute: usize, workers: usize) -> Self {
        self.rate_limit = self.rate_limit.with_max_per_minute(max_per_minute);
        self.pool = self.pool.with_workers(workers);
        self
    }

    /// How long a generation attempt may wait for a rate-limit slot.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.rate_limit.acquire_timeout
    }

    /// One-line summary for startup logs.
    pub fn to_log_string(&self) -> String {
        format!(
            "{}/min, {} workers, approval timeout {}s, {} retries, context {} tokens",
            self.rate_limit.max_per_minute,
            self.pool.workers,
            self.approval.timeout.as_secs(),
            self.retry.max_retries,
            self.context.available(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_components() {
        let config = RuntimeConfig::default();
        assert_eq!(config.rate_limit.max_per_minute, 10);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.approval.timeout, Duration::from_secs(300));
        assert_eq!(config.acquire_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn builders_replace_sections() {
        let config = RuntimeConfig::default()
            .with_limits(30, 8)
            .with_approval(ApprovalConfig::default().with_timeout(Duration::from_secs(5)))
            .with_retry(RetryConfig::with_retries(0));
        assert_eq!(config.rate_limit.max_per_minute, 30);
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.approval.timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 0);
        let line = config.to_log_string();
        assert!(line.starts_with("30/min, 8 workers, approval timeout 5s, 0 retries"), "{line}");
    }
}
