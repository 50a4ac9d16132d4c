//! Timing policy for the dispatch queue.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use fleetdrop::dispatch::{BusyRetryPolicy, DispatchConfig};
//!
//! let config = DispatchConfig::default()
//!     .with_job_timeout(Duration::from_secs(120))
//!     .with_busy_retry(BusyRetryPolicy::new(5, Duration::from_secs(2)));
//! ```

use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Seconds a dispatched command may run before it is declared timed out.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;

/// Base delay for busy retries; the n-th retry waits n times this.
pub const DEFAULT_BUSY_RETRY_DELAY_SECS: u64 = 4;

/// Busy retries allowed before a job fails.
pub const DEFAULT_MAX_BUSY_RETRIES: u32 = 3;

/// Prefix for minted correlation ids.
pub const DEFAULT_CORRELATION_PREFIX: &str = "fleetdrop";

// =============================================================================
// Busy Retry Policy
// =============================================================================

/// Linear backoff for endpoints that report themselves busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl BusyRetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that fails on the first busy reply.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        Some(self.base_delay.saturating_mul(retry))
    }
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_BUSY_RETRIES,
            Duration::from_secs(DEFAULT_BUSY_RETRY_DELAY_SECS),
        )
    }
}

// =============================================================================
// Dispatch Config
// =============================================================================

/// Settings for one dispatch domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub job_timeout: Duration,
    pub busy_retry: BusyRetryPolicy,
    pub correlation_prefix: String,
}

impl DispatchConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_busy_retry(mut self, policy: BusyRetryPolicy) -> Self {
        self.busy_retry = policy;
        self
    }

    pub fn with_correlation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.correlation_prefix = prefix.into();
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            busy_retry: BusyRetryPolicy::default(),
            correlation_prefix: DEFAULT_CORRELATION_PREFIX.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_delays() {
        let policy = BusyRetryPolicy::default();
        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_retry(2), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for_retry(3), Some(Duration::from_secs(12)));
        assert_eq!(policy.delay_for_retry(4), None);
        assert_eq!(policy.delay_for_retry(0), None);
    }

    #[test]
    fn test_none_policy_never_retries() {
        assert_eq!(BusyRetryPolicy::none().delay_for_retry(1), None);
    }

    #[test]
    fn test_config_builder() {
        let config = DispatchConfig::default()
            .with_job_timeout(Duration::from_secs(10))
            .with_correlation_prefix("stfdeploy");
        assert_eq!(config.job_timeout, Duration::from_secs(10));
        assert_eq!(config.correlation_prefix, "stfdeploy");
        assert_eq!(config.busy_retry, BusyRetryPolicy::default());
    }

    proptest! {
        #[test]
        fn prop_retry_count_bounded(max in 0u32..10, base in 1u64..60) {
            let policy = BusyRetryPolicy::new(max, Duration::from_secs(base));
            let allowed = (1..=20).filter(|r| policy.delay_for_retry(*r).is_some()).count();
            prop_assert_eq!(allowed as u32, max);
        }

        #[test]
        fn prop_delay_is_linear(max in 1u32..10, base in 1u64..60, retry in 1u32..10) {
            let policy = BusyRetryPolicy::new(max, Duration::from_secs(base));
            if let Some(delay) = policy.delay_for_retry(retry) {
                prop_assert_eq!(delay, Duration::from_secs(base * retry as u64));
                prop_assert!(retry <= max);
            }
        }
    }
}
