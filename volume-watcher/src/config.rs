//! Tunables for the volume watcher.
//!
//! `WatcherConfig` derives `clap::Args` so a host binary can flatten it into
//! its own command line; `Default` matches the command-line defaults.

use std::time::Duration;

use clap::Args;

use crate::error::{Result, WatcherError};

/// Default rate of state store queries while discovering volumes
pub const LIMIT_STATE_QUERIES_PER_SECOND: f64 = 100.0;
/// Tokens the query limiter can bank while idle
pub const QUERY_LIMIT_BURST: u32 = 100;
/// Default window in which claim updates for any volume are coalesced
pub const CROSS_VOLUME_UPDATE_BATCH_DURATION: Duration = Duration::from_millis(250);
/// Default upper bound on a single blocking query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(300);

fn parse_millis(value: &str) -> std::result::Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("invalid duration '{}' (milliseconds): {}", value, e))
}

/// Backoff applied to each step of the unpublish workflow.
///
/// Exhausting the attempts only ends the current pass: the claim stays in
/// the volume's past claims and is retried on the watcher's next wake-up.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct RetryPolicy {
    /// Attempts per unpublish step before giving up until the next wake-up
    #[arg(long = "retry-max-attempts", env = "VOLUME_WATCHER_RETRY_MAX_ATTEMPTS", default_value_t = 4)]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[arg(long = "retry-initial-backoff-ms", env = "VOLUME_WATCHER_RETRY_INITIAL_BACKOFF_MS", value_parser = parse_millis, default_value = "100")]
    pub initial_backoff: Duration,

    /// Cap on the delay between retries, in milliseconds
    #[arg(long = "retry-max-backoff-ms", env = "VOLUME_WATCHER_RETRY_MAX_BACKOFF_MS", value_parser = parse_millis, default_value = "5000")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct WatcherConfig {
    /// Maximum state store queries per second while discovering volumes
    #[arg(long, env = "VOLUME_WATCHER_QUERY_LIMIT", default_value_t = LIMIT_STATE_QUERIES_PER_SECOND)]
    pub query_limit_per_sec: f64,

    /// Window for coalescing claim updates across volumes, in milliseconds
    #[arg(long = "update-batch-ms", env = "VOLUME_WATCHER_UPDATE_BATCH_MS", value_parser = parse_millis, default_value = "250")]
    pub update_batch_duration: Duration,

    /// Upper bound on a single blocking query, in milliseconds
    #[arg(long = "query-timeout-ms", env = "VOLUME_WATCHER_QUERY_TIMEOUT_MS", value_parser = parse_millis, default_value = "300000")]
    pub query_timeout: Duration,

    #[command(flatten)]
    pub retry: RetryPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            query_limit_per_sec: LIMIT_STATE_QUERIES_PER_SECOND,
            update_batch_duration: CROSS_VOLUME_UPDATE_BATCH_DURATION,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.query_limit_per_sec.is_finite() || self.query_limit_per_sec <= 0.0 {
            return Err(WatcherError::InvalidConfig(format!(
                "query limit must be a positive number, got {}",
                self.query_limit_per_sec
            )));
        }
        if self.update_batch_duration.is_zero() {
            return Err(WatcherError::InvalidConfig(
                "update batch duration must be non-zero".to_string(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(WatcherError::InvalidConfig(
                "query timeout must be non-zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(WatcherError::InvalidConfig(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(WatcherError::InvalidConfig(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.retry.initial_backoff, self.retry.max_backoff
            )));
        }
        Ok(())
    }
}
