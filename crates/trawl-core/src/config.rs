use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::models::Source;
use crate::rate_limit::{RateLimit, RateLimiter};
use crate::retry::RetryPolicy;

/// Everything the engine needs to know before a run starts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers per run.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Bucket shapes for sources that need their own pacing.
    pub rate_limits: HashMap<Source, RateLimit>,
    /// Bucket shape for every other source.
    pub default_rate_limit: RateLimit,
    /// Longest a job may queue for a rate-limit token before it counts as throttled.
    pub max_queue_time: Duration,
    /// Upper bound on a single extractor call.
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            rate_limits: default_rate_limits(),
            default_rate_limit: RateLimit::new(2, Duration::from_secs(1)),
            max_queue_time: Duration::from_secs(60),
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// Pacing per platform. Instagram and LinkedIn block aggressive clients
/// quickly; news feeds tolerate bursts.
fn default_rate_limits() -> HashMap<Source, RateLimit> {
    HashMap::from([
        (Source::Instagram, RateLimit::new(2, Duration::from_secs(3))),
        (Source::TikTok, RateLimit::new(2, Duration::from_secs(2))),
        (Source::Shopee, RateLimit::new(4, Duration::from_secs(1))),
        (Source::LinkedIn, RateLimit::new(1, Duration::from_millis(1800))),
        (Source::PlayStore, RateLimit::new(4, Duration::from_secs(1))),
        (Source::GoogleMaps, RateLimit::new(2, Duration::from_secs(2))),
        (Source::GoogleNews, RateLimit::new(5, Duration::from_secs(1))),
        (Source::GoogleJobs, RateLimit::new(5, Duration::from_secs(1))),
    ])
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, source: Source, limit: RateLimit) -> Self {
        self.rate_limits.insert(source, limit);
        self
    }

    pub fn with_default_rate_limit(mut self, limit: RateLimit) -> Self {
        self.default_rate_limit = limit;
        self
    }

    pub fn with_max_queue_time(mut self, max_queue_time: Duration) -> Self {
        self.max_queue_time = max_queue_time;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Rejects configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.workers == 0 {
            return Err(AppError::ConfigError(
                "Worker pool size must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.unknown_max_attempts == 0 {
            return Err(AppError::ConfigError(
                "Retry max attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(AppError::ConfigError(format!(
                "Retry base delay ({}ms) exceeds the cap ({}ms)",
                self.retry.base_delay.as_millis(),
                self.retry.max_delay.as_millis()
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "Per-call timeout must be non-zero".into(),
            ));
        }
        self.default_rate_limit.validate()?;
        for (source, limit) in &self.rate_limits {
            limit
                .validate()
                .map_err(|e| AppError::ConfigError(format!("{source}: {e}")))?;
        }
        Ok(())
    }

    /// Builds the rate limiter described by this configuration.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.default_rate_limit, self.max_queue_time)
            .with_limits(&self.rate_limits)
    }

    /// Read configuration from environment variables, starting from the
    /// defaults.
    ///
    /// - `TRAWL_WORKERS`
    /// - `TRAWL_MAX_ATTEMPTS`
    /// - `TRAWL_UNKNOWN_MAX_ATTEMPTS`
    /// - `TRAWL_RETRY_BASE_MS`
    /// - `TRAWL_RETRY_CAP_MS`
    /// - `TRAWL_CALL_TIMEOUT_SECS`
    /// - `TRAWL_MAX_QUEUE_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(workers) = parse_var(&lookup, "TRAWL_WORKERS")? {
            config.workers = workers;
        }
        if let Some(n) = parse_var(&lookup, "TRAWL_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(n) = parse_var(&lookup, "TRAWL_UNKNOWN_MAX_ATTEMPTS")? {
            config.retry.unknown_max_attempts = n;
        }
        if let Some(ms) = parse_var(&lookup, "TRAWL_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "TRAWL_RETRY_CAP_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "TRAWL_CALL_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "TRAWL_MAX_QUEUE_SECS")? {
            config.max_queue_time = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
        }),
    }
}
