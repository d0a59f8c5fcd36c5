//! Per-source token buckets for polite fetching.
//!
//! Each source gets a GCRA limiter that allows bursts of `capacity` calls
//! and regains one slot every `refill_interval`. Slots come back on the
//! clock, not on release, so bursts are smoothed regardless of how long
//! calls take.
//!
//! A caller that finds its source exhausted sleeps until the next slot is
//! due and tries again. When the next slot, plus one interval for every
//! caller already waiting, lies beyond the configured max queue time,
//! [`RateLimiter::acquire`] fails with [`AppError::Throttled`] instead of
//! blocking. Nothing is reserved while waiting, so a caller that gives up
//! (its future is dropped) costs the others nothing.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trawl_core::models::Source;
//! use trawl_core::rate_limit::{RateLimit, RateLimiter};
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! let limiter = RateLimiter::new(RateLimit::new(2, Duration::from_secs(1)), Duration::from_secs(30))
//!     .with_limit(Source::Instagram, RateLimit::new(1, Duration::from_secs(3)));
//! let permit = limiter.acquire(Source::Instagram).await?;
//! println!("waited {:?}", permit.waited());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::Source;

/// Bucket shape for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Largest burst allowed after an idle period.
    pub capacity: u32,
    /// Time to regain one token.
    pub refill_interval: Duration,
}

impl RateLimit {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.capacity == 0 {
            return Err(AppError::ConfigError(
                "Rate limit capacity must be at least 1".into(),
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(AppError::ConfigError(
                "Rate limit refill interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn quota(&self) -> Quota {
        // Degenerate shapes are rejected by `validate`; fall back to one
        // call per second rather than panic if one slips through.
        let burst = NonZeroU32::new(self.capacity).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(self.refill_interval)
            .map_or_else(|| Quota::per_second(NonZeroU32::MIN), |q| q.allow_burst(burst))
    }
}

/// Governor clock over Tokio's time source, so limiter waits follow
/// `tokio::time::pause` in tests.
#[derive(Debug, Clone)]
struct TokioClock {
    origin: Instant,
}

impl Clock for TokioClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.origin.elapsed())
    }
}

type SourceGovernor = GovernorRateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Nanos>>;

struct Bucket {
    limit: RateLimit,
    clock: TokioClock,
    governor: SourceGovernor,
    /// Callers currently sleeping on this bucket.
    waiting: AtomicUsize,
}

impl Bucket {
    fn new(limit: RateLimit) -> Self {
        let clock = TokioClock {
            origin: Instant::now(),
        };
        Self {
            limit,
            governor: GovernorRateLimiter::direct_with_clock(limit.quota(), clock.clone()),
            clock,
            waiting: AtomicUsize::new(0),
        }
    }

    /// `None` when a slot was taken, otherwise how long until the next one.
    fn try_take(&self) -> Option<Duration> {
        match self.governor.check() {
            Ok(()) => None,
            Err(not_until) => Some(not_until.wait_time_from(self.clock.now())),
        }
    }
}

/// Marks one caller as waiting on a bucket for as long as it lives.
struct WaitSlot<'a>(&'a AtomicUsize);

impl<'a> WaitSlot<'a> {
    fn join(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof that a request slot was granted. Dropping it releases nothing:
/// slots come back on the refill clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePermit {
    waited: Duration,
}

impl RatePermit {
    /// Time spent queueing for the slot.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Token buckets keyed by source. Cheap to clone; clones share buckets.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<HashMap<Source, Arc<Bucket>>>,
    max_queue_time: Duration,
}

impl RateLimiter {
    /// Every source starts with `default_limit`.
    pub fn new(default_limit: RateLimit, max_queue_time: Duration) -> Self {
        let buckets = Source::ALL
            .into_iter()
            .map(|source| (source, Arc::new(Bucket::new(default_limit))))
            .collect();
        Self {
            buckets: Arc::new(buckets),
            max_queue_time,
        }
    }

    /// Overrides the bucket shape for one source.
    pub fn with_limit(mut self, source: Source, limit: RateLimit) -> Self {
        Arc::make_mut(&mut self.buckets).insert(source, Arc::new(Bucket::new(limit)));
        self
    }

    pub fn with_limits(self, limits: &HashMap<Source, RateLimit>) -> Self {
        limits
            .iter()
            .fold(self, |limiter, (source, limit)| limiter.with_limit(*source, *limit))
    }

    pub fn limit_for(&self, source: Source) -> Option<RateLimit> {
        self.buckets.get(&source).map(|bucket| bucket.limit)
    }

    /// Waits for a slot from `source`'s bucket.
    ///
    /// No lock is held while waiting, so other sources are never blocked.
    /// Dropping the future abandons the wait without using up a slot.
    pub async fn acquire(&self, source: Source) -> Result<RatePermit, AppError> {
        let Some(bucket) = self.buckets.get(&source) else {
            return Ok(RatePermit {
                waited: Duration::ZERO,
            });
        };

        let start = Instant::now();
        let mut slot = None;
        loop {
            let Some(wait) = bucket.try_take() else {
                return Ok(RatePermit {
                    waited: start.elapsed(),
                });
            };

            if slot.is_none() {
                let ahead = u32::try_from(bucket.waiting.load(Ordering::SeqCst)).unwrap_or(u32::MAX);
                let needed = wait.saturating_add(bucket.limit.refill_interval.saturating_mul(ahead));
                if needed > self.max_queue_time {
                    tracing::warn!(
                        %source,
                        needed_ms = %needed.as_millis(),
                        max_queue_ms = %self.max_queue_time.as_millis(),
                        "Rate limiter queue too long"
                    );
                    return Err(AppError::Throttled {
                        platform: source,
                        waited: needed,
                        max_wait: self.max_queue_time,
                    });
                }
                slot = Some(WaitSlot::join(&bucket.waiting));
            }

            tracing::debug!(%source, sleep_ms = %wait.as_millis(), "Throttling request");
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let limits: HashMap<Source, RateLimit> = self
            .buckets
            .iter()
            .map(|(source, bucket)| (*source, bucket.limit))
            .collect();
        f.debug_struct("RateLimiter")
            .field("limits", &limits)
            .field("max_queue_time", &self.max_queue_time)
            .finish()
    }
}
