//! Process-wide admission control for task execution.
//!
//! The worker consults one token bucket before every handler invocation.
//! [`set_rate_limiter`] installs it once per process; later calls are ignored,
//! whatever their arguments. Tests and embedders that need isolation build
//! their own [`RateLimiter`] and hand it to the worker directly.

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

enum Bucket {
    /// Every request is admitted
    Unlimited,
    /// Token bucket refilled at `limit` per second
    Limited(DirectLimiter),
    /// Finite rate with no capacity: nothing is admitted
    Empty,
}

/// Token bucket with a non-blocking `allow` check.
pub struct RateLimiter {
    limit: f64,
    burst: u32,
    bucket: Bucket,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = match self.bucket {
            Bucket::Unlimited => "unlimited",
            Bucket::Limited(_) => "limited",
            Bucket::Empty => "empty",
        };
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("burst", &self.burst)
            .field("bucket", &bucket)
            .finish()
    }
}

impl RateLimiter {
    /// Bucket refilled at `limit` tokens per second holding up to `burst`.
    ///
    /// A zero (or negative) limit admits everything and keeps `burst` only
    /// for reporting.
    pub fn new(limit: f64, burst: u32) -> Self {
        let bucket = if !limit.is_finite() || limit <= 0.0 {
            Bucket::Unlimited
        } else {
            match NonZeroU32::new(burst) {
                None => Bucket::Empty,
                Some(burst) => {
                    let period = Duration::from_secs_f64(1.0 / limit);
                    match Quota::with_period(period) {
                        Some(quota) => Bucket::Limited(governor::RateLimiter::direct(
                            quota.allow_burst(burst),
                        )),
                        // Rates above one token per nanosecond round to "no limit".
                        None => Bucket::Unlimited,
                    }
                }
            }
        };

        Self {
            limit,
            burst,
            bucket,
        }
    }

    /// Limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(0.0, 0)
    }

    /// Take one token if available. Never waits.
    pub fn allow(&self) -> bool {
        match &self.bucket {
            Bucket::Unlimited => true,
            Bucket::Limited(limiter) => limiter.check().is_ok(),
            Bucket::Empty => false,
        }
    }

    /// Configured refill rate (tokens per second).
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Configured bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// True when every request is admitted.
    pub fn is_unlimited(&self) -> bool {
        matches!(self.bucket, Bucket::Unlimited)
    }
}

/// First-writer-wins slot holding a shared limiter.
#[derive(Debug, Default)]
pub struct RateLimiterCell {
    inner: OnceLock<Arc<RateLimiter>>,
}

impl RateLimiterCell {
    /// Create an empty cell.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Install a limiter unless one is already present, and return the one
    /// in effect.
    pub fn set(&self, limit: f64, burst: u32) -> Arc<RateLimiter> {
        let installed = self
            .inner
            .get_or_init(|| Arc::new(RateLimiter::new(limit, burst)))
            .clone();

        if installed.limit() != limit || installed.burst() != burst {
            tracing::debug!(
                limit = installed.limit(),
                burst = installed.burst(),
                ignored_limit = limit,
                ignored_burst = burst,
                "Rate limiter already installed"
            );
        }
        installed
    }

    /// The installed limiter, if any.
    pub fn get(&self) -> Option<Arc<RateLimiter>> {
        self.inner.get().cloned()
    }
}

static GLOBAL: RateLimiterCell = RateLimiterCell::new();

/// Install the process-wide limiter. Only the first call has an effect.
pub fn set_rate_limiter(limit: f64, burst: u32) -> Arc<RateLimiter> {
    GLOBAL.set(limit, burst)
}

/// The process-wide limiter, if [`set_rate_limiter`] has been called.
pub fn rate_limiter() -> Option<Arc<RateLimiter>> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_is_unlimited() {
        let limiter = RateLimiter::new(0.0, 7);
        assert!(limiter.is_unlimited());
        assert_eq!(limiter.burst(), 7);
        assert!((0..1000).all(|_| limiter.allow()));
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = RateLimiter::new(1.0, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_zero_burst_denies_everything() {
        let limiter = RateLimiter::new(10.0, 0);
        assert!(!limiter.allow());
    }

    #[test]
    fn test_refill() {
        let limiter = RateLimiter::new(50.0, 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow());
    }

    #[test]
    fn test_first_writer_wins() {
        let cell = RateLimiterCell::new();
        assert!(cell.get().is_none());

        let first = cell.set(1.0, 1);
        let second = cell.set(100.0, 50);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.limit(), 1.0);
        assert_eq!(second.burst(), 1);
    }

    #[test]
    fn test_concurrent_allow_respects_capacity() {
        let limiter = Arc::new(RateLimiter::new(0.001, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..10).filter(|_| limiter.allow()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }
}
