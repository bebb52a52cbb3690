//! Per-source token buckets and request jitter.
//!
//! Each source gets its own bucket holding up to `burst` tokens, refilled
//! continuously at `requests_per_second`. [`RateLimiter::acquire`] waits
//! until a token is available and never fails. Buckets are created lazily
//! and guarded by their own async mutex, so sources never contend with each
//! other.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitProfile {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitProfile {
    fn default() -> Self {
        Self {
            requests_per_second: 1.5,
            burst: 3,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    profile: RateLimitProfile,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(profile: RateLimitProfile) -> Self {
        Self {
            profile,
            tokens: f64::from(profile.burst),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.profile.requests_per_second)
            .min(f64::from(self.profile.burst));
        self.last_refill = now;
    }

    /// Take a token if one is available, otherwise report how long until one is.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::try_from_secs_f64(missing / self.profile.requests_per_second)
                .unwrap_or(Duration::MAX))
        }
    }
}

pub struct RateLimiter {
    default_profile: RateLimitProfile,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    pub fn new(default_profile: RateLimitProfile) -> Self {
        Self {
            default_profile,
            buckets: DashMap::new(),
        }
    }

    /// Install (or replace) the bucket for `source` with its own profile.
    pub fn configure(&self, source: &str, profile: RateLimitProfile) {
        self.buckets
            .insert(source.to_string(), Arc::new(Mutex::new(Bucket::new(profile))));
    }

    fn bucket(&self, source: &str) -> Arc<Mutex<Bucket>> {
        self.buckets
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(self.default_profile))))
            .clone()
    }

    /// Wait for admission. Returns how long the caller was held back.
    pub async fn acquire(&self, source: &str) -> Duration {
        let bucket = self.bucket(source);
        let started = Instant::now();
        // Holding the bucket lock while sleeping queues waiters in FIFO order.
        let mut guard = bucket.lock().await;
        loop {
            match guard.try_take(Instant::now()) {
                Ok(()) => break,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
        drop(guard);
        let waited = started.elapsed();
        if !waited.is_zero() {
            tracing::debug!(source, waited_ms = waited.as_millis() as u64, "rate limiter held request");
        }
        waited
    }
}

/// Uniform random delay applied before each admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    pub min: Duration,
    pub max: Duration,
}

impl Jitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(ms.min(u64::MAX as u128) as u64)
    }

    pub async fn wait(&self) -> Duration {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_steady_rate() {
        let limiter = RateLimiter::new(RateLimitProfile {
            requests_per_second: 2.0,
            burst: 3,
        });
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("alpha").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Fourth and fifth admissions wait one refill interval each.
        limiter.acquire("alpha").await;
        limiter.acquire("alpha").await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_never_exceed_burst_plus_rate() {
        let limiter = Arc::new(RateLimiter::new(RateLimitProfile {
            requests_per_second: 1.5,
            burst: 3,
        }));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("alpha").await;
                Instant::now()
            }));
        }
        let mut admitted = Vec::new();
        for h in handles {
            admitted.push(h.await.unwrap().duration_since(start).as_secs_f64());
        }
        // For every window [0, t], admissions <= burst + rate * t.
        admitted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (i, t) in admitted.iter().enumerate() {
            let allowed = 3.0 + 1.5 * t + 1e-6;
            assert!((i + 1) as f64 <= allowed, "admission {} at {t}s", i + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_reports_saturated_wait() {
        let mut bucket = Bucket::new(RateLimitProfile {
            requests_per_second: 1e-300,
            burst: 1,
        });
        let now = Instant::now();
        assert_eq!(bucket.try_take(now), Ok(()));
        assert_eq!(bucket.try_take(now), Err(Duration::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_independent() {
        let limiter = RateLimiter::new(RateLimitProfile {
            requests_per_second: 1.0,
            burst: 1,
        });
        let start = Instant::now();
        limiter.acquire("alpha").await;
        limiter.acquire("beta").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_overrides_profile() {
        let limiter = RateLimiter::new(RateLimitProfile {
            requests_per_second: 1.0,
            burst: 1,
        });
        limiter.configure(
            "fast",
            RateLimitProfile {
                requests_per_second: 10.0,
                burst: 5,
            },
        );
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("fast").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_jitter_within_window() {
        let jitter = Jitter::new(Duration::from_millis(500), Duration::from_millis(2000));
        for _ in 0..200 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(2000));
        }
        assert_eq!(Jitter::none().sample(), Duration::ZERO);
    }
}
