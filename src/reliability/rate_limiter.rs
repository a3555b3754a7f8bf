//! Per-venue token-bucket rate limiting with exponential backoff.
//!
//! Each venue gets a bucket refilled by wall-clock delta. Non-critical
//! callers wait for refill; critical callers (order placement, cancels)
//! sleep through an exponential backoff with jitter so a saturated venue
//! is not hammered by retries.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::config::ReliabilityConfig;
use crate::venue::VenueId;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[derive(Debug)]
struct Backoff {
    attempts: u32,
}

const BACKOFF_BASE_DELAY: f64 = 1.0;
const BACKOFF_MAX_DELAY: f64 = 60.0;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_JITTER_FACTOR: f64 = 0.1;

impl Backoff {
    fn new() -> Self {
        Self { attempts: 0 }
    }

    fn delay(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        let delay = (BACKOFF_BASE_DELAY * BACKOFF_MULTIPLIER.powi(self.attempts as i32 - 1))
            .min(BACKOFF_MAX_DELAY);
        let jitter = delay * BACKOFF_JITTER_FACTOR * (jitter_unit() - 0.5);
        (delay + jitter).max(0.0)
    }
}

/// Cheap uniform-ish value in [0, 1) from the subsecond clock; enough to
/// de-synchronize retry herds without a PRNG dependency.
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Built-in conservative limits for well-known venues; anything else uses
/// the configured defaults.
fn builtin_limit(venue: &str) -> Option<(f64, f64)> {
    let known: [(&str, f64, f64); 5] = [
        ("binance", 1200.0, 20.0),
        ("bybit", 600.0, 10.0),
        ("okx", 300.0, 5.0),
        ("kraken", 60.0, 1.0),
        ("coinbase", 100.0, 10.0),
    ];
    known
        .iter()
        .find(|(prefix, _, _)| venue.starts_with(prefix))
        .map(|(_, capacity, refill)| (*capacity, *refill))
}

/// Point-in-time view of one venue's bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub venue: VenueId,
    pub tokens_available: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub utilization: f64,
}

/// Per-venue token buckets with backoff for critical calls.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    default_capacity: f64,
    default_refill: f64,
    overrides: HashMap<String, (f64, f64)>,
    buckets: Mutex<HashMap<VenueId, Bucket>>,
    backoffs: Mutex<HashMap<VenueId, Backoff>>,
}

impl RateLimiter {
    pub fn new(config: &ReliabilityConfig) -> Self {
        let overrides = config
            .venue_rate_limits
            .iter()
            .map(|(venue, limit)| {
                (
                    venue.clone(),
                    (limit.capacity as f64, limit.refill_rate),
                )
            })
            .collect();
        Self {
            enabled: config.rate_limiting_enabled,
            default_capacity: config.default_rate_capacity as f64,
            default_refill: config.default_rate_refill,
            overrides,
            buckets: Mutex::new(HashMap::new()),
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    fn limits_for(&self, venue: &VenueId) -> (f64, f64) {
        if let Some(&limits) = self.overrides.get(venue.as_str()) {
            return limits;
        }
        builtin_limit(venue.as_str()).unwrap_or((self.default_capacity, self.default_refill))
    }

    /// Non-blocking acquire: refill, take tokens if available.
    pub fn try_acquire(&self, venue: &VenueId, tokens: u32) -> bool {
        if !self.enabled {
            return true;
        }
        let needed = tokens as f64;
        let mut buckets = self.buckets.lock().expect("bucket lock");
        let (capacity, refill) = self.limits_for(venue);
        let bucket = buckets
            .entry(venue.clone())
            .or_insert_with(|| Bucket::new(capacity, refill));
        bucket.refill();
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Acquire tokens, waiting until `timeout` expires.
    ///
    /// Critical callers sleep through the venue's exponential backoff
    /// (attempts reset on success); non-critical callers wait for the
    /// bucket to refill, at most one second per retry. No lock is held
    /// across a sleep.
    pub async fn acquire(
        &self,
        venue: &VenueId,
        tokens: u32,
        critical: bool,
        timeout: Duration,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        let start = Instant::now();
        loop {
            if self.try_acquire(venue, tokens) {
                if critical {
                    self.backoffs
                        .lock()
                        .expect("backoff lock")
                        .entry(venue.clone())
                        .or_insert_with(Backoff::new)
                        .attempts = 0;
                }
                return true;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(
                    venue = %venue,
                    tokens,
                    timeout_secs = timeout.as_secs_f64(),
                    "failed to acquire rate-limit tokens within timeout"
                );
                return false;
            }

            let delay_secs = if critical {
                let mut backoffs = self.backoffs.lock().expect("backoff lock");
                let backoff = backoffs.entry(venue.clone()).or_insert_with(Backoff::new);
                backoff.attempts += 1;
                let delay = backoff.delay();
                debug!(
                    venue = %venue,
                    attempt = backoff.attempts,
                    delay_secs = delay,
                    "rate limited, backing off"
                );
                delay
            } else {
                let (_, refill) = self.limits_for(venue);
                (tokens as f64 / refill).min(1.0)
            };

            let remaining = timeout - elapsed;
            sleep(Duration::from_secs_f64(delay_secs.max(0.01)).min(remaining)).await;
        }
    }

    pub fn snapshot(&self, venue: &VenueId) -> BucketSnapshot {
        let mut buckets = self.buckets.lock().expect("bucket lock");
        let (capacity, refill) = self.limits_for(venue);
        let bucket = buckets
            .entry(venue.clone())
            .or_insert_with(|| Bucket::new(capacity, refill));
        bucket.refill();
        BucketSnapshot {
            venue: venue.clone(),
            tokens_available: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
            utilization: if bucket.capacity > 0.0 {
                1.0 - bucket.tokens / bucket.capacity
            } else {
                0.0
            },
        }
    }

    pub fn snapshots(&self) -> Vec<BucketSnapshot> {
        let venues: Vec<VenueId> = self
            .buckets
            .lock()
            .expect("bucket lock")
            .keys()
            .cloned()
            .collect();
        venues.iter().map(|v| self.snapshot(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueRateLimit;

    fn limiter_with(venue: &str, capacity: u32, refill: f64) -> RateLimiter {
        let mut config = ReliabilityConfig::default();
        config.venue_rate_limits.insert(
            venue.to_string(),
            VenueRateLimit {
                capacity,
                refill_rate: refill,
            },
        );
        RateLimiter::new(&config)
    }

    #[test]
    fn test_try_acquire_within_capacity() {
        let limiter = limiter_with("v1", 5, 0.0001);
        let venue = VenueId::from("v1");
        for _ in 0..5 {
            assert!(limiter.try_acquire(&venue, 1));
        }
        assert!(!limiter.try_acquire(&venue, 1));
    }

    #[test]
    fn test_bucket_invariant_holds() {
        let limiter = limiter_with("v1", 10, 1000.0);
        let venue = VenueId::from("v1");
        limiter.try_acquire(&venue, 7);
        let snap = limiter.snapshot(&venue);
        assert!(snap.tokens_available >= 0.0);
        assert!(snap.tokens_available <= snap.capacity);
    }

    #[test]
    fn test_snapshot_utilization() {
        let limiter = limiter_with("v1", 10, 0.0001);
        let venue = VenueId::from("v1");
        assert!(limiter.try_acquire(&venue, 5));
        let snap = limiter.snapshot(&venue);
        assert!((snap.utilization - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_builtin_limits_apply() {
        let limiter = RateLimiter::new(&ReliabilityConfig::default());
        let snap = limiter.snapshot(&VenueId::from("binance_perpetual"));
        assert_eq!(snap.capacity, 1200.0);
        assert_eq!(snap.refill_rate, 20.0);
    }

    #[test]
    fn test_disabled_limiter_always_passes() {
        let config = ReliabilityConfig {
            rate_limiting_enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(&config);
        let venue = VenueId::from("v1");
        for _ in 0..10_000 {
            assert!(limiter.try_acquire(&venue, 100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let limiter = limiter_with("v1", 1, 0.0001);
        let venue = VenueId::from("v1");
        assert!(limiter.try_acquire(&venue, 1));
        let acquired = limiter
            .acquire(&venue, 1, false, Duration::from_millis(200))
            .await;
        assert!(!acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_acquire_resets_backoff_on_success() {
        let limiter = limiter_with("v1", 1, 10.0);
        let venue = VenueId::from("v1");
        assert!(limiter.try_acquire(&venue, 1));
        // Bucket refills at 10/s, so a critical acquire succeeds after
        // backing off briefly and resets the attempt counter.
        let acquired = limiter
            .acquire(&venue, 1, true, Duration::from_secs(5))
            .await;
        assert!(acquired);
        let backoffs = limiter.backoffs.lock().unwrap();
        assert_eq!(backoffs.get(&venue).map(|b| b.attempts), Some(0));
    }

    #[test]
    fn test_backoff_delay_growth() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.delay(), 0.0);
        backoff.attempts = 1;
        let d1 = backoff.delay();
        backoff.attempts = 4;
        let d4 = backoff.delay();
        assert!(d1 <= 1.2 && d1 >= 0.9);
        assert!(d4 > d1);
        backoff.attempts = 30;
        assert!(backoff.delay() <= BACKOFF_MAX_DELAY * 1.05);
    }
}
