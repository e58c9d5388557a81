//! Rate limit bucket tracking.
//!
//! Limits are a property of the account, so a single [`BucketTracker`] is
//! shared by every REST client in the process (see [`BucketTracker::shared`]).
//! Callers reserve a slot with [`BucketTracker::acquire`] before sending and
//! feed response headers back through [`BucketTracker::update`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::time::Instant;
use tracing::debug;

pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Upper bound applied to any server-reported wait.
const MAX_RESET: Duration = Duration::from_secs(24 * 60 * 60);
/// Reset instants closer than this are treated as the same window.
const WINDOW_TOLERANCE: Duration = Duration::from_millis(250);

static SHARED: OnceLock<Arc<BucketTracker>> = OnceLock::new();

/// Throughput state for one bucket key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
    /// Bucket identifier reported by the server, when it sends one.
    pub server_bucket: Option<String>,
    window: Duration,
    /// Created by a 429 that carried no bucket headers. It only blocks until
    /// `reset_at` and is dropped instead of refilled.
    provisional: bool,
}

/// Rate limit information parsed from a response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl RateLimitHeaders {
    /// Reads the rate limit headers. `Reset-After` wins over the absolute
    /// `Reset` timestamp because it is immune to clock skew.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };

        let reset_after = text(HEADER_RESET_AFTER)
            .and_then(parse_seconds)
            .or_else(|| text(HEADER_RESET).and_then(duration_until_epoch));

        Self {
            bucket: text(HEADER_BUCKET).map(str::to_string),
            limit: text(HEADER_LIMIT).and_then(|value| value.parse().ok()),
            remaining: text(HEADER_REMAINING).and_then(|value| value.parse().ok()),
            reset_after,
            retry_after: text(HEADER_RETRY_AFTER).and_then(parse_seconds),
            global: text(HEADER_GLOBAL).is_some_and(|value| value.eq_ignore_ascii_case("true")),
        }
    }
}

/// Process-wide table of rate limit buckets keyed by route bucket key.
#[derive(Debug, Default)]
pub struct BucketTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    buckets: HashMap<String, RateLimitBucket>,
    global_until: Option<Instant>,
}

impl BucketTracker {
    /// Creates a private tracker. Most callers want [`BucketTracker::shared`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker shared by every client in this process.
    pub fn shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }

    /// Waits until a request against `key` may be sent and reserves a slot.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, key: &str) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_acquire(key, Instant::now()) {
                Ok(()) => return waited,
                Err(wait) => {
                    debug!(
                        event = "rate_limit_wait",
                        bucket = key,
                        wait_ms = wait.as_millis() as u64
                    );
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    /// Reserves a slot if one is available at `now`.
    ///
    /// The check and the decrement happen under one lock, so concurrent
    /// callers can never reserve more than `remaining` slots. On refusal the
    /// time left until the blocking limit resets is returned.
    pub fn try_acquire(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock();

        if let Some(until) = state.global_until {
            if now < until {
                return Err(until - now);
            }
            state.global_until = None;
        }

        let Some(bucket) = state.buckets.get_mut(key) else {
            return Ok(());
        };

        if now >= bucket.reset_at {
            if bucket.provisional {
                state.buckets.remove(key);
                return Ok(());
            }
            bucket.remaining = bucket.limit;
            bucket.reset_at = deadline(now, bucket.window);
        }

        if bucket.remaining == 0 {
            return Err(bucket.reset_at.saturating_duration_since(now));
        }
        bucket.remaining -= 1;
        Ok(())
    }

    /// Applies rate limit headers from a response for `key`.
    pub fn update(&self, key: &str, headers: &RateLimitHeaders, now: Instant) {
        let (Some(remaining), Some(reset_after)) = (headers.remaining, headers.reset_after) else {
            return;
        };
        let reset_at = deadline(now, reset_after);
        let mut state = self.lock();

        match state.buckets.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(RateLimitBucket {
                    limit: headers.limit.unwrap_or(remaining.saturating_add(1)),
                    remaining,
                    reset_at,
                    server_bucket: headers.bucket.clone(),
                    window: reset_after,
                    provisional: false,
                });
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                let new_window =
                    now >= bucket.reset_at || reset_at > bucket.reset_at + WINDOW_TOLERANCE;
                if new_window {
                    bucket.remaining = remaining;
                    bucket.reset_at = reset_at;
                    bucket.window = reset_after;
                } else {
                    // Slots reserved by in-flight requests are not in the
                    // server's count yet.
                    bucket.remaining = bucket.remaining.min(remaining);
                }
                if let Some(limit) = headers.limit {
                    bucket.limit = limit;
                }
                if headers.bucket.is_some() {
                    bucket.server_bucket = headers.bucket.clone();
                }
                bucket.provisional = false;
            }
        }
    }

    /// Records a 429 so later callers wait instead of hitting the limit again.
    pub fn record_rate_limited(&self, key: &str, retry_after: Duration, global: bool, now: Instant) {
        let until = deadline(now, retry_after);
        let mut state = self.lock();

        if global {
            state.global_until = Some(state.global_until.map_or(until, |current| current.max(until)));
            return;
        }

        let bucket = state
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| RateLimitBucket {
                limit: 1,
                remaining: 0,
                reset_at: until,
                server_bucket: None,
                window: retry_after,
                provisional: true,
            });
        bucket.remaining = 0;
        bucket.reset_at = bucket.reset_at.max(until);
    }

    /// Snapshot of the bucket stored for `key`.
    pub fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.lock().buckets.get(key).cloned()
    }

    /// Instant until which every bucket is blocked by a global limit.
    pub fn global_reset(&self) -> Option<Instant> {
        self.lock().global_until
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(MAX_RESET)).unwrap_or(now)
}

fn parse_seconds(text: &str) -> Option<Duration> {
    let seconds = text.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

fn duration_until_epoch(text: &str) -> Option<Duration> {
    let target = parse_seconds(text)?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    Some(target.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue};
    use tokio::time::Instant;

    use super::{BucketTracker, RateLimitHeaders};

    const KEY: &str = "POST channels/{id}/messages";

    fn headers(limit: u32, remaining: u32, reset_after: Duration) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: Some("abcd".to_string()),
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            ..RateLimitHeaders::default()
        }
    }

    #[test]
    fn unknown_bucket_is_not_gated() {
        let tracker = BucketTracker::new();
        assert!(tracker.try_acquire(KEY, Instant::now()).is_ok());
        assert!(tracker.bucket(KEY).is_none());
    }

    #[test]
    fn concurrent_callers_never_overshoot_remaining() {
        let tracker = Arc::new(BucketTracker::new());
        let now = Instant::now();
        tracker.update(KEY, &headers(5, 3, Duration::from_secs(10)), now);

        let admitted = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if tracker.try_acquire(KEY, now).is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("join");
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.bucket(KEY).expect("bucket").remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_reset_when_exhausted() {
        let tracker = BucketTracker::new();
        tracker.update(KEY, &headers(2, 1, Duration::from_secs(3)), Instant::now());

        assert_eq!(tracker.acquire(KEY).await, Duration::ZERO);

        let started = Instant::now();
        let waited = tracker.acquire(KEY).await;
        assert!(waited >= Duration::from_secs(3));
        assert!(started.elapsed() >= Duration::from_secs(3));

        let bucket = tracker.bucket(KEY).expect("bucket");
        assert_eq!(bucket.remaining, 1);
    }

    #[test]
    fn header_update_does_not_raise_remaining_within_window() {
        let tracker = BucketTracker::new();
        let now = Instant::now();
        tracker.update(KEY, &headers(5, 4, Duration::from_secs(5)), now);
        tracker.try_acquire(KEY, now).expect("slot");
        tracker.try_acquire(KEY, now).expect("slot");

        tracker.update(KEY, &headers(5, 3, Duration::from_secs(5)), now);
        assert_eq!(tracker.bucket(KEY).expect("bucket").remaining, 2);

        let later = now + Duration::from_secs(6);
        tracker.update(KEY, &headers(5, 4, Duration::from_secs(5)), later);
        assert_eq!(tracker.bucket(KEY).expect("bucket").remaining, 4);
    }

    #[test]
    fn rate_limited_bucket_blocks_until_retry_after() {
        let tracker = BucketTracker::new();
        let now = Instant::now();
        tracker.record_rate_limited(KEY, Duration::from_secs(2), false, now);

        let wait = tracker.try_acquire(KEY, now).expect_err("blocked");
        assert_eq!(wait, Duration::from_secs(2));
        assert!(tracker
            .try_acquire(KEY, now + Duration::from_secs(2))
            .is_ok());
    }

    #[test]
    fn headerless_rate_limit_does_not_throttle_after_it_expires() {
        let tracker = BucketTracker::new();
        let now = Instant::now();
        tracker.record_rate_limited(KEY, Duration::from_millis(500), false, now);
        assert!(tracker.try_acquire(KEY, now).is_err());

        let later = now + Duration::from_millis(500);
        for _ in 0..4 {
            assert!(tracker.try_acquire(KEY, later).is_ok());
        }
        assert!(tracker.bucket(KEY).is_none());
    }

    #[test]
    fn rate_limit_with_headers_keeps_the_reported_bucket() {
        let tracker = BucketTracker::new();
        let now = Instant::now();
        tracker.update(KEY, &headers(2, 0, Duration::from_secs(1)), now);
        tracker.record_rate_limited(KEY, Duration::from_secs(1), false, now);

        let later = now + Duration::from_secs(1);
        assert!(tracker.try_acquire(KEY, later).is_ok());
        assert!(tracker.try_acquire(KEY, later).is_ok());
        assert!(tracker.try_acquire(KEY, later).is_err());
        assert_eq!(tracker.bucket(KEY).expect("bucket").limit, 2);
    }

    #[test]
    fn global_limit_blocks_every_bucket() {
        let tracker = BucketTracker::new();
        let now = Instant::now();
        tracker.record_rate_limited(KEY, Duration::from_secs(1), true, now);

        assert!(tracker.try_acquire("GET users/{id}", now).is_err());
        assert!(tracker
            .try_acquire("GET users/{id}", now + Duration::from_secs(1))
            .is_ok());
        assert!(tracker.global_reset().is_none());
    }

    #[test]
    fn parses_rate_limit_headers() {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-bucket", HeaderValue::from_static("abcd1234"));
        map.insert("x-ratelimit-limit", HeaderValue::from_static("5"));
        map.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        map.insert("x-ratelimit-reset-after", HeaderValue::from_static("1.250"));
        map.insert("x-ratelimit-global", HeaderValue::from_static("true"));
        map.insert("retry-after", HeaderValue::from_static("2"));

        let parsed = RateLimitHeaders::from_headers(&map);
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1250)));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert!(parsed.global);
    }

    #[test]
    fn missing_headers_leave_tracker_untouched() {
        let tracker = BucketTracker::new();
        let parsed = RateLimitHeaders::from_headers(&HeaderMap::new());
        tracker.update(KEY, &parsed, Instant::now());
        assert!(tracker.bucket(KEY).is_none());
    }
}
