//! Quota buckets learned from the remote service.
//!
//! A [`Bucket`] is one window of quota: a fixed `limit`, a `remaining` count
//! and the epoch instant (`reset_at`, millis) at which the remote service will
//! refill it. `remaining` and `reset_at` sit behind a single lock so every
//! admission decision sees them as one snapshot.

use crate::error::{BucketError, ExtractError};
use crate::headers::{
    RATE_LIMIT_BUCKET_ID, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
};
use http::HeaderMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Sentinel identity for a route that has reported no real limit.
pub const UNLIMITED: &str = "unlimited";

/// The outcome of a single admission check against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Permits left in the window after this one.
        remaining: u32,
    },
    /// The request must not be sent yet.
    Denied {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Wait time carried by a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Quota information parsed from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Bucket capacity.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Window reset instant, millis since the UNIX epoch.
    pub reset_at: u64,
    /// Server-assigned identity; `None` when absent, empty or the sentinel.
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    remaining: u32,
    reset_at: u64,
}

/// One unit of quota.
#[derive(Debug)]
pub struct Bucket {
    hash: String,
    limit: u32,
    window: Mutex<Window>,
}

impl Bucket {
    /// Create a bucket with an explicit window.
    pub fn new(hash: impl Into<String>, limit: u32, remaining: u32, reset_at: u64) -> Self {
        Self { hash: hash.into(), limit, window: Mutex::new(Window { remaining, reset_at }) }
    }

    /// Create a bucket from extracted headers. A missing hash yields the
    /// [`UNLIMITED`] sentinel.
    pub fn from_snapshot(snapshot: &BucketSnapshot) -> Self {
        let hash = snapshot.hash.clone().unwrap_or_else(|| UNLIMITED.to_string());
        Self::new(hash, snapshot.limit, snapshot.remaining, snapshot.reset_at)
    }

    /// A sentinel bucket that admits everything.
    pub fn unlimited(reset_at: u64) -> Self {
        Self::new(UNLIMITED, u32::MAX, u32::MAX, reset_at)
    }

    /// Server-assigned identity.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Capacity; fixed for the bucket's lifetime.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// True for the sentinel bucket.
    pub fn is_unlimited(&self) -> bool {
        self.hash == UNLIMITED
    }

    /// Consistent view of the current window.
    pub fn snapshot(&self) -> BucketSnapshot {
        let window = *self.lock();
        BucketSnapshot {
            limit: self.limit,
            remaining: window.remaining,
            reset_at: window.reset_at,
            hash: (!self.is_unlimited()).then(|| self.hash.clone()),
        }
    }

    /// Take one permit if available.
    ///
    /// An exhausted bucket whose reset instant has passed admits anyway: the
    /// remote side is assumed to have refilled it even though no response
    /// has told us so yet. `remaining` stays at zero in that case.
    pub fn check(&self, now: u64) -> Decision {
        if self.is_unlimited() {
            return Decision::Allowed { remaining: self.limit };
        }
        let mut window = self.lock();
        Self::take(&mut window, now)
    }

    /// [`check`](Self::check) reduced to admit/deny.
    pub fn allow(&self, now: u64) -> bool {
        self.check(now).is_allowed()
    }

    /// Refill the bucket and move its reset instant to `next_reset_at`.
    ///
    /// Fails without touching state if `next_reset_at` is earlier than the
    /// current reset instant.
    pub fn reset(&self, next_reset_at: u64) -> Result<(), BucketError> {
        let mut window = self.lock();
        Self::refill(&mut window, self.limit, next_reset_at)
    }

    /// Reset the window if it has elapsed, then take a permit, all under one
    /// lock acquisition.
    pub(crate) fn check_rolling(
        &self,
        now: u64,
        window_len: Duration,
    ) -> Result<Decision, BucketError> {
        let mut window = self.lock();
        if now >= window.reset_at {
            let window_millis = u64::try_from(window_len.as_millis()).unwrap_or(u64::MAX);
            Self::refill(&mut window, self.limit, now.saturating_add(window_millis))?;
        }
        Ok(Self::take(&mut window, now))
    }

    /// Parse quota headers. Any missing or malformed required field fails the
    /// whole extraction; the bucket id is optional.
    pub fn extract(headers: &HeaderMap) -> Result<BucketSnapshot, ExtractError> {
        let limit = parse_header::<u32>(headers, RATE_LIMIT_LIMIT)?;
        let remaining = parse_header::<u32>(headers, RATE_LIMIT_REMAINING)?;
        let reset_secs = parse_header::<f64>(headers, RATE_LIMIT_RESET)?;
        if !reset_secs.is_finite() || reset_secs < 0.0 {
            return Err(ExtractError::Malformed {
                header: RATE_LIMIT_RESET,
                value: reset_secs.to_string(),
            });
        }
        let reset_at = (reset_secs * 1000.0).round() as u64;

        let hash = headers
            .get(RATE_LIMIT_BUCKET_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty() && *h != UNLIMITED)
            .map(str::to_string);

        Ok(BucketSnapshot { limit, remaining, reset_at, hash })
    }

    fn take(window: &mut Window, now: u64) -> Decision {
        if window.remaining > 0 {
            window.remaining -= 1;
            Decision::Allowed { remaining: window.remaining }
        } else if now >= window.reset_at {
            Decision::Allowed { remaining: 0 }
        } else {
            Decision::Denied { retry_after: Duration::from_millis(window.reset_at - now) }
        }
    }

    fn refill(window: &mut Window, limit: u32, next_reset_at: u64) -> Result<(), BucketError> {
        if next_reset_at < window.reset_at {
            tracing::error!(
                current = window.reset_at,
                requested = next_reset_at,
                "bucket reset would move time backwards"
            );
            return Err(BucketError::ResetWentBackward {
                current: window.reset_at,
                requested: next_reset_at,
            });
        }
        *window = Window { remaining: limit, reset_at: next_reset_at };
        Ok(())
    }

    // Window is always written whole, so a poisoned guard still holds a
    // consistent pair.
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_header<T: FromStr>(headers: &HeaderMap, name: &'static str) -> Result<T, ExtractError> {
    let raw = headers.get(name).ok_or(ExtractError::Missing { header: name })?;
    let malformed = || ExtractError::Malformed {
        header: name,
        value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
    };
    let text = raw.to_str().map_err(|_| malformed())?;
    text.trim().parse::<T>().map_err(|_| malformed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn allows_until_exhausted_then_denies() {
        let bucket = Bucket::new("h1", 3, 3, 10_000);
        assert_eq!(bucket.check(1_000), Decision::Allowed { remaining: 2 });
        assert_eq!(bucket.check(1_000), Decision::Allowed { remaining: 1 });
        assert_eq!(bucket.check(1_000), Decision::Allowed { remaining: 0 });
        assert_eq!(
            bucket.check(1_000),
            Decision::Denied { retry_after: Duration::from_millis(9_000) }
        );
        assert_eq!(bucket.snapshot().remaining, 0);
    }

    #[test]
    fn admits_past_reset_even_when_exhausted() {
        let bucket = Bucket::new("h1", 1, 0, 5_000);
        assert!(!bucket.allow(4_999));
        assert!(bucket.allow(5_000));
        assert!(bucket.allow(6_000));
        assert_eq!(bucket.snapshot().remaining, 0);
    }

    #[test]
    fn reset_backwards_fails_without_mutation() {
        let bucket = Bucket::new("h1", 5, 1, 10_000);
        let err = bucket.reset(9_999).expect_err("backwards reset must fail");
        assert_eq!(err, BucketError::ResetWentBackward { current: 10_000, requested: 9_999 });
        let snap = bucket.snapshot();
        assert_eq!(snap.remaining, 1);
        assert_eq!(snap.reset_at, 10_000);
    }

    #[test]
    fn reset_refills_to_limit() {
        let bucket = Bucket::new("h1", 5, 0, 10_000);
        bucket.reset(10_000).expect("same instant is not backwards");
        bucket.reset(20_000).expect("forward reset");
        let snap = bucket.snapshot();
        assert_eq!(snap.remaining, 5);
        assert_eq!(snap.reset_at, 20_000);
    }

    #[test]
    fn rolling_check_resets_elapsed_window() {
        let bucket = Bucket::new("global", 2, 2, 0);
        let window = Duration::from_secs(1);
        assert!(bucket.check_rolling(500, window).unwrap().is_allowed());
        assert!(bucket.check_rolling(600, window).unwrap().is_allowed());
        assert_eq!(
            bucket.check_rolling(700, window).unwrap(),
            Decision::Denied { retry_after: Duration::from_millis(800) }
        );
        // Window boundary is anchored at first use after expiry.
        assert!(bucket.check_rolling(1_600, window).unwrap().is_allowed());
        assert_eq!(bucket.snapshot().reset_at, 2_600);
    }

    #[test]
    fn unlimited_bucket_always_admits() {
        let bucket = Bucket::unlimited(0);
        for _ in 0..1_000 {
            assert!(bucket.allow(0));
        }
        assert!(bucket.snapshot().hash.is_none());
    }

    #[test]
    fn extract_parses_all_fields() {
        let map = headers(&[
            (RATE_LIMIT_LIMIT, "5"),
            (RATE_LIMIT_REMAINING, "4"),
            (RATE_LIMIT_RESET, "1700000000.250"),
            (RATE_LIMIT_BUCKET_ID, "abcd1234"),
        ]);
        let snap = Bucket::extract(&map).expect("valid headers");
        assert_eq!(
            snap,
            BucketSnapshot {
                limit: 5,
                remaining: 4,
                reset_at: 1_700_000_000_250,
                hash: Some("abcd1234".into()),
            }
        );
        assert_eq!(Bucket::extract(&map).unwrap(), snap);
    }

    #[test]
    fn extract_treats_empty_or_sentinel_hash_as_none() {
        for id in ["", "  ", UNLIMITED] {
            let mut map = headers(&[
                (RATE_LIMIT_LIMIT, "1"),
                (RATE_LIMIT_REMAINING, "0"),
                (RATE_LIMIT_RESET, "10"),
            ]);
            map.insert(RATE_LIMIT_BUCKET_ID, HeaderValue::from_str(id).unwrap());
            assert_eq!(Bucket::extract(&map).unwrap().hash, None, "id {id:?}");
        }
    }

    #[test]
    fn extract_fails_on_missing_or_malformed_fields() {
        assert_eq!(
            Bucket::extract(&HeaderMap::new()),
            Err(ExtractError::Missing { header: RATE_LIMIT_LIMIT })
        );

        let missing_reset = headers(&[(RATE_LIMIT_LIMIT, "5"), (RATE_LIMIT_REMAINING, "4")]);
        assert_eq!(
            Bucket::extract(&missing_reset),
            Err(ExtractError::Missing { header: RATE_LIMIT_RESET })
        );

        let negative = headers(&[
            (RATE_LIMIT_LIMIT, "5"),
            (RATE_LIMIT_REMAINING, "-1"),
            (RATE_LIMIT_RESET, "10"),
        ]);
        assert!(matches!(
            Bucket::extract(&negative),
            Err(ExtractError::Malformed { header: RATE_LIMIT_REMAINING, .. })
        ));

        let nan = headers(&[
            (RATE_LIMIT_LIMIT, "5"),
            (RATE_LIMIT_REMAINING, "1"),
            (RATE_LIMIT_RESET, "NaN"),
        ]);
        assert!(matches!(
            Bucket::extract(&nan),
            Err(ExtractError::Malformed { header: RATE_LIMIT_RESET, .. })
        ));
    }

    #[test]
    fn concurrent_allow_never_overspends() {
        let bucket = Arc::new(Bucket::new("h1", 100, 100, u64::MAX));
        let admitted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let bucket = bucket.clone();
                let admitted = admitted.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        if bucket.allow(0) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
        assert_eq!(bucket.snapshot().remaining, 0);
    }
}
