//! Per-identity sliding-window rate limiter.
//!
//! Windows live in a sharded LRU so memory stays bounded no matter how many
//! distinct callers show up. An evicted or never-seen identity simply has no
//! prior requests. Limits up to `max_exact_timestamps` keep every timestamp;
//! larger limits switch to a two-bucket counter that weights the previous
//! bucket by its remaining overlap with the window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tollgate_config::RateLimitConfig;
use tollgate_core::shard::DEFAULT_SHARDS;
use tollgate_core::{Identity, ShardedLru};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_tracked_identities: usize,
    pub max_exact_timestamps: usize,
    pub shards: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

impl RateLimitSettings {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max_tracked_identities: config.max_tracked_identities,
            max_exact_timestamps: config.max_exact_timestamps,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    /// Requests left in the current window; `None` when unlimited.
    pub remaining: Option<u32>,
    /// How long until a slot frees up; set only when rejected.
    pub retry_after: Option<Duration>,
}

impl RateCheck {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
            retry_after: None,
        }
    }

    /// Whole seconds to wait, rounded up, at least 1 when rejected.
    pub fn retry_after_secs(&self) -> u64 {
        match self.retry_after {
            Some(d) => {
                let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
                secs.max(1)
            }
            None => 0,
        }
    }
}

#[derive(Debug, Clone)]
enum Window {
    Exact(VecDeque<Instant>),
    Approx {
        bucket_start: Instant,
        current: u32,
        previous: u32,
    },
}

impl Window {
    fn exact_check(stamps: &mut VecDeque<Instant>, limit: u32, window: Duration, now: Instant) -> RateCheck {
        while stamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            stamps.pop_front();
        }

        let count = stamps.len() as u32;
        if count < limit {
            stamps.push_back(now);
            RateCheck {
                allowed: true,
                remaining: Some(limit - count - 1),
                retry_after: None,
            }
        } else {
            let oldest = stamps.front().copied().unwrap_or(now);
            RateCheck {
                allowed: false,
                remaining: Some(0),
                retry_after: Some(window.saturating_sub(now.saturating_duration_since(oldest))),
            }
        }
    }

    /// Rotate buckets forward to `now`; returns the weighted in-window
    /// count and how far `now` is into the current bucket.
    fn rotate(
        bucket_start: &mut Instant,
        current: &mut u32,
        previous: &mut u32,
        window: Duration,
        now: Instant,
    ) -> (f64, Duration) {
        let elapsed = now.saturating_duration_since(*bucket_start);
        let buckets = (elapsed.as_nanos() / window.as_nanos().max(1)) as u32;
        if buckets == 1 {
            *previous = *current;
            *current = 0;
            *bucket_start += window;
        } else if buckets >= 2 {
            *previous = 0;
            *current = 0;
            *bucket_start += window * buckets;
        }

        let into_bucket = now.saturating_duration_since(*bucket_start);
        let overlap = (1.0 - into_bucket.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0);
        (f64::from(*previous) * overlap + f64::from(*current), into_bucket)
    }

    fn approx_check(
        bucket_start: &mut Instant,
        current: &mut u32,
        previous: &mut u32,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateCheck {
        let (estimate, into_bucket) = Self::rotate(bucket_start, current, previous, window, now);

        if estimate + 1.0 <= f64::from(limit) {
            *current += 1;
            RateCheck {
                allowed: true,
                remaining: Some((f64::from(limit) - estimate - 1.0).floor() as u32),
                retry_after: None,
            }
        } else {
            RateCheck {
                allowed: false,
                remaining: Some(0),
                retry_after: Some(window.saturating_sub(into_bucket)),
            }
        }
    }

    /// Requests counted against the window at `now`, without recording one.
    fn in_window(&mut self, window: Duration, now: Instant) -> f64 {
        match self {
            Window::Exact(stamps) => stamps
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < window)
                .count() as f64,
            Window::Approx {
                bucket_start,
                current,
                previous,
            } => Self::rotate(bucket_start, current, previous, window, now).0,
        }
    }

    /// Convert to the representation the current limit calls for without
    /// losing recorded requests. Approximate counts become timestamps at
    /// `now`, which expire no earlier than the originals would have.
    fn reshape(&mut self, exact: bool, window: Duration, now: Instant) {
        match self {
            Window::Approx {
                bucket_start,
                current,
                previous,
            } if exact => {
                let (estimate, _) = Self::rotate(bucket_start, current, previous, window, now);
                let carried = estimate.ceil() as usize;
                *self = Window::Exact(std::iter::repeat_n(now, carried).collect());
            }
            Window::Exact(stamps) if !exact => {
                let live = stamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < window)
                    .count() as u32;
                *self = Window::Approx {
                    bucket_start: now,
                    current: live,
                    previous: 0,
                };
            }
            _ => {}
        }
    }
}

/// Thread-safe, bounded, per-identity rate limiter.
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: ShardedLru<String, Window>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.settings.window)
            .field("tracked", &self.windows.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            windows: ShardedLru::new(settings.max_tracked_identities, settings.shards),
            settings,
        }
    }

    pub fn window(&self) -> Duration {
        self.settings.window
    }

    /// `true` if the request is admitted (and recorded).
    pub fn check(&self, identity: &Identity, limit: u32) -> bool {
        self.check_detailed(identity, limit).allowed
    }

    pub fn check_detailed(&self, identity: &Identity, limit: u32) -> RateCheck {
        self.check_at(identity, limit, Instant::now())
    }

    pub fn check_at(&self, identity: &Identity, limit: u32, now: Instant) -> RateCheck {
        if limit == 0 {
            return RateCheck::unlimited();
        }

        let window = self.settings.window;
        let exact = limit as usize <= self.settings.max_exact_timestamps;
        let init = || {
            if exact {
                Window::Exact(VecDeque::new())
            } else {
                Window::Approx {
                    bucket_start: now,
                    current: 0,
                    previous: 0,
                }
            }
        };

        let check = self.windows.with_entry(&identity.key(), init, |w| {
            w.reshape(exact, window, now);
            match w {
                Window::Exact(stamps) => Window::exact_check(stamps, limit, window, now),
                Window::Approx {
                    bucket_start,
                    current,
                    previous,
                } => Window::approx_check(bucket_start, current, previous, limit, window, now),
            }
        });

        if !check.allowed {
            debug!(identity = %identity, limit, retry_after = ?check.retry_after, "Rate limit reached");
        }
        check
    }

    /// Remaining allowance without recording a request. Never inserts a
    /// window for an unseen identity.
    pub fn peek(&self, identity: &Identity, limit: u32) -> RateCheck {
        self.peek_at(identity, limit, Instant::now())
    }

    pub fn peek_at(&self, identity: &Identity, limit: u32, now: Instant) -> RateCheck {
        if limit == 0 {
            return RateCheck::unlimited();
        }
        let window = self.settings.window;
        let used = self
            .windows
            .with_existing(&identity.key(), |w| w.in_window(window, now))
            .unwrap_or(0.0);
        let remaining = (f64::from(limit) - used).max(0.0).floor() as u32;
        RateCheck {
            allowed: remaining > 0,
            remaining: Some(remaining),
            retry_after: None,
        }
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(window_secs),
            ..RateLimitSettings::default()
        })
    }

    fn bob() -> Identity {
        Identity::trusted("bob", "slack")
    }

    #[test]
    fn eleventh_request_in_window_rejected() {
        let rl = limiter(60);
        let start = Instant::now();
        let results: Vec<bool> = (0..11)
            .map(|i| rl.check_at(&bob(), 10, start + Duration::from_millis(i * 90)).allowed)
            .collect();
        assert_eq!(results.iter().filter(|ok| **ok).count(), 10);
        assert!(!results[10]);

        let later = start + Duration::from_secs(61);
        assert!(rl.check_at(&bob(), 10, later).allowed);
    }

    #[test]
    fn zero_limit_is_unlimited_and_untracked() {
        let rl = limiter(60);
        for _ in 0..1000 {
            assert!(rl.check(&bob(), 0));
        }
        assert_eq!(rl.tracked(), 0);
    }

    #[test]
    fn retry_after_tracks_oldest_timestamp() {
        let rl = limiter(60);
        let start = Instant::now();
        rl.check_at(&bob(), 2, start);
        rl.check_at(&bob(), 2, start + Duration::from_secs(10));
        let check = rl.check_at(&bob(), 2, start + Duration::from_secs(20));
        assert!(!check.allowed);
        assert_eq!(check.retry_after, Some(Duration::from_secs(40)));
        assert_eq!(check.retry_after_secs(), 40);
    }

    #[test]
    fn remaining_counts_down() {
        let rl = limiter(60);
        let now = Instant::now();
        assert_eq!(rl.check_at(&bob(), 3, now).remaining, Some(2));
        assert_eq!(rl.check_at(&bob(), 3, now).remaining, Some(1));
        assert_eq!(rl.check_at(&bob(), 3, now).remaining, Some(0));
        assert_eq!(rl.check_at(&bob(), 3, now).remaining, Some(0));
    }

    #[test]
    fn identities_are_independent() {
        let rl = limiter(60);
        let now = Instant::now();
        assert!(rl.check_at(&bob(), 1, now).allowed);
        assert!(!rl.check_at(&bob(), 1, now).allowed);
        assert!(rl.check_at(&Identity::trusted("bob", "web"), 1, now).allowed);
    }

    #[test]
    fn approximate_counter_for_large_limits() {
        let rl = RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            max_exact_timestamps: 10,
            ..RateLimitSettings::default()
        });
        let start = Instant::now();
        let admitted = (0..150)
            .filter(|_| rl.check_at(&bob(), 100, start).allowed)
            .count();
        assert_eq!(admitted, 100);

        // Halfway through the next bucket half the previous bucket still counts.
        let mid = start + Duration::from_secs(90);
        let admitted = (0..100)
            .filter(|_| rl.check_at(&bob(), 100, mid).allowed)
            .count();
        assert_eq!(admitted, 50);

        // Two full windows later the slate is clean.
        let later = start + Duration::from_secs(240);
        assert!(rl.check_at(&bob(), 100, later).allowed);
    }

    #[test]
    fn approximate_retry_after_counts_to_bucket_end() {
        let rl = RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            max_exact_timestamps: 10,
            ..RateLimitSettings::default()
        });
        let start = Instant::now();
        for _ in 0..100 {
            assert!(rl.check_at(&bob(), 100, start).allowed);
        }

        let check = rl.check_at(&bob(), 100, start + Duration::from_secs(15));
        assert!(!check.allowed);
        assert_eq!(check.remaining, Some(0));
        assert_eq!(check.retry_after, Some(Duration::from_secs(45)));
        assert_eq!(check.retry_after_secs(), 45);

        // Past the bucket the weighted previous count lets some through.
        let check = rl.check_at(&bob(), 100, start + Duration::from_secs(75));
        assert!(check.allowed);
    }

    #[test]
    fn peek_does_not_record() {
        let rl = limiter(60);
        let now = Instant::now();
        assert_eq!(rl.peek_at(&bob(), 3, now).remaining, Some(3));
        assert_eq!(rl.tracked(), 0);

        rl.check_at(&bob(), 3, now);
        for _ in 0..5 {
            assert_eq!(rl.peek_at(&bob(), 3, now).remaining, Some(2));
        }
        rl.check_at(&bob(), 3, now);
        rl.check_at(&bob(), 3, now);
        let peeked = rl.peek_at(&bob(), 3, now);
        assert!(!peeked.allowed);
        assert_eq!(peeked.remaining, Some(0));
        assert_eq!(rl.peek_at(&bob(), 0, now).remaining, None);
    }

    #[test]
    fn switching_modes_keeps_recorded_requests() {
        let rl = RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            max_exact_timestamps: 5,
            ..RateLimitSettings::default()
        });
        let now = Instant::now();
        for _ in 0..4 {
            assert!(rl.check_at(&bob(), 5, now).allowed);
        }
        // Limit raised past the exact cap: four requests carry over.
        let check = rl.check_at(&bob(), 8, now);
        assert_eq!(check.remaining, Some(3));
        // Lowered again: five recorded, limit five, rejected.
        assert!(!rl.check_at(&bob(), 5, now).allowed);
    }

    #[test]
    fn memory_is_bounded() {
        let rl = RateLimiter::new(RateLimitSettings {
            max_tracked_identities: 32,
            shards: 4,
            ..RateLimitSettings::default()
        });
        for i in 0..1000 {
            rl.check(&Identity::trusted(format!("user{i}"), "web"), 5);
        }
        assert!(rl.tracked() <= 32);
    }

    #[test]
    fn concurrent_checks_admit_exactly_limit() {
        let rl = Arc::new(limiter(60));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || (0..50).filter(|_| rl.check_at(&bob(), 100, now).allowed).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
