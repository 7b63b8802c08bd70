//! Sliding-window admission control for outbound requests.
//!
//! Two windows share one timestamp list: a per-minute cap for sustained
//! rate and a per-ten-minute cap for bursts. Denial never blocks; callers
//! abort the request that was denied.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const TEN_MINUTES: Duration = Duration::from_secs(600);

/// Default sustained rate: one request per second.
pub const DEFAULT_PER_MINUTE: usize = 60;
/// Default burst ceiling over ten minutes.
pub const DEFAULT_PER_TEN_MINUTES: usize = 600;

/// Snapshot of current window occupancy, for log messages.
#[derive(Debug, Clone, Copy)]
pub struct RateStats {
    pub last_minute: usize,
    pub last_ten_minutes: usize,
    pub per_minute: usize,
    pub per_ten_minutes: usize,
}

pub struct RateLimiter {
    per_minute: usize,
    per_ten_minutes: usize,
    timestamps: Mutex<Vec<Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(DEFAULT_PER_MINUTE, DEFAULT_PER_TEN_MINUTES)
    }
}

impl RateLimiter {
    pub fn new(per_minute: usize, per_ten_minutes: usize) -> Self {
        RateLimiter {
            per_minute,
            per_ten_minutes,
            timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Try to admit a request now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Admission check against an explicit clock; lets tests advance time.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut timestamps = self.timestamps.lock().expect("rate limiter lock poisoned");

        // Drop everything outside the longest window.
        timestamps.retain(|t| now.duration_since(*t) < TEN_MINUTES);

        let last_minute = timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < MINUTE)
            .count();
        if last_minute >= self.per_minute {
            return false;
        }
        if timestamps.len() >= self.per_ten_minutes {
            return false;
        }

        timestamps.push(now);
        true
    }

    pub fn stats(&self) -> RateStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> RateStats {
        let timestamps = self.timestamps.lock().expect("rate limiter lock poisoned");
        RateStats {
            last_minute: timestamps
                .iter()
                .filter(|t| now.duration_since(**t) < MINUTE)
                .count(),
            last_ten_minutes: timestamps
                .iter()
                .filter(|t| now.duration_since(**t) < TEN_MINUTES)
                .count(),
            per_minute: self.per_minute,
            per_ten_minutes: self.per_ten_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_over_minute_limit_and_recovers() {
        let limiter = RateLimiter::new(3, 100);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire_at(start));
        }
        // The (limit+1)-th call inside the window is denied.
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(30)));

        // After the window advances past 60 seconds, an equivalent call
        // succeeds.
        assert!(limiter.try_acquire_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn ten_minute_window_caps_bursts() {
        let limiter = RateLimiter::new(100, 5);
        let start = Instant::now();

        // Spread calls over minutes so the minute window never fills.
        for i in 0..5 {
            assert!(limiter.try_acquire_at(start + Duration::from_secs(i * 70)));
        }
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(5 * 70)));

        // Once the earliest timestamps fall out of the ten-minute window,
        // admission resumes.
        assert!(limiter.try_acquire_at(start + Duration::from_secs(601)));
    }

    #[test]
    fn stats_report_both_windows() {
        let limiter = RateLimiter::new(10, 20);
        let start = Instant::now();
        limiter.try_acquire_at(start);
        limiter.try_acquire_at(start + Duration::from_secs(90));

        let stats = limiter.stats_at(start + Duration::from_secs(91));
        assert_eq!(stats.last_minute, 1);
        assert_eq!(stats.last_ten_minutes, 2);
    }
}
