//! Fixed-window request counters keyed by client identity.
//!
//! The window resets when the time since its start exceeds the window length,
//! so a burst straddling a boundary can reach twice the threshold. That is the
//! intended throughput ceiling; do not swap this for a sliding log.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub count: u32,
    pub started: Instant,
    /// Requests rejected since the last ban. Survives window rollover.
    pub violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Exceeded { violations: u32 },
}

pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u32,
    windows: DashMap<String, RateWindow>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts one request. The map entry stays locked for the whole update.
    pub fn hit(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            started: now,
            violations: 0,
        });

        if now.saturating_duration_since(entry.started) > self.window {
            entry.count = 1;
            entry.started = now;
            return RateDecision::Allowed;
        }

        entry.count += 1;
        if entry.count > self.max_requests {
            entry.violations += 1;
            RateDecision::Exceeded {
                violations: entry.violations,
            }
        } else {
            RateDecision::Allowed
        }
    }

    pub fn clear_violations(&self, key: &str) {
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.violations = 0;
        }
    }

    pub fn remove(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Drops windows that started more than `multiple` window lengths ago.
    pub fn sweep(&self, now: Instant, multiple: u32) -> usize {
        let horizon = self.window * multiple;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) <= horizon);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<RateWindow> {
        self.windows.get(key).map(|w| *w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "203.0.113.20";

    #[test]
    fn exactly_the_threshold_is_allowed() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(10), 5);
        let start = Instant::now();
        for i in 0..5 {
            let at = start + Duration::from_millis(i * 100);
            assert_eq!(limiter.hit(IP, at), RateDecision::Allowed);
        }
        assert_eq!(
            limiter.hit(IP, start + Duration::from_secs(1)),
            RateDecision::Exceeded { violations: 1 }
        );
    }

    #[test]
    fn window_resets_only_after_its_length_has_passed() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(10), 2);
        let start = Instant::now();
        limiter.hit(IP, start);
        limiter.hit(IP, start);
        assert!(matches!(limiter.hit(IP, start), RateDecision::Exceeded { .. }));

        // Exactly on the boundary is still the old window.
        assert!(matches!(
            limiter.hit(IP, start + Duration::from_secs(10)),
            RateDecision::Exceeded { .. }
        ));

        let later = start + Duration::from_secs(10) + Duration::from_millis(1);
        assert_eq!(limiter.hit(IP, later), RateDecision::Allowed);
        let window = limiter.get(IP).unwrap();
        assert_eq!(window.count, 1);
        assert_eq!(window.started, later);
    }

    #[test]
    fn violations_survive_rollover_until_cleared() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60), 1);
        let start = Instant::now();
        limiter.hit(IP, start);
        assert_eq!(limiter.hit(IP, start), RateDecision::Exceeded { violations: 1 });

        let next = start + Duration::from_secs(61);
        limiter.hit(IP, next);
        assert_eq!(limiter.hit(IP, next), RateDecision::Exceeded { violations: 2 });

        limiter.clear_violations(IP);
        assert_eq!(limiter.get(IP).unwrap().violations, 0);
    }

    #[test]
    fn sweep_drops_only_stale_windows() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(10), 50);
        let start = Instant::now();
        limiter.hit("203.0.113.21", start);
        limiter.hit("203.0.113.22", start + Duration::from_secs(45));

        let removed = limiter.sweep(start + Duration::from_secs(60), 5);
        assert_eq!(removed, 1);
        assert!(limiter.get("203.0.113.21").is_none());
        assert!(limiter.get("203.0.113.22").is_some());
    }

    #[test]
    fn identities_are_counted_independently() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(10), 1);
        let now = Instant::now();
        assert_eq!(limiter.hit("203.0.113.23", now), RateDecision::Allowed);
        assert_eq!(limiter.hit("203.0.113.24", now), RateDecision::Allowed);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn concurrent_hits_from_one_identity_are_all_counted() {
        let limiter = std::sync::Arc::new(FixedWindowLimiter::new(Duration::from_secs(3600), u32::MAX));
        let now = Instant::now();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let limiter = std::sync::Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        limiter.hit("203.0.113.25", now);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(limiter.get("203.0.113.25").unwrap().count, 8000);
    }
}
