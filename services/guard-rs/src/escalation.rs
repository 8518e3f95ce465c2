//! Offense count to ban length.

use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Ordered (inclusive upper bound on offense count, ban length, label).
const TIERS: &[(u64, Duration, &str)] = &[
    (1, Duration::from_secs(30 * MINUTE), "30m"),
    (2, Duration::from_secs(2 * HOUR), "2h"),
    (3, Duration::from_secs(24 * HOUR), "24h"),
    (4, Duration::from_secs(7 * DAY), "7d"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanTerm {
    /// `None` means permanent.
    pub duration: Option<Duration>,
    pub label: &'static str,
}

impl BanTerm {
    pub fn is_permanent(&self) -> bool {
        self.duration.is_none()
    }
}

pub fn ban_term(offense: u64) -> BanTerm {
    TIERS
        .iter()
        .find(|(upper, _, _)| *upper >= offense)
        .map(|(_, duration, label)| BanTerm {
            duration: Some(*duration),
            label: *label,
        })
        .unwrap_or(BanTerm {
            duration: None,
            label: "permanent",
        })
}
