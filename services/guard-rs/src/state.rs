use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::{rate::FixedWindowLimiter, store::BanRecord};

/// Windows older than this many window lengths are swept.
pub const STALE_WINDOW_MULTIPLE: u32 = 5;

/// What survives a ban's expiry: the escalation count and the hit total the
/// persisted row carries.
#[derive(Debug, Clone, Copy, Default)]
struct History {
    offenses: u64,
    hits: u64,
    /// Expiry of the latest ban; `None` while permanent or not yet known.
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offense {
    pub number: u64,
    pub hits: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lifted {
    /// The ban that was still live, if any.
    pub ban: Option<BanRecord>,
    pub offenses: u64,
}

/// In-memory defense tables. Decisions read only from here; the store is for
/// audit and restart recovery.
pub struct DefenseState {
    bans: DashMap<String, BanRecord>,
    history: DashMap<String, History>,
    pub global: FixedWindowLimiter,
    pub auth: FixedWindowLimiter,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub bans: usize,
    pub offenders: usize,
    pub global_windows: usize,
    pub auth_windows: usize,
}

impl DefenseState {
    pub fn new(
        global_window: Duration,
        global_max: u32,
        auth_window: Duration,
        auth_max: u32,
    ) -> Self {
        Self {
            bans: DashMap::new(),
            history: DashMap::new(),
            global: FixedWindowLimiter::new(global_window, global_max),
            auth: FixedWindowLimiter::new(auth_window, auth_max),
        }
    }

    /// Restores offense counters from every persisted row and re-activates
    /// bans that have not expired.
    pub fn seed(&self, records: Vec<BanRecord>, now: DateTime<Utc>) -> usize {
        let mut restored = 0;
        for record in records {
            self.history
                .entry(record.ip.clone())
                .and_modify(|h| {
                    h.offenses = h.offenses.max(record.hits);
                    h.hits = h.hits.max(record.hits);
                    h.expires_at = record.expires_at;
                })
                .or_insert(History {
                    offenses: record.hits,
                    hits: record.hits,
                    expires_at: record.expires_at,
                });
            if record.is_active(now) {
                self.bans.insert(record.ip.clone(), record);
                restored += 1;
            }
        }
        restored
    }

    /// Returns the live ban for `ip`, bumping its hit count. Lapsed bans the
    /// reaper has not reached yet are dropped here.
    pub fn hit_ban(&self, ip: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        if let Some(mut ban) = self.bans.get_mut(ip) {
            if ban.is_active(now) {
                let mut history = self.history.entry(ip.to_string()).or_insert(History {
                    offenses: 0,
                    hits: ban.hits,
                    expires_at: ban.expires_at,
                });
                history.hits += 1;
                ban.hits = history.hits;
                return Some(ban.clone());
            }
        }
        self.bans.remove_if(ip, |_, ban| !ban.is_active(now));
        None
    }

    pub fn is_banned(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.bans.get(ip).is_some_and(|ban| ban.is_active(now))
    }

    pub fn ban(&self, ip: &str) -> Option<BanRecord> {
        self.bans.get(ip).map(|ban| ban.clone())
    }

    /// Counts a new offense. A ban is also a hit on the persisted row.
    pub fn next_offense(&self, ip: &str) -> Offense {
        let mut history = self.history.entry(ip.to_string()).or_default();
        history.offenses += 1;
        history.hits += 1;
        Offense {
            number: history.offenses,
            hits: history.hits,
        }
    }

    pub fn offenses(&self, ip: &str) -> u64 {
        self.history.get(ip).map_or(0, |h| h.offenses)
    }

    pub fn insert_ban(&self, record: BanRecord) {
        let ip = record.ip.clone();
        let expires_at = record.expires_at;
        let hits = record.hits;
        self.bans.insert(ip.clone(), record);
        self.history
            .entry(ip)
            .and_modify(|h| h.expires_at = expires_at)
            .or_insert(History {
                offenses: 0,
                hits,
                expires_at,
            });
    }

    /// Manual unban: clears the ban, the offense history and any rate windows.
    /// Returns `None` when the identity had neither a live ban nor a history.
    pub fn lift(&self, ip: &str) -> Option<Lifted> {
        let history = self.history.remove(ip).map(|(_, h)| h);
        let ban = self.bans.remove(ip).map(|(_, ban)| ban);
        if ban.is_none() && history.is_none() {
            return None;
        }
        self.global.remove(ip);
        self.auth.remove(ip);
        Some(Lifted {
            ban,
            offenses: history.map_or(0, |h| h.offenses),
        })
    }

    pub fn active_bans(&self) -> Vec<BanRecord> {
        self.bans.iter().map(|ban| ban.value().clone()).collect()
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }

    pub fn offender_count(&self) -> usize {
        self.history.len()
    }

    /// Drops lapsed bans and stale windows. Offense history is forgotten once
    /// its last ban expired more than `retention` ago, matching the store's
    /// row purge.
    pub fn reap(&self, now: DateTime<Utc>, tick: Instant, retention: chrono::Duration) -> ReapReport {
        let before = self.bans.len();
        self.bans.retain(|_, ban| ban.is_active(now));
        let bans = before.saturating_sub(self.bans.len());

        let cutoff = now - retention;
        let before = self.history.len();
        self.history
            .retain(|_, h| h.expires_at.map_or(true, |expiry| expiry > cutoff));
        let offenders = before.saturating_sub(self.history.len());

        ReapReport {
            bans,
            offenders,
            global_windows: self.global.sweep(tick, STALE_WINDOW_MULTIPLE),
            auth_windows: self.auth.sweep(tick, STALE_WINDOW_MULTIPLE),
        }
    }
}
