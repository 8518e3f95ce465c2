use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::Mutex;

use super::{BanRecord, BanStore, TrafficEntry, TrapHit};
use crate::error::StoreError;

/// Process-local store. Used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    bans: DashMap<String, BanRecord>,
    trap_hits: Mutex<Vec<TrapHit>>,
    traffic: Mutex<Vec<TrafficEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bans(bans: impl IntoIterator<Item = BanRecord>) -> Self {
        let store = Self::new();
        for ban in bans {
            store.bans.insert(ban.ip.clone(), ban);
        }
        store
    }

    pub fn ban(&self, ip: &str) -> Option<BanRecord> {
        self.bans.get(ip).map(|entry| entry.value().clone())
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }

    pub async fn trap_hits(&self) -> Vec<TrapHit> {
        self.trap_hits.lock().await.clone()
    }

    pub async fn traffic(&self) -> Vec<TrafficEntry> {
        self.traffic.lock().await.clone()
    }
}

#[async_trait]
impl BanStore for MemoryStore {
    async fn upsert_ban(
        &self,
        ip: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        match self.bans.entry(ip.to_string()) {
            Entry::Occupied(mut row) => {
                let row = row.get_mut();
                row.hits += 1;
                row.reason = reason.to_string();
                row.banned_at = now;
                row.expires_at = expires_at;
            }
            Entry::Vacant(slot) => {
                slot.insert(BanRecord {
                    ip: ip.to_string(),
                    reason: reason.to_string(),
                    hits: 1,
                    banned_at: now,
                    expires_at,
                });
            }
        }
        Ok(())
    }

    async fn increment_ban_hits(&self, ip: &str) -> Result<(), StoreError> {
        if let Some(mut row) = self.bans.get_mut(ip) {
            row.hits += 1;
        }
        Ok(())
    }

    async fn load_bans(&self) -> Result<Vec<BanRecord>, StoreError> {
        Ok(self.bans.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn purge_expired_bans(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.bans.len();
        self.bans
            .retain(|_, ban| ban.expires_at.map_or(true, |expiry| expiry >= older_than));
        Ok((before - self.bans.len()) as u64)
    }

    async fn delete_ban(&self, ip: &str) -> Result<(), StoreError> {
        self.bans.remove(ip);
        Ok(())
    }

    async fn record_trap_hit(&self, hit: TrapHit) -> Result<(), StoreError> {
        self.trap_hits.lock().await.push(hit);
        Ok(())
    }

    async fn record_traffic(&self, entry: TrafficEntry) -> Result<(), StoreError> {
        self.traffic.lock().await.push(entry);
        Ok(())
    }
}
