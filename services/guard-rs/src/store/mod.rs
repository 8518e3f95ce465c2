//! Durable ban and audit storage.

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    pub reason: String,
    pub hits: u64,
    pub banned_at: DateTime<Utc>,
    /// `None` is a permanent ban.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BanRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrapHit {
    pub ip: String,
    pub path: String,
    pub reason: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BanStore: Send + Sync {
    /// Inserts a ban, or on an existing row refreshes reason/timestamps and bumps `hits`.
    async fn upsert_ban(
        &self,
        ip: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn increment_ban_hits(&self, ip: &str) -> Result<(), StoreError>;

    /// Every row, expired or not. Offense counters are seeded from this.
    async fn load_bans(&self) -> Result<Vec<BanRecord>, StoreError>;

    async fn load_active_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, StoreError> {
        let bans = self.load_bans().await?;
        Ok(bans.into_iter().filter(|ban| ban.is_active(now)).collect())
    }

    /// Deletes non-permanent rows that expired before `older_than`.
    async fn purge_expired_bans(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete_ban(&self, ip: &str) -> Result<(), StoreError>;

    async fn record_trap_hit(&self, hit: TrapHit) -> Result<(), StoreError>;

    async fn record_traffic(&self, entry: TrafficEntry) -> Result<(), StoreError>;
}
