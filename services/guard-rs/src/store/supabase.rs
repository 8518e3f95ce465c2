use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};

use super::{BanRecord, BanStore, TrafficEntry, TrapHit};
use crate::error::StoreError;

const BANS_TABLE: &str = "banned_ips";
const TRAP_TABLE: &str = "trap_logs";
const TRAFFIC_TABLE: &str = "traffic_logs";

/// Ban store backed by a Supabase/PostgREST endpoint.
///
/// The upsert and increment go through the `upsert_ban` and
/// `increment_ban_hits` SQL functions so the hit counter is bumped inside the
/// database rather than read-modified-written over HTTP.
#[derive(Clone)]
pub struct SupabaseStore {
    http_client: Client,
    api_url: String,
    service_key: String,
}

impl SupabaseStore {
    pub fn new(http_client: Client, api_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            http_client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", &self.service_key))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.api_url, function)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<(), StoreError> {
        let res = self
            .authed(self.http_client.post(self.rpc_url(function)))
            .json(&args)
            .send()
            .await?;
        check(res).await.map(drop)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<(), StoreError> {
        let res = self
            .authed(self.http_client.post(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await?;
        check(res).await.map(drop)
    }
}

async fn check(res: Response) -> Result<Response, StoreError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl BanStore for SupabaseStore {
    async fn upsert_ban(
        &self,
        ip: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.rpc(
            "upsert_ban",
            json!({
                "p_ip": ip,
                "p_reason": reason,
                "p_expires_at": expires_at.map(timestamp),
            }),
        )
        .await
    }

    async fn increment_ban_hits(&self, ip: &str) -> Result<(), StoreError> {
        self.rpc("increment_ban_hits", json!({ "p_ip": ip })).await
    }

    async fn load_bans(&self) -> Result<Vec<BanRecord>, StoreError> {
        let res = self
            .authed(self.http_client.get(self.table_url(BANS_TABLE)))
            .query(&[("select", "ip,reason,hits,banned_at,expires_at")])
            .send()
            .await?;
        let body = check(res).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn load_active_bans(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, StoreError> {
        let res = self
            .authed(self.http_client.get(self.table_url(BANS_TABLE)))
            .query(&[
                ("select", "ip,reason,hits,banned_at,expires_at".to_string()),
                ("or", format!("(expires_at.is.null,expires_at.gt.{})", timestamp(now))),
            ])
            .send()
            .await?;
        let body = check(res).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn purge_expired_bans(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        // `lt` never matches NULL, so permanent rows survive.
        let res = self
            .authed(self.http_client.delete(self.table_url(BANS_TABLE)))
            .query(&[("expires_at", format!("lt.{}", timestamp(older_than)))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let body = check(res).await?.text().await?;
        let deleted: Vec<Value> = serde_json::from_str(&body)?;
        Ok(deleted.len() as u64)
    }

    async fn delete_ban(&self, ip: &str) -> Result<(), StoreError> {
        let res = self
            .authed(self.http_client.delete(self.table_url(BANS_TABLE)))
            .query(&[("ip", format!("eq.{ip}"))])
            .send()
            .await?;
        check(res).await.map(drop)
    }

    async fn record_trap_hit(&self, hit: TrapHit) -> Result<(), StoreError> {
        self.insert(TRAP_TABLE, serde_json::to_value(&hit)?).await
    }

    async fn record_traffic(&self, entry: TrafficEntry) -> Result<(), StoreError> {
        self.insert(TRAFFIC_TABLE, serde_json::to_value(&entry)?).await
    }
}
