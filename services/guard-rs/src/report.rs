//! Best-effort abuse reports to AbuseIPDB.

use std::net::IpAddr;

use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::is_internal;

pub const ABUSEIPDB_REPORT_URL: &str = "https://api.abuseipdb.com/api/v2/report";
const MAX_COMMENT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseCategory {
    Scanner,
    Honeypot,
    BruteForce,
    Injection,
}

impl AbuseCategory {
    pub fn tag(self) -> &'static str {
        match self {
            AbuseCategory::Scanner => "scanner",
            AbuseCategory::Honeypot => "honeypot",
            AbuseCategory::BruteForce => "brute_force",
            AbuseCategory::Injection => "injection",
        }
    }

    /// AbuseIPDB category ids: 15 hacking, 16 SQL injection, 18 brute force,
    /// 19 bad web bot, 21 web app attack.
    pub fn abuseipdb_categories(self) -> &'static str {
        match self {
            AbuseCategory::Scanner => "19,21",
            AbuseCategory::Honeypot => "15,21",
            AbuseCategory::BruteForce => "18,21",
            AbuseCategory::Injection => "16,21",
        }
    }
}

#[derive(Clone)]
pub struct Reporter {
    http_client: Client,
    api_key: Option<String>,
    endpoint: String,
}

impl Reporter {
    pub fn new(http_client: Client, api_key: Option<String>) -> Self {
        Self::with_endpoint(http_client, api_key, ABUSEIPDB_REPORT_URL)
    }

    pub fn with_endpoint(
        http_client: Client,
        api_key: Option<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let api_key = api_key.filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            info!("no AbuseIPDB key configured, reputation reports disabled");
        }
        Self {
            http_client,
            api_key,
            endpoint: endpoint.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            http_client: Client::new(),
            api_key: None,
            endpoint: ABUSEIPDB_REPORT_URL.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Spawns the report and returns immediately. Internal addresses and a
    /// missing key skip it.
    pub fn report(&self, ip: &str, category: AbuseCategory, comment: &str) -> Option<JoinHandle<()>> {
        let api_key = self.api_key.clone()?;
        match ip.parse::<IpAddr>() {
            Ok(addr) if !is_internal(addr) => {}
            _ => {
                debug!(ip = %ip, "skipping reputation report for non-public identity");
                return None;
            }
        }

        let client = self.http_client.clone();
        let endpoint = self.endpoint.clone();
        let ip = ip.to_string();
        let comment: String = comment.chars().take(MAX_COMMENT).collect();

        Some(tokio::spawn(async move {
            let res = client
                .post(&endpoint)
                .header("Key", api_key)
                .header("Accept", "application/json")
                .form(&[
                    ("ip", ip.as_str()),
                    ("categories", category.abuseipdb_categories()),
                    ("comment", comment.as_str()),
                ])
                .send()
                .await;
            match res {
                Ok(res) if res.status().is_success() => {
                    debug!(ip = %ip, category = category.tag(), "reputation report accepted");
                }
                Ok(res) => {
                    let status = res.status();
                    let body = res.text().await.unwrap_or_default();
                    warn!(ip = %ip, %status, "reputation report rejected: {}", body);
                }
                Err(e) => {
                    warn!(ip = %ip, "reputation report failed: {}", e);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_disables_reports() {
        let reporter = Reporter::new(Client::new(), None);
        assert!(!reporter.is_enabled());
        assert!(reporter.report("203.0.113.70", AbuseCategory::Scanner, "sqlmap").is_none());
    }

    #[tokio::test]
    async fn internal_addresses_are_never_reported() {
        let reporter = Reporter::new(Client::new(), Some("key".to_string()));
        for ip in ["127.0.0.1", "10.0.0.5", "192.168.1.1", "::1", "unknown"] {
            assert!(reporter.report(ip, AbuseCategory::Honeypot, "x").is_none(), "{ip}");
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        let reporter = Reporter::with_endpoint(
            Client::new(),
            Some("key".to_string()),
            "http://127.0.0.1:9/api/v2/report",
        );
        let handle = reporter
            .report("203.0.113.71", AbuseCategory::BruteForce, "login flood")
            .unwrap();
        assert!(handle.await.is_ok());
    }

    #[test]
    fn categories_map_to_abuseipdb_ids() {
        assert_eq!(AbuseCategory::BruteForce.abuseipdb_categories(), "18,21");
        assert_eq!(AbuseCategory::Injection.tag(), "injection");
    }
}
