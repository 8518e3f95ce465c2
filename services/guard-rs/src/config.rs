use std::{collections::HashSet, net::IpAddr, time::Duration};

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime settings, layered from defaults and `TRAP_*` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub listen_port: u16,
    /// Comma separated list of operator addresses that skip every stage.
    pub admin_ips: String,
    /// Comma separated public proxy addresses whose forwarding headers are
    /// honored. Internal peers are always trusted.
    pub trusted_proxies: String,
    pub abuseipdb_key: Option<String>,
    pub firewall_cmd: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,

    pub global_window_secs: u64,
    pub global_max_requests: u32,
    pub auth_window_secs: u64,
    pub auth_max_requests: u32,
    pub auth_violations_to_ban: u32,

    pub tarpit_slots: usize,
    pub tarpit_drip_ms: u64,
    pub tarpit_byte_budget: usize,
    pub tarpit_timeout_secs: u64,

    pub reaper_interval_secs: u64,
    pub ban_retention_days: i64,
    pub max_inspect_body: usize,
    pub report_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            admin_ips: String::new(),
            trusted_proxies: String::new(),
            abuseipdb_key: None,
            firewall_cmd: None,
            supabase_url: None,
            supabase_key: None,
            global_window_secs: 10,
            global_max_requests: 50,
            auth_window_secs: 60,
            auth_max_requests: 10,
            auth_violations_to_ban: 2,
            tarpit_slots: 20,
            tarpit_drip_ms: 3000,
            tarpit_byte_budget: 300,
            tarpit_timeout_secs: 600,
            reaper_interval_secs: 300,
            ban_retention_days: 90,
            max_inspect_body: 64 * 1024,
            report_timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("TRAP_"))
            .extract()?;
        Ok(config)
    }

    pub fn admin_allowlist(&self) -> Result<HashSet<IpAddr>, ConfigError> {
        parse_ip_list(&self.admin_ips, ConfigError::AdminIp)
    }

    pub fn proxy_allowlist(&self) -> Result<HashSet<IpAddr>, ConfigError> {
        parse_ip_list(&self.trusted_proxies, ConfigError::ProxyIp)
    }

    pub fn global_window(&self) -> Duration {
        Duration::from_secs(self.global_window_secs)
    }

    pub fn auth_window(&self) -> Duration {
        Duration::from_secs(self.auth_window_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn ban_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.ban_retention_days)
    }
}

fn parse_ip_list(
    list: &str,
    invalid: fn(String) -> ConfigError,
) -> Result<HashSet<IpAddr>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| invalid(s.to_string())))
        .collect()
}
