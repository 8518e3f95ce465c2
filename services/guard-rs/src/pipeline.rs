//! The ordered inspection pipeline and the ban action.

use std::{net::SocketAddr, sync::Arc};

use axum::http::{HeaderMap, Method, StatusCode};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    deception::{self, DeceptiveResponse},
    error::ConfigError,
    escalation,
    firewall::Firewall,
    honeypot,
    identity::{self, Exemptions, TrustedProxies},
    rate::RateDecision,
    report::{AbuseCategory, Reporter},
    signatures,
    state::{DefenseState, Lifted, ReapReport},
    store::{BanRecord, BanStore, TrafficEntry, TrapHit},
    tarpit::{Tarpit, TarpitSettings},
};

/// Login and registration endpoints of the storefront.
pub const AUTH_PATHS: &[&str] = &[
    "/api/auth/login",
    "/api/auth/register",
    "/api/users/login",
    "/api/users/register",
];

pub fn is_auth_path(normalized: &str) -> bool {
    AUTH_PATHS.contains(&normalized)
}

/// What the pipeline needs to know about one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts<'a> {
    pub ip: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub user_agent: &'a str,
    pub content_type: Option<&'a str>,
    pub body: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Tarpit,
    Reject {
        status: StatusCode,
        reason: &'static str,
    },
    Deceive(DeceptiveResponse),
}

fn decode_form(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

struct BanRequest<'a> {
    ip: &'a str,
    reason: &'a str,
    path: &'a str,
    user_agent: &'a str,
    category: AbuseCategory,
}

pub struct Defense {
    pub state: DefenseState,
    pub tarpit: Tarpit,
    exemptions: Exemptions,
    proxies: TrustedProxies,
    store: Arc<dyn BanStore>,
    firewall: Firewall,
    reporter: Reporter,
    auth_violations_to_ban: u32,
    max_inspect_body: usize,
}

impl Defense {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn BanStore>,
        reporter: Reporter,
        firewall: Firewall,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            state: DefenseState::new(
                config.global_window(),
                config.global_max_requests,
                config.auth_window(),
                config.auth_max_requests,
            ),
            tarpit: Tarpit::new(TarpitSettings {
                slots: config.tarpit_slots,
                drip: std::time::Duration::from_millis(config.tarpit_drip_ms),
                byte_budget: config.tarpit_byte_budget,
                timeout: std::time::Duration::from_secs(config.tarpit_timeout_secs),
            }),
            exemptions: Exemptions::new(config.admin_allowlist()?),
            proxies: TrustedProxies::new(config.proxy_allowlist()?),
            store,
            firewall,
            reporter,
            auth_violations_to_ban: config.auth_violations_to_ban.max(1),
            max_inspect_body: config.max_inspect_body,
        })
    }

    pub fn store(&self) -> &Arc<dyn BanStore> {
        &self.store
    }

    pub fn max_inspect_body(&self) -> usize {
        self.max_inspect_body
    }

    pub fn is_exempt(&self, ip: &str) -> bool {
        self.exemptions.is_exempt(ip)
    }

    pub fn resolve_identity(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        identity::resolve(headers, peer, &self.proxies)
    }

    /// True when `inspect` would tarpit `ip` without looking at the request.
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        !self.exemptions.is_exempt(ip) && self.state.is_banned(ip, Utc::now())
    }

    /// Loads persisted bans. A store failure leaves the tables empty; the
    /// process still serves.
    pub async fn restore(&self) -> usize {
        match self.store.load_bans().await {
            Ok(records) => {
                let total = records.len();
                let active = self.state.seed(records, Utc::now());
                info!(active, total, "restored persisted bans");
                active
            }
            Err(e) => {
                error!("could not load persisted bans: {}", e);
                0
            }
        }
    }

    /// Runs every stage in order and returns the first terminal decision.
    pub fn inspect(&self, facts: &RequestFacts<'_>, now: Instant) -> Verdict {
        let ip = facts.ip;
        if self.exemptions.is_exempt(ip) {
            return Verdict::Pass;
        }

        if let Some(ban) = self.state.hit_ban(ip, Utc::now()) {
            debug!(ip = %ip, hits = ban.hits, path = %facts.path, "banned identity, tarpitting");
            self.persist_hit(ip);
            return Verdict::Tarpit;
        }

        let path = honeypot::normalize_path(facts.path);

        if signatures::is_scanner_agent(facts.user_agent) {
            self.ban(BanRequest {
                ip,
                reason: "automated scanner user agent",
                path: &path,
                user_agent: facts.user_agent,
                category: AbuseCategory::Scanner,
            });
            return Verdict::Reject {
                status: StatusCode::FORBIDDEN,
                reason: "Forbidden",
            };
        }

        if let RateDecision::Exceeded { .. } = self.state.global.hit(ip, now) {
            debug!(ip = %ip, path = %path, "global rate limit exceeded");
            return Verdict::Reject {
                status: StatusCode::TOO_MANY_REQUESTS,
                reason: "Too many requests, slow down",
            };
        }

        if is_auth_path(&path) {
            if let RateDecision::Exceeded { violations } = self.state.auth.hit(ip, now) {
                if violations >= self.auth_violations_to_ban {
                    self.state.auth.clear_violations(ip);
                    self.ban(BanRequest {
                        ip,
                        reason: "authentication brute force",
                        path: &path,
                        user_agent: facts.user_agent,
                        category: AbuseCategory::BruteForce,
                    });
                    return Verdict::Reject {
                        status: StatusCode::FORBIDDEN,
                        reason: "Too many failed attempts, access blocked",
                    };
                }
                warn!(ip = %ip, violations, path = %path, "auth rate limit exceeded");
                return Verdict::Reject {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    reason: "Too many attempts, try again later",
                };
            }
        }

        if let Some(trap) = honeypot::match_trap(&path) {
            if facts.method == Method::POST && (trap.is_login_form() || path.contains("login")) {
                self.harvest(facts, &path);
            }
            self.ban(BanRequest {
                ip,
                reason: "honeypot path requested",
                path: &path,
                user_agent: facts.user_agent,
                category: AbuseCategory::Honeypot,
            });
            return Verdict::Deceive(deception::render(trap, facts.method));
        }

        self.scan_payload(facts, &path);
        Verdict::Pass
    }

    /// Escalates, records and propagates a ban. Only the in-memory insert is
    /// synchronous; every other effect is detached.
    fn ban(&self, req: BanRequest<'_>) -> BanRecord {
        let offense = self.state.next_offense(req.ip);
        let term = escalation::ban_term(offense.number);
        let now = Utc::now();
        let expires_at = term
            .duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        let reason = format!("{} (offense #{}, {})", req.reason, offense.number, term.label);

        let record = BanRecord {
            ip: req.ip.to_string(),
            reason: reason.clone(),
            hits: offense.hits,
            banned_at: now,
            expires_at,
        };
        self.state.insert_ban(record.clone());

        let store = Arc::clone(&self.store);
        let ip = req.ip.to_string();
        let persisted_reason = reason.clone();
        tokio::spawn(async move {
            if let Err(e) = store.upsert_ban(&ip, &persisted_reason, expires_at).await {
                warn!(ip = %ip, "ban not persisted: {}", e);
            }
        });

        self.firewall.block(req.ip);

        warn!(
            ip = %req.ip,
            offense = offense.number,
            duration = term.label,
            category = req.category.tag(),
            path = %req.path,
            user_agent = %req.user_agent,
            "banned: {}",
            reason
        );

        self.record_trap(req.ip, req.path, &reason, req.user_agent);
        self.reporter.report(
            req.ip,
            req.category,
            &format!("{} on {} [{}]", reason, req.path, req.category.tag()),
        );

        record
    }

    fn harvest(&self, facts: &RequestFacts<'_>, path: &str) {
        let Some(body) = facts.body else {
            return;
        };
        if let Some(credentials) = honeypot::harvest_credentials(facts.content_type, body) {
            let reason = credentials.describe();
            warn!(ip = %facts.ip, path = %path, "{}", reason);
            self.record_trap(facts.ip, path, &reason, facts.user_agent);
        }
    }

    /// Logs injection signatures in the query or body. Never rejects.
    fn scan_payload(&self, facts: &RequestFacts<'_>, path: &str) {
        let query = facts.query.map(decode_form);
        let body = facts.body.map(|body| {
            let is_form = facts
                .content_type
                .is_some_and(|ct| ct.contains("application/x-www-form-urlencoded"));
            if is_form {
                decode_form(body)
            } else {
                body.to_string()
            }
        });
        let found = query
            .as_deref()
            .and_then(signatures::detect_injection)
            .or_else(|| body.as_deref().and_then(signatures::detect_injection));

        if let Some(kind) = found {
            let reason = format!("{} signature", kind.as_str());
            warn!(ip = %facts.ip, path = %path, method = %facts.method, "{}", reason);
            self.record_trap(facts.ip, path, &reason, facts.user_agent);
            self.reporter.report(
                facts.ip,
                AbuseCategory::Injection,
                &format!("{} in request to {}", reason, path),
            );
        }
    }

    fn persist_hit(&self, ip: &str) {
        let store = Arc::clone(&self.store);
        let ip = ip.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.increment_ban_hits(&ip).await {
                warn!(ip = %ip, "ban hit not persisted: {}", e);
            }
        });
    }

    fn record_trap(&self, ip: &str, path: &str, reason: &str, user_agent: &str) {
        let store = Arc::clone(&self.store);
        let hit = TrapHit {
            ip: ip.to_string(),
            path: path.to_string(),
            reason: reason.to_string(),
            user_agent: user_agent.to_string(),
            created_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.record_trap_hit(hit).await {
                debug!("trap hit not recorded: {}", e);
            }
        });
    }

    pub fn record_traffic(&self, facts: &RequestFacts<'_>, status: StatusCode) {
        let store = Arc::clone(&self.store);
        let entry = TrafficEntry {
            ip: facts.ip.to_string(),
            method: facts.method.to_string(),
            path: facts.path.to_string(),
            status: status.as_u16(),
            user_agent: facts.user_agent.to_string(),
            created_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.record_traffic(entry).await {
                debug!("traffic not recorded: {}", e);
            }
        });
    }

    /// Manual unban. Also forgets the offense history. Returns `None`, with no
    /// side effects, for an identity with neither a live ban nor a history.
    pub fn unban(&self, ip: &str) -> Option<Lifted> {
        let lifted = self.state.lift(ip)?;

        let store = Arc::clone(&self.store);
        let owned = ip.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.delete_ban(&owned).await {
                warn!(ip = %owned, "persisted ban not deleted: {}", e);
            }
        });
        self.firewall.unblock(ip);

        info!(
            ip = %ip,
            was_banned = lifted.ban.is_some(),
            offenses = lifted.offenses,
            "ban lifted by administrator"
        );
        Some(lifted)
    }

    pub fn reap(&self, retention: chrono::Duration) -> ReapReport {
        self.state.reap(Utc::now(), Instant::now(), retention)
    }
}
