//! Background sweep of lapsed bans, stale rate windows and old ban rows.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{pipeline::Defense, state::ReapReport};

pub fn spawn(defense: Arc<Defense>, every: Duration, retention: chrono::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already swept.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&defense, retention).await;
        }
    })
}

/// One reaper pass. Persisted rows are only deleted once they are
/// non-permanent and expired for longer than `retention`.
pub async fn sweep(defense: &Defense, retention: chrono::Duration) -> ReapReport {
    let report = defense.reap(retention);
    if report != ReapReport::default() {
        info!(
            bans = report.bans,
            offenders = report.offenders,
            global_windows = report.global_windows,
            auth_windows = report.auth_windows,
            "reaped expired defense state"
        );
    }

    match defense.store().purge_expired_bans(Utc::now() - retention).await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "purged old ban rows"),
        Err(e) => warn!("ban retention purge failed: {}", e),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config, firewall::Firewall, report::Reporter, store::BanRecord,
        store::MemoryStore,
    };

    fn record(ip: &str, expires_in: Option<chrono::Duration>) -> BanRecord {
        let now = Utc::now();
        BanRecord {
            ip: ip.to_string(),
            reason: "seeded".to_string(),
            hits: 1,
            banned_at: now,
            expires_at: expires_in.map(|d| now + d),
        }
    }

    #[tokio::test]
    async fn sweep_evicts_lapsed_bans_and_purges_old_rows() {
        let store = Arc::new(MemoryStore::with_bans([
            record("203.0.113.90", Some(chrono::Duration::days(-120))),
            record("203.0.113.91", None),
        ]));
        let defense = Defense::from_config(
            &Config::default(),
            store.clone(),
            Reporter::disabled(),
            Firewall::new(None),
        )
        .unwrap();
        defense.state.insert_ban(record("203.0.113.92", Some(chrono::Duration::seconds(-1))));
        defense.state.insert_ban(record("203.0.113.93", None));

        let report = sweep(&defense, chrono::Duration::days(90)).await;
        assert_eq!(report.bans, 1);
        assert!(defense.state.ban("203.0.113.93").is_some());
        assert!(store.ban("203.0.113.90").is_none());
        assert!(store.ban("203.0.113.91").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_sweeps_on_its_interval() {
        let defense = Arc::new(
            Defense::from_config(
                &Config::default(),
                Arc::new(MemoryStore::new()),
                Reporter::disabled(),
                Firewall::new(None),
            )
            .unwrap(),
        );
        defense.state.global.hit("203.0.113.94", tokio::time::Instant::now());

        let handle = spawn(defense.clone(), Duration::from_secs(300), chrono::Duration::days(90));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(defense.state.global.get("203.0.113.94").is_none());
        handle.abort();
    }
}
