//! Slow-drip responses for identities that are already banned.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::body::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::debug;

pub type TarpitStream = BoxStream<'static, Result<Bytes, io::Error>>;

#[derive(Debug, Clone, Copy)]
pub struct TarpitSettings {
    pub slots: usize,
    pub drip: Duration,
    pub byte_budget: usize,
    pub timeout: Duration,
}

impl Default for TarpitSettings {
    fn default() -> Self {
        Self {
            slots: 20,
            drip: Duration::from_secs(3),
            byte_budget: 300,
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct Tarpit {
    settings: TarpitSettings,
    busy: Arc<AtomicUsize>,
}

/// One occupied tarpit slot. Released when dropped, whatever ended the stream.
struct Slot {
    busy: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Drip {
    _slot: Slot,
    ticker: Interval,
    deadline: Instant,
    sent: usize,
    budget: usize,
    timed_out: bool,
    ip: String,
}

impl Tarpit {
    pub fn new(settings: TarpitSettings) -> Self {
        Self {
            settings,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.settings.slots
    }

    fn acquire(&self) -> Option<Slot> {
        let max = self.settings.slots;
        self.busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Slot {
                busy: Arc::clone(&self.busy),
            })
    }

    /// Returns the dripping body, or `None` when every slot is taken and the
    /// caller should drop the connection instead of queueing it.
    pub fn engage(&self, ip: &str) -> Option<TarpitStream> {
        let slot = self.acquire()?;
        let start = Instant::now();
        let mut ticker = interval_at(start + self.settings.drip, self.settings.drip);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(ip = %ip, active = self.active(), "tarpit engaged");

        let drip = Drip {
            _slot: slot,
            ticker,
            deadline: start + self.settings.timeout,
            sent: 0,
            budget: self.settings.byte_budget,
            timed_out: false,
            ip: ip.to_string(),
        };

        Some(
            stream::unfold(drip, |mut drip| async move {
                if drip.timed_out || drip.sent >= drip.budget {
                    return None;
                }
                tokio::select! {
                    _ = drip.ticker.tick() => {
                        drip.sent += 1;
                        Some((Ok(Bytes::from_static(b" ")), drip))
                    }
                    _ = sleep_until(drip.deadline) => {
                        debug!(ip = %drip.ip, sent = drip.sent, "tarpit safety timeout");
                        drip.timed_out = true;
                        Some((Err(io::Error::new(io::ErrorKind::TimedOut, "tarpit timeout")), drip))
                    }
                }
            })
            .boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tarpit(slots: usize, byte_budget: usize, timeout: Duration) -> Tarpit {
        Tarpit::new(TarpitSettings {
            slots,
            drip: Duration::from_secs(3),
            byte_budget,
            timeout,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn excess_sessions_are_refused_not_queued() {
        let pit = tarpit(2, 300, Duration::from_secs(600));
        let first = pit.engage("203.0.113.40");
        let second = pit.engage("203.0.113.41");
        assert!(first.is_some() && second.is_some());
        assert!(pit.engage("203.0.113.42").is_none());
        assert_eq!(pit.active(), 2);

        drop(first);
        assert_eq!(pit.active(), 1);
        assert!(pit.engage("203.0.113.42").is_some());
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn byte_budget_ends_the_stream_and_frees_the_slot() {
        let pit = tarpit(1, 5, Duration::from_secs(600));
        let started = Instant::now();
        let chunks: Vec<_> = pit.engage("203.0.113.43").unwrap().collect().await;

        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|chunk| chunk.as_ref().is_ok_and(|b| b.len() == 1)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert_eq!(pit.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timeout_aborts_and_frees_the_slot() {
        let pit = tarpit(1, 300, Duration::from_secs(10));
        let mut body = pit.engage("203.0.113.44").unwrap();
        let mut sent = 0;
        let mut aborted = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(_) => sent += 1,
                Err(err) => {
                    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
                    aborted = true;
                }
            }
        }
        assert!(aborted);
        assert!(sent <= 3);
        drop(body);
        assert_eq!(pit.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_hangup_frees_the_slot() {
        let pit = tarpit(1, 300, Duration::from_secs(600));
        let mut body = pit.engage("203.0.113.45").unwrap();
        assert!(body.next().await.is_some());
        assert_eq!(pit.active(), 1);
        drop(body);
        assert_eq!(pit.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn many_sessions_all_release() {
        let pit = tarpit(4, 2, Duration::from_secs(600));
        let mut handles = Vec::new();
        for i in 0..10 {
            if let Some(body) = pit.engage(&format!("203.0.113.{}", 50 + i)) {
                handles.push(tokio::spawn(body.collect::<Vec<_>>()));
            }
        }
        assert_eq!(handles.len(), 4);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pit.active(), 0);
    }
}
