//! Periodic lease expiry and retention.
use std::sync::Arc;
use std::time::Duration;

use event_bus::Broadcaster;
use lease_store::{LeaseCache, LeaseState, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics;

/// default sweep cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// terminal rows older than this are deleted
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(90 * 24 * 3600);

/// Moves active leases past their expiry to `expired`, prunes rows past the
/// retention window, and refreshes lease gauges. Every step is a single
/// idempotent statement, so concurrent sweepers on other nodes are harmless.
#[derive(Debug)]
pub struct ExpirySweeper<S> {
    store: Arc<S>,
    events: Option<Broadcaster>,
    cache: Option<LeaseCache>,
    interval: Duration,
    retention: Duration,
}

impl<S: Storage> ExpirySweeper<S> {
    pub fn new(store: Arc<S>, events: Option<Broadcaster>, cache: Option<LeaseCache>) -> Self {
        Self {
            store,
            events,
            cache,
            interval: DEFAULT_SWEEP_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Run until the token is cancelled. Failures are logged and the next
    /// tick is attempted.
    pub async fn run(&self, token: CancellationToken) {
        info!(interval = ?self.interval, "lease expiry sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("lease expiry sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One sweep: expire, prune, refresh gauges, trim the cache.
    pub async fn sweep(&self) {
        match self.store.expire_old().await {
            Ok(0) => {}
            Ok(count) => {
                info!(count, "expired leases");
                if let Some(events) = &self.events {
                    events.lease_expired(count);
                }
            }
            Err(err) => error!(?err, "failed to expire leases"),
        }

        match self.store.delete_old(self.retention).await {
            Ok(0) => {}
            Ok(count) => info!(count, "deleted leases past retention"),
            Err(err) => error!(?err, "failed to delete old leases"),
        }

        match self.store.lease_statistics().await {
            Ok(stats) => {
                for stat in stats {
                    let subnet = stat.subnet.to_string();
                    for (state, value) in [
                        (LeaseState::Active, stat.active),
                        (LeaseState::Expired, stat.expired),
                        (LeaseState::Released, stat.released),
                        (LeaseState::Declined, stat.declined),
                    ] {
                        metrics::LEASES_BY_STATE
                            .with_label_values(&[subnet.as_str(), state.as_str()])
                            .set(value);
                    }
                }
            }
            Err(err) => error!(?err, "failed to refresh lease statistics"),
        }

        if let Some(cache) = &self.cache {
            let dropped = cache.expire_old();
            if dropped > 0 {
                debug!(count = dropped, "removed expired cache entries");
            }
            let stats = cache.stats();
            metrics::CACHE_SIZE.set(stats.size as i64);
            metrics::CACHE_EVICTIONS.set(stats.evictions as i64);
            debug!(
                size = stats.size,
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = stats.hit_rate,
                "lease cache statistics"
            );
        }

        metrics::UPTIME.set(metrics::START_TIME.elapsed().as_secs() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ipnetwork::Ipv4Network;
    use lease_store::{MemoryStore, NewLease};
    use pnet::util::MacAddr;
    use std::net::Ipv4Addr;
    use tracing_test::traced_test;

    fn subnet() -> Ipv4Network {
        "192.168.1.0/24".parse().unwrap()
    }

    async fn seed_lease(store: &MemoryStore, last_octet: u8, state: LeaseState, ttl_secs: i64) {
        let now = Utc::now();
        store
            .create_lease(NewLease {
                ip: Ipv4Addr::new(192, 168, 1, last_octet),
                mac: MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last_octet),
                hostname: String::new(),
                subnet: subnet(),
                issued_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
                last_seen: now,
                state,
                client_id: String::new(),
                vendor_class: String::new(),
                user_class: String::new(),
                allocated_by: String::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn sweep_expires_overdue_active_leases() {
        let store = Arc::new(MemoryStore::new());
        seed_lease(&store, 100, LeaseState::Active, -10).await;
        seed_lease(&store, 101, LeaseState::Active, 600).await;

        let sweeper = ExpirySweeper::new(Arc::clone(&store), None, None);
        sweeper.sweep().await;

        let expired = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.state, LeaseState::Expired);
        let live = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 101), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state, LeaseState::Active);

        // running the sweep again changes nothing further
        sweeper.sweep().await;
        let still = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still.state, LeaseState::Expired);
    }

    #[tokio::test]
    #[traced_test]
    async fn sweep_with_zero_retention_prunes_terminal_rows() {
        let store = Arc::new(MemoryStore::new());
        seed_lease(&store, 100, LeaseState::Released, -600).await;
        seed_lease(&store, 101, LeaseState::Active, 600).await;

        let sweeper = ExpirySweeper::new(Arc::clone(&store), None, None)
            .with_retention(Duration::from_secs(0));
        sweeper.sweep().await;

        assert!(store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 101), subnet())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn sweep_publishes_expiry_events() {
        let token = CancellationToken::new();
        let events = Broadcaster::start(token.clone());
        let mut sub = events.subscribe();

        let store = Arc::new(MemoryStore::new());
        seed_lease(&store, 100, LeaseState::Active, -10).await;

        let sweeper = ExpirySweeper::new(Arc::clone(&store), Some(events), None);
        sweeper.sweep().await;

        let event = tokio::time::timeout(Duration::from_secs(1), sub.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, event_bus::EventType::LeaseExpired);
        token.cancel();
    }
}
