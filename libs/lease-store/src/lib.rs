#![allow(clippy::too_many_arguments)]

//! # lease-store
//!
//! Durable state for the DHCP server: leases, static reservations, the git
//! sync audit trail, and the cross-node serialization primitive (database
//! advisory locks).
//!
//! The [`Storage`] trait is the full persistence contract. [`PgStore`] is
//! the production PostgreSQL backend; [`MemoryStore`] implements the same
//! observable semantics in memory and backs the unit and property tests.
//! The allocator and handler are generic over `Storage`, so everything above
//! this crate is exercised against both.
//!
//! Advisory locks are cooperative: correctness depends on every writer
//! deriving the same key for the same `(ip, subnet)` resource.
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

pub mod cache;
pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

pub use cache::{CacheStats, LeaseCache};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{
    ActiveConfig, GitSyncLog, Lease, LeaseState, LeaseStatistics, NewLease, NewReservation,
    NewSyncLog, Reservation, SyncStatus, SyncTrigger,
};
pub use postgres::{PgStore, StoreConfig};

/// Persistence contract for all durable DHCP state.
///
/// Lookups return `None` for absent rows; only infrastructure failures and
/// uniqueness conflicts are errors.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// most recent `active` lease for `(mac, subnet)`
    async fn lease_by_mac(
        &self,
        mac: MacAddr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError>;

    /// most recent lease for `(ip, subnet)` in any state
    async fn lease_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError>;

    /// fails with [`StoreError::Conflict`] when `(ip, subnet)` already has an
    /// active row
    async fn create_lease(&self, lease: NewLease) -> Result<Lease, StoreError>;

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;

    /// re-assert `active`, extend the expiry, touch `last_seen`
    async fn renew_lease(&self, id: i64, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn release_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError>;

    async fn decline_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError>;

    /// up to `limit` rows in `{expired, released}` inside the inclusive
    /// range, least-recently-expired first
    async fn expired_leases(
        &self,
        subnet: Ipv4Network,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        limit: i64,
    ) -> Result<Vec<Lease>, StoreError>;

    /// transition active rows past their expiry to `expired`; returns the
    /// number of rows changed
    async fn expire_old(&self) -> Result<u64, StoreError>;

    /// delete `{expired, released}` rows not updated within `older_than`
    async fn delete_old(&self, older_than: Duration) -> Result<u64, StoreError>;

    async fn lease_statistics(&self) -> Result<Vec<LeaseStatistics>, StoreError>;

    async fn reservation_by_mac(&self, mac: MacAddr) -> Result<Option<Reservation>, StoreError>;

    async fn reservation_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Reservation>, StoreError>;

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    /// fails with [`StoreError::Conflict`] on duplicate MAC or `(ip, subnet)`
    async fn create_reservation(&self, res: NewReservation) -> Result<Reservation, StoreError>;

    async fn update_reservation(&self, res: &Reservation) -> Result<Reservation, StoreError>;

    async fn delete_reservation(&self, id: i64) -> Result<(), StoreError>;

    async fn create_sync_log(&self, log: NewSyncLog) -> Result<GitSyncLog, StoreError>;

    async fn update_sync_log(&self, log: &GitSyncLog) -> Result<(), StoreError>;

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<GitSyncLog>, StoreError>;

    async fn active_config(&self) -> Result<Option<ActiveConfig>, StoreError>;

    async fn set_active_config(
        &self,
        commit_hash: &str,
        config_yaml: &str,
    ) -> Result<(), StoreError>;

    /// Acquire the advisory lock for `key`. Prefer [`with_lock`], which
    /// guarantees the release.
    async fn acquire_lock(&self, key: i64) -> Result<LockGuard, StoreError>;
}

/// A held advisory lock.
///
/// Postgres advisory locks are session-scoped, so the guard pins the pooled
/// connection that took the lock. [`LockGuard::release`] unlocks on that same
/// session; if the guard is dropped without releasing, the connection is
/// detached from the pool and closed so the lock dies with the session
/// instead of leaking into a reused connection.
#[derive(Debug)]
pub struct LockGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    Postgres {
        conn: Option<PoolConnection<Postgres>>,
        key: i64,
    },
    Memory(#[allow(dead_code)] OwnedMutexGuard<()>),
}

impl LockGuard {
    pub(crate) fn postgres(conn: PoolConnection<Postgres>, key: i64) -> Self {
        Self {
            inner: GuardInner::Postgres {
                conn: Some(conn),
                key,
            },
        }
    }

    pub(crate) fn memory(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: GuardInner::Memory(guard),
        }
    }

    /// Release the lock on the session that acquired it.
    pub async fn release(mut self) -> Result<(), StoreError> {
        if let GuardInner::Postgres { conn, key } = &mut self.inner {
            if let Some(mut conn) = conn.take() {
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(*key)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::Postgres { conn, key } = &mut self.inner {
            if let Some(conn) = conn.take() {
                warn!(
                    key = *key,
                    "advisory lock guard dropped without release, closing connection"
                );
                drop(conn.detach());
            }
        }
    }
}

/// Run `body` while holding the advisory lock for `key`; the lock is
/// released on every exit path, success or failure.
pub async fn with_lock<S, F, Fut, T, E>(store: &S, key: i64, body: F) -> Result<T, E>
where
    S: Storage + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    let guard = store.acquire_lock(key).await?;
    let out = body().await;
    match guard.release().await {
        Ok(()) => out,
        // the lock is gone either way (release closes the session on error
        // paths); prefer the body's error when both failed
        Err(unlock_err) => match out {
            Ok(_) => Err(unlock_err.into()),
            Err(err) => Err(err),
        },
    }
}
