//! In-memory backend with the same observable semantics as [`crate::PgStore`].
//!
//! Backs unit and property tests; also usable for ephemeral single-node runs.
//! Advisory locks are keyed tokio mutexes, so lock contention behaves like
//! the database variant within one process.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;

use crate::error::StoreError;
use crate::models::*;
use crate::{LockGuard, Storage};

#[derive(Debug, Default)]
struct Inner {
    leases: Vec<Lease>,
    reservations: Vec<Reservation>,
    sync_logs: Vec<GitSyncLog>,
    active_config: Option<ActiveConfig>,
    next_lease_id: i64,
    next_reservation_id: i64,
    next_log_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn lease_by_mac(
        &self,
        mac: MacAddr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leases
            .iter()
            .filter(|l| l.mac == mac && l.subnet == subnet && l.state == LeaseState::Active)
            .max_by_key(|l| l.expires_at)
            .cloned())
    }

    async fn lease_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leases
            .iter()
            .filter(|l| l.ip == ip && l.subnet == subnet)
            .max_by_key(|l| l.expires_at)
            .cloned())
    }

    async fn create_lease(&self, lease: NewLease) -> Result<Lease, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        // mirrors the partial unique index: one active row per (ip, subnet)
        if lease.state == LeaseState::Active
            && inner.leases.iter().any(|l| {
                l.ip == lease.ip && l.subnet == lease.subnet && l.state == LeaseState::Active
            })
        {
            return Err(StoreError::Conflict);
        }
        inner.next_lease_id += 1;
        let now = Utc::now();
        let row = Lease {
            id: inner.next_lease_id,
            ip: lease.ip,
            mac: lease.mac,
            hostname: lease.hostname,
            subnet: lease.subnet,
            issued_at: lease.issued_at,
            expires_at: lease.expires_at,
            last_seen: lease.last_seen,
            state: lease.state,
            client_id: lease.client_id,
            vendor_class: lease.vendor_class,
            user_class: lease.user_class,
            allocated_by: lease.allocated_by,
            created_at: now,
            updated_at: now,
        };
        inner.leases.push(row.clone());
        Ok(row)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .leases
            .iter_mut()
            .find(|l| l.id == lease.id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        let mut updated = lease.clone();
        updated.created_at = row.created_at;
        updated.updated_at = Utc::now();
        *row = updated.clone();
        Ok(updated)
    }

    async fn renew_lease(&self, id: i64, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.leases.iter_mut().find(|l| l.id == id) {
            let now = Utc::now();
            row.expires_at = expires_at;
            row.last_seen = now;
            row.state = LeaseState::Active;
            row.updated_at = now;
        }
        Ok(())
    }

    async fn release_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for row in inner
            .leases
            .iter_mut()
            .filter(|l| l.ip == ip && l.subnet == subnet)
        {
            row.state = LeaseState::Released;
            row.last_seen = now;
            row.updated_at = now;
        }
        Ok(())
    }

    async fn decline_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for row in inner
            .leases
            .iter_mut()
            .filter(|l| l.ip == ip && l.subnet == subnet)
        {
            row.state = LeaseState::Declined;
            row.last_seen = now;
            row.updated_at = now;
        }
        Ok(())
    }

    async fn expired_leases(
        &self,
        subnet: Ipv4Network,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        limit: i64,
    ) -> Result<Vec<Lease>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Lease> = inner
            .leases
            .iter()
            .filter(|l| {
                l.subnet == subnet
                    && u32::from(l.ip) >= u32::from(range_start)
                    && u32::from(l.ip) <= u32::from(range_end)
                    && matches!(l.state, LeaseState::Expired | LeaseState::Released)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|l| l.expires_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn expire_old(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut count = 0;
        for row in inner
            .leases
            .iter_mut()
            .filter(|l| l.state == LeaseState::Active && l.expires_at < now)
        {
            row.state = LeaseState::Expired;
            row.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn delete_old(&self, older_than: Duration) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let before = inner.leases.len();
        inner.leases.retain(|l| {
            !(matches!(l.state, LeaseState::Expired | LeaseState::Released)
                && l.updated_at < cutoff)
        });
        Ok((before - inner.leases.len()) as u64)
    }

    async fn lease_statistics(&self) -> Result<Vec<LeaseStatistics>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut by_subnet: HashMap<Ipv4Network, LeaseStatistics> = HashMap::new();
        for lease in &inner.leases {
            let stat = by_subnet
                .entry(lease.subnet)
                .or_insert_with(|| LeaseStatistics {
                    subnet: lease.subnet,
                    active: 0,
                    expired: 0,
                    released: 0,
                    declined: 0,
                    next_expiry: None,
                    last_activity: None,
                });
            match lease.state {
                LeaseState::Active => {
                    stat.active += 1;
                    stat.next_expiry = Some(match stat.next_expiry {
                        Some(cur) => cur.min(lease.expires_at),
                        None => lease.expires_at,
                    });
                }
                LeaseState::Expired => stat.expired += 1,
                LeaseState::Released => stat.released += 1,
                LeaseState::Declined => stat.declined += 1,
            }
            stat.last_activity = Some(match stat.last_activity {
                Some(cur) => cur.max(lease.last_seen),
                None => lease.last_seen,
            });
        }
        Ok(by_subnet.into_values().collect())
    }

    async fn reservation_by_mac(&self, mac: MacAddr) -> Result<Option<Reservation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.reservations.iter().find(|r| r.mac == mac).cloned())
    }

    async fn reservation_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Reservation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reservations
            .iter()
            .find(|r| r.ip == ip && r.subnet == subnet)
            .cloned())
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows = inner.reservations.clone();
        rows.sort_by_key(|r| (r.subnet, u32::from(r.ip)));
        Ok(rows)
    }

    async fn create_reservation(&self, res: NewReservation) -> Result<Reservation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .reservations
            .iter()
            .any(|r| r.mac == res.mac || (r.ip == res.ip && r.subnet == res.subnet))
        {
            return Err(StoreError::Conflict);
        }
        inner.next_reservation_id += 1;
        let now = Utc::now();
        let row = Reservation {
            id: inner.next_reservation_id,
            mac: res.mac,
            ip: res.ip,
            hostname: res.hostname,
            subnet: res.subnet,
            description: res.description,
            tftp_server: res.tftp_server,
            boot_filename: res.boot_filename,
            created_at: now,
            updated_at: now,
        };
        inner.reservations.push(row.clone());
        Ok(row)
    }

    async fn update_reservation(&self, res: &Reservation) -> Result<Reservation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .reservations
            .iter_mut()
            .find(|r| r.id == res.id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        let mut updated = res.clone();
        updated.created_at = row.created_at;
        updated.updated_at = Utc::now();
        *row = updated.clone();
        Ok(updated)
    }

    async fn delete_reservation(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reservations.retain(|r| r.id != id);
        Ok(())
    }

    async fn create_sync_log(&self, log: NewSyncLog) -> Result<GitSyncLog, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_log_id += 1;
        let row = GitSyncLog {
            id: inner.next_log_id,
            sync_started_at: log.sync_started_at,
            sync_completed_at: None,
            status: log.status,
            commit_hash: String::new(),
            commit_message: String::new(),
            commit_author: String::new(),
            commit_timestamp: None,
            error_message: String::new(),
            changes_applied: serde_json::Value::Null,
            triggered_by: log.triggered_by,
            triggered_by_user: log.triggered_by_user,
            created_at: Utc::now(),
        };
        inner.sync_logs.push(row.clone());
        Ok(row)
    }

    async fn update_sync_log(&self, log: &GitSyncLog) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.sync_logs.iter_mut().find(|l| l.id == log.id) {
            *row = log.clone();
        }
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<GitSyncLog>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows = inner.sync_logs.clone();
        rows.sort_by(|a, b| b.sync_started_at.cmp(&a.sync_started_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn active_config(&self) -> Result<Option<ActiveConfig>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.active_config.clone())
    }

    async fn set_active_config(
        &self,
        commit_hash: &str,
        config_yaml: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active_config = Some(ActiveConfig {
            commit_hash: commit_hash.to_string(),
            applied_at: Utc::now(),
            config_yaml: config_yaml.to_string(),
        });
        Ok(())
    }

    async fn acquire_lock(&self, key: i64) -> Result<LockGuard, StoreError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(key).or_default())
        };
        Ok(LockGuard::memory(lock.lock_owned().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    fn subnet() -> Ipv4Network {
        "192.168.1.0/24".parse().unwrap()
    }

    fn new_lease(ip: [u8; 4], mac_last: u8, state: LeaseState, ttl_secs: i64) -> NewLease {
        let now = Utc::now();
        NewLease {
            ip: Ipv4Addr::from(ip),
            mac: mac(mac_last),
            hostname: "host".into(),
            subnet: subnet(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            last_seen: now,
            state,
            client_id: String::new(),
            vendor_class: String::new(),
            user_class: String::new(),
            allocated_by: "test".into(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn duplicate_active_lease_conflicts() {
        let store = MemoryStore::new();
        store
            .create_lease(new_lease([192, 168, 1, 100], 1, LeaseState::Active, 60))
            .await
            .unwrap();
        let err = store
            .create_lease(new_lease([192, 168, 1, 100], 2, LeaseState::Active, 60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        // a non-active historical row for the same address is fine
        store
            .create_lease(new_lease([192, 168, 1, 100], 3, LeaseState::Released, -60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = MemoryStore::new();
        store
            .create_lease(new_lease([192, 168, 1, 100], 1, LeaseState::Active, 60))
            .await
            .unwrap();
        store
            .release_lease(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap();
        let after_first = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        store
            .release_lease(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap();
        let after_second = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_first.state, LeaseState::Released);
        assert_eq!(after_second.state, LeaseState::Released);
        assert_eq!(after_first.ip, after_second.ip);
        assert_eq!(after_first.mac, after_second.mac);
    }

    #[tokio::test]
    async fn expire_old_is_idempotent() {
        let store = MemoryStore::new();
        store
            .create_lease(new_lease([192, 168, 1, 100], 1, LeaseState::Active, -5))
            .await
            .unwrap();
        store
            .create_lease(new_lease([192, 168, 1, 101], 2, LeaseState::Active, 300))
            .await
            .unwrap();
        assert_eq!(store.expire_old().await.unwrap(), 1);
        assert_eq!(store.expire_old().await.unwrap(), 0);
        let expired = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.state, LeaseState::Expired);
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_leases_returns_lru_order() {
        let store = MemoryStore::new();
        let mut oldest = new_lease([192, 168, 1, 102], 1, LeaseState::Expired, -300);
        oldest.expires_at = Utc::now() - chrono::Duration::seconds(300);
        let mut newer = new_lease([192, 168, 1, 101], 2, LeaseState::Released, -60);
        newer.expires_at = Utc::now() - chrono::Duration::seconds(60);
        // declined rows are never LRU candidates
        let mut declined = new_lease([192, 168, 1, 103], 3, LeaseState::Declined, -600);
        declined.expires_at = Utc::now() - chrono::Duration::seconds(600);
        store.create_lease(oldest).await.unwrap();
        store.create_lease(newer).await.unwrap();
        store.create_lease(declined).await.unwrap();

        let rows = store
            .expired_leases(
                subnet(),
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 110),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ip, Ipv4Addr::new(192, 168, 1, 102));
        assert_eq!(rows[1].ip, Ipv4Addr::new(192, 168, 1, 101));
    }

    #[tokio::test]
    async fn delete_old_prunes_only_stale_terminal_rows() {
        let store = MemoryStore::new();
        store
            .create_lease(new_lease([192, 168, 1, 100], 1, LeaseState::Expired, -60))
            .await
            .unwrap();
        store
            .create_lease(new_lease([192, 168, 1, 101], 2, LeaseState::Active, 60))
            .await
            .unwrap();
        // rows were just written, so a 90-day retention deletes nothing
        assert_eq!(
            store
                .delete_old(Duration::from_secs(90 * 24 * 3600))
                .await
                .unwrap(),
            0
        );
        // zero retention deletes the expired row but never the active one
        assert_eq!(store.delete_old(Duration::from_secs(0)).await.unwrap(), 1);
        assert!(store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 101), subnet())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn renew_reactivates_and_extends() {
        let store = MemoryStore::new();
        let lease = store
            .create_lease(new_lease([192, 168, 1, 100], 1, LeaseState::Released, -5))
            .await
            .unwrap();
        let new_expiry = Utc::now() + chrono::Duration::seconds(3600);
        store.renew_lease(lease.id, new_expiry).await.unwrap();
        let renewed = store
            .lease_by_ip(Ipv4Addr::new(192, 168, 1, 100), subnet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.state, LeaseState::Active);
        assert_eq!(renewed.expires_at, new_expiry);
        assert!(renewed.last_seen >= lease.last_seen);
    }

    #[tokio::test]
    async fn reservation_uniqueness() {
        let store = MemoryStore::new();
        let res = NewReservation {
            mac: mac(1),
            ip: Ipv4Addr::new(192, 168, 1, 50),
            hostname: "printer".into(),
            subnet: subnet(),
            description: String::new(),
            tftp_server: None,
            boot_filename: None,
        };
        store.create_reservation(res.clone()).await.unwrap();

        // same MAC, different IP
        let mut dup_mac = res.clone();
        dup_mac.ip = Ipv4Addr::new(192, 168, 1, 51);
        assert!(matches!(
            store.create_reservation(dup_mac).await.unwrap_err(),
            StoreError::Conflict
        ));

        // same (ip, subnet), different MAC
        let mut dup_ip = res;
        dup_ip.mac = mac(2);
        assert!(matches!(
            store.create_reservation(dup_ip).await.unwrap_err(),
            StoreError::Conflict
        ));
    }
}
