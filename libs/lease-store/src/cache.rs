//! Read-side LRU cache of recent leases.
//!
//! Strictly an optimization: allocation decisions always read the database,
//! and entries are inserted only after the store has confirmed a write. The
//! recency list is keyed by MAC with a secondary IP index into the same
//! entries; one mutex covers both structures, so every operation (including
//! the LRU promotion on reads) is exclusive and exact.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;
use pnet::util::MacAddr;

use crate::models::{Lease, LeaseState};

pub const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Debug)]
struct CacheInner {
    by_mac: LruCache<MacAddr, Lease>,
    by_ip: HashMap<Ipv4Addr, MacAddr>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Clonable handle; all clones share one cache.
#[derive(Debug, Clone)]
pub struct LeaseCache {
    inner: Arc<Mutex<CacheInner>>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl LeaseCache {
    pub fn new(max_size: usize) -> Self {
        let max_size = if max_size == 0 {
            DEFAULT_CACHE_SIZE
        } else {
            max_size
        };
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                by_mac: LruCache::new(NonZeroUsize::new(max_size).unwrap()),
                by_ip: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
        }
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<Lease> {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_mac.get(&mac).cloned() {
            Some(lease) => {
                inner.hits += 1;
                Some(lease)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        let mut inner = self.inner.lock().unwrap();
        let mac = inner.by_ip.get(&ip).copied();
        match mac.and_then(|mac| inner.by_mac.get(&mac).cloned()) {
            Some(lease) => {
                inner.hits += 1;
                Some(lease)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh; evicts the LRU tail when full.
    pub fn put(&self, lease: Lease) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let mac = lease.mac;
        let ip = lease.ip;

        // if the MAC moved to a new address, drop the stale IP index entry
        if let Some(old) = inner.by_mac.peek(&mac) {
            let old_ip = old.ip;
            if old_ip != ip {
                inner.by_ip.remove(&old_ip);
            }
        }

        if let Some((evicted_mac, evicted)) = inner.by_mac.push(mac, lease) {
            if evicted_mac != mac {
                inner.by_ip.remove(&evicted.ip);
                inner.evictions += 1;
            }
        }
        inner.by_ip.insert(ip, mac);
    }

    pub fn remove_by_mac(&self, mac: MacAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lease) = inner.by_mac.pop(&mac) {
            inner.by_ip.remove(&lease.ip);
        }
    }

    pub fn remove_by_ip(&self, ip: Ipv4Addr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mac) = inner.by_ip.remove(&ip) {
            inner.by_mac.pop(&mac);
        }
    }

    /// Drop entries whose lease is nominally active but past its expiry.
    /// Returns the number removed.
    pub fn expire_old(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stale: Vec<MacAddr> = inner
            .by_mac
            .iter()
            .filter(|(_, lease)| lease.state == LeaseState::Active && lease.expires_at < now)
            .map(|(mac, _)| *mac)
            .collect();
        for mac in &stale {
            if let Some(lease) = inner.by_mac.pop(mac) {
                inner.by_ip.remove(&lease.ip);
            }
        }
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.by_mac.len(),
            max_size: inner.by_mac.cap().get(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for LeaseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewLease;
    use crate::{MemoryStore, Storage};

    async fn lease(store: &MemoryStore, ip: [u8; 4], mac_last: u8, ttl_secs: i64) -> Lease {
        let now = Utc::now();
        store
            .create_lease(NewLease {
                ip: Ipv4Addr::from(ip),
                mac: MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, mac_last),
                hostname: String::new(),
                subnet: "10.0.0.0/16".parse().unwrap(),
                issued_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
                last_seen: now,
                state: LeaseState::Active,
                client_id: String::new(),
                vendor_class: String::new(),
                user_class: String::new(),
                allocated_by: String::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lookup_by_both_keys() {
        let store = MemoryStore::new();
        let cache = LeaseCache::new(16);
        let l = lease(&store, [10, 0, 0, 1], 1, 60).await;
        cache.put(l.clone());

        assert_eq!(cache.get_by_mac(l.mac).unwrap().ip, l.ip);
        assert_eq!(cache.get_by_ip(l.ip).unwrap().mac, l.mac);
        assert!(cache.get_by_ip(Ipv4Addr::new(10, 0, 0, 99)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let store = MemoryStore::new();
        let cache = LeaseCache::new(2);
        let a = lease(&store, [10, 0, 0, 1], 1, 60).await;
        let b = lease(&store, [10, 0, 0, 2], 2, 60).await;
        let c = lease(&store, [10, 0, 0, 3], 3, 60).await;

        cache.put(a.clone());
        cache.put(b.clone());
        // touch `a` so `b` is the LRU tail
        assert!(cache.get_by_mac(a.mac).is_some());
        cache.put(c.clone());

        assert!(cache.get_by_mac(b.mac).is_none());
        assert!(cache.get_by_ip(b.ip).is_none());
        assert!(cache.get_by_mac(a.mac).is_some());
        assert!(cache.get_by_mac(c.mac).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn put_updates_ip_index_when_address_changes() {
        let store = MemoryStore::new();
        let cache = LeaseCache::new(16);
        let l = lease(&store, [10, 0, 0, 1], 1, 60).await;
        cache.put(l.clone());

        let mut moved = l.clone();
        moved.ip = Ipv4Addr::new(10, 0, 0, 7);
        cache.put(moved.clone());

        assert!(cache.get_by_ip(l.ip).is_none());
        assert_eq!(cache.get_by_ip(moved.ip).unwrap().mac, l.mac);
    }

    #[tokio::test]
    async fn expire_old_removes_stale_active_entries() {
        let store = MemoryStore::new();
        let cache = LeaseCache::new(16);
        let stale = lease(&store, [10, 0, 0, 1], 1, -5).await;
        let live = lease(&store, [10, 0, 0, 2], 2, 300).await;
        cache.put(stale.clone());
        cache.put(live.clone());

        assert_eq!(cache.expire_old(), 1);
        assert!(cache.get_by_mac(stale.mac).is_none());
        assert!(cache.get_by_mac(live.mac).is_some());
    }

    #[tokio::test]
    async fn remove_by_ip_clears_both_indices() {
        let store = MemoryStore::new();
        let cache = LeaseCache::new(16);
        let l = lease(&store, [10, 0, 0, 1], 1, 60).await;
        cache.put(l.clone());
        cache.remove_by_ip(l.ip);
        assert!(cache.get_by_mac(l.mac).is_none());
        assert!(cache.get_by_ip(l.ip).is_none());
    }
}
