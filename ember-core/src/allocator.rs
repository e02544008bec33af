//! IP allocation.
//!
//! The priority ladder for a `(mac, subnet)` request:
//!
//! 1. an existing active lease for the MAC is returned unchanged;
//! 2. a static reservation for the MAC is claimed under the per-IP lock;
//! 3. each pool is scanned, LRU expired/released rows first, then every
//!    remaining address in a uniformly shuffled order. The shuffle is what
//!    keeps concurrently racing servers off the same address.
//!
//! Every claim of a specific address happens under a database advisory lock
//! keyed by FNV-1a over `(subnet, ip)`, so two nodes checking and inserting
//! the same address serialize on the database rather than on anything
//! in-process.
//!
//! There is deliberately no MAC-level lock: two concurrent DISCOVERs for one
//! MAC with no prior lease can both allocate, yielding two valid leases on
//! different addresses. The client keeps whichever OFFER it accepts and the
//! loser expires on its own.
use std::hash::Hasher;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use ipnetwork::Ipv4Network;
use lease_store::{
    with_lock, Lease, LeaseCache, LeaseState, NewLease, Storage, StoreError,
};
use pnet::util::MacAddr;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// how many LRU candidates to try before scanning the whole pool
const LRU_CANDIDATES: i64 = 10;

/// Inclusive dynamic range inside a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

/// Parameters of one allocation. String-ish fields arrive as raw wire bytes
/// and are sanitized before storage.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub mac: MacAddr,
    pub hostname: Vec<u8>,
    pub subnet: Ipv4Network,
    pub pools: Vec<Pool>,
    pub lease_duration: Duration,
    pub client_id: Vec<u8>,
    pub vendor_class: Vec<u8>,
    pub user_class: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("address {0} is already in use")]
    AddrInUse(Ipv4Addr),
    #[error("address {0} is reserved for another client")]
    Reserved(Ipv4Addr),
    #[error("no available addresses in any configured pool")]
    PoolExhausted,
    #[error("no lease found for {0}")]
    NotFound(Ipv4Addr),
    #[error("hardware address does not match the lease owner")]
    MacMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Allocates addresses against a [`Storage`] backend, optionally keeping a
/// read-side cache warm.
pub struct Allocator<S> {
    store: std::sync::Arc<S>,
    cache: Option<LeaseCache>,
    server_id: String,
}

impl<S> Clone for Allocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: std::sync::Arc::clone(&self.store),
            cache: self.cache.clone(),
            server_id: self.server_id.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Allocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl<S: Storage> Allocator<S> {
    pub fn new(store: std::sync::Arc<S>, cache: Option<LeaseCache>, server_id: String) -> Self {
        Self {
            store,
            cache,
            server_id,
        }
    }

    pub fn cache(&self) -> Option<&LeaseCache> {
        self.cache.as_ref()
    }

    /// cache only ever updated after the store confirmed a write
    fn cache_put(&self, lease: &Lease) {
        if let Some(cache) = &self.cache {
            cache.put(lease.clone());
        }
    }

    /// Run the allocation priority ladder.
    pub async fn allocate(&self, req: &AllocationRequest) -> Result<Lease, AllocationError> {
        let timer = metrics::ALLOCATION_DURATION.start_timer();
        let result = self.allocate_inner(req).await;
        timer.observe_duration();
        result
    }

    async fn allocate_inner(&self, req: &AllocationRequest) -> Result<Lease, AllocationError> {
        let now = Utc::now();

        // the database is authoritative even with the cache enabled
        if let Some(lease) = self.store.lease_by_mac(req.mac, req.subnet).await? {
            if lease.is_active(now) {
                self.cache_put(&lease);
                return Ok(lease);
            }
        }

        if let Some(reservation) = self.store.reservation_by_mac(req.mac).await? {
            if reservation.subnet == req.subnet {
                return self.lease_for_reservation(req, reservation.ip, &reservation.hostname).await;
            }
        }

        debug!(pools = req.pools.len(), subnet = %req.subnet, "allocating from pools");
        for pool in &req.pools {
            match self.allocate_from_pool(req, pool).await {
                Ok(lease) => return Ok(lease),
                Err(err) => {
                    debug!(?err, range = ?(pool.range_start, pool.range_end), "pool allocation failed");
                }
            }
        }
        Err(AllocationError::PoolExhausted)
    }

    async fn allocate_from_pool(
        &self,
        req: &AllocationRequest,
        pool: &Pool,
    ) -> Result<Lease, AllocationError> {
        // least-recently-expired first
        let candidates = self
            .store
            .expired_leases(req.subnet, pool.range_start, pool.range_end, LRU_CANDIDATES)
            .await?;
        for candidate in &candidates {
            match self.claim_ip(req, candidate.ip, true).await {
                Ok(lease) => return Ok(lease),
                Err(AllocationError::Store(err @ StoreError::Unavailable(_))) => {
                    error!(?err, "storage unavailable while claiming candidate");
                }
                Err(err) => {
                    debug!(?err, ip = %candidate.ip, "candidate not claimable, trying next");
                }
            }
        }

        // no reusable row; walk the whole range in random order so racing
        // servers start from different addresses
        let mut ips: Vec<Ipv4Addr> = (u32::from(pool.range_start)..=u32::from(pool.range_end))
            .map(Ipv4Addr::from)
            .collect();
        ips.shuffle(&mut rand::thread_rng());

        for ip in ips {
            match self.claim_ip(req, ip, false).await {
                Ok(lease) => return Ok(lease),
                Err(err) => {
                    debug!(?err, %ip, "failed to allocate address, trying next");
                }
            }
        }
        Err(AllocationError::PoolExhausted)
    }

    /// Claim one specific address under its advisory lock. With
    /// `allow_expired` the address may have a non-active historical row
    /// (the LRU path); otherwise any existing row disqualifies it.
    async fn claim_ip(
        &self,
        req: &AllocationRequest,
        ip: Ipv4Addr,
        allow_expired: bool,
    ) -> Result<Lease, AllocationError> {
        let key = lock_key(ip, req.subnet);
        let lease = with_lock(self.store.as_ref(), key, || async {
            let now = Utc::now();
            if let Some(existing) = self.store.lease_by_ip(ip, req.subnet).await? {
                let still_held =
                    existing.state == LeaseState::Active && existing.expires_at > now;
                if still_held || !allow_expired {
                    return Err(AllocationError::AddrInUse(ip));
                }
            }
            if let Some(reservation) = self.store.reservation_by_ip(ip, req.subnet).await? {
                if reservation.mac != req.mac {
                    return Err(AllocationError::Reserved(ip));
                }
            }
            let lease = self
                .store
                .create_lease(self.build_lease(req, ip, sanitize_text(&req.hostname), now))
                .await?;
            Ok(lease)
        })
        .await?;

        info!(%ip, mac = %req.mac, subnet = %req.subnet, "allocated lease");
        self.cache_put(&lease);
        Ok(lease)
    }

    /// Claim the reserved address: refresh the existing row for that IP or
    /// create a fresh one.
    async fn lease_for_reservation(
        &self,
        req: &AllocationRequest,
        reserved_ip: Ipv4Addr,
        reserved_hostname: &str,
    ) -> Result<Lease, AllocationError> {
        let key = lock_key(reserved_ip, req.subnet);
        let lease = with_lock(self.store.as_ref(), key, || async {
            let now = Utc::now();
            let lease = match self.store.lease_by_ip(reserved_ip, req.subnet).await? {
                Some(mut existing) => {
                    existing.mac = req.mac;
                    existing.hostname = sanitize_text(&req.hostname);
                    existing.issued_at = now;
                    existing.expires_at = expiry(now, req.lease_duration);
                    existing.last_seen = now;
                    existing.state = LeaseState::Active;
                    existing.client_id = sanitize_text(&req.client_id);
                    existing.vendor_class = sanitize_text(&req.vendor_class);
                    existing.user_class = sanitize_text(&req.user_class);
                    existing.allocated_by = self.server_id.clone();
                    self.store.update_lease(&existing).await?
                }
                None => {
                    self.store
                        .create_lease(self.build_lease(
                            req,
                            reserved_ip,
                            sanitize_text(reserved_hostname.as_bytes()),
                            now,
                        ))
                        .await?
                }
            };
            Ok::<_, AllocationError>(lease)
        })
        .await?;

        debug!(ip = %reserved_ip, mac = %req.mac, "honored static reservation");
        self.cache_put(&lease);
        Ok(lease)
    }

    /// Extend an existing lease's expiry, asserting ownership.
    pub async fn renew(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
        duration: Duration,
    ) -> Result<(), AllocationError> {
        let key = lock_key(ip, subnet);
        with_lock(self.store.as_ref(), key, || async {
            let lease = self
                .store
                .lease_by_ip(ip, subnet)
                .await?
                .ok_or(AllocationError::NotFound(ip))?;
            if lease.mac != mac {
                return Err(AllocationError::MacMismatch);
            }
            let now = Utc::now();
            let expires_at = expiry(now, duration);
            self.store.renew_lease(lease.id, expires_at).await?;
            if self.cache.is_some() {
                let mut renewed = lease;
                renewed.expires_at = expires_at;
                renewed.last_seen = now;
                renewed.state = LeaseState::Active;
                self.cache_put(&renewed);
            }
            Ok(())
        })
        .await?;
        metrics::LEASE_RENEWALS.inc();
        Ok(())
    }

    /// RELEASE: a single state transition, no lock needed.
    pub async fn release(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), AllocationError> {
        self.store.release_lease(ip, subnet).await?;
        if let Some(cache) = &self.cache {
            cache.remove_by_ip(ip);
        }
        metrics::LEASE_RELEASES.inc();
        Ok(())
    }

    /// DECLINE: the row is kept in state `declined`, which removes the
    /// address from LRU candidacy.
    pub async fn decline(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), AllocationError> {
        self.store.decline_lease(ip, subnet).await?;
        if let Some(cache) = &self.cache {
            cache.remove_by_ip(ip);
        }
        metrics::LEASE_DECLINES.inc();
        warn!(%ip, %subnet, "address declined by client, withheld from reuse");
        Ok(())
    }

    fn build_lease(
        &self,
        req: &AllocationRequest,
        ip: Ipv4Addr,
        hostname: String,
        now: DateTime<Utc>,
    ) -> NewLease {
        NewLease {
            ip,
            mac: req.mac,
            hostname,
            subnet: req.subnet,
            issued_at: now,
            expires_at: expiry(now, req.lease_duration),
            last_seen: now,
            state: LeaseState::Active,
            client_id: sanitize_text(&req.client_id),
            vendor_class: sanitize_text(&req.vendor_class),
            user_class: sanitize_text(&req.user_class),
            allocated_by: self.server_id.clone(),
        }
    }
}

fn expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::seconds(duration.as_secs() as i64)
}

/// Advisory-lock key for a specific `(ip, subnet)`: FNV-1a 64 over the
/// subnet's CIDR text and the address bytes, reinterpreted as i64. Every
/// writer must derive the same key for the same address.
pub fn lock_key(ip: Ipv4Addr, subnet: Ipv4Network) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(subnet.to_string().as_bytes());
    hasher.write(&ip.octets());
    hasher.finish() as i64
}

/// Make wire-supplied text safe for TEXT columns: valid UTF-8 with no
/// control characters other than tab, LF and CR passes through, anything
/// else becomes `hex:<lowercase-hex>` of the raw bytes.
pub fn sanitize_text(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    match std::str::from_utf8(raw) {
        Ok(s) if s
            .chars()
            .all(|c| c as u32 >= 32 || matches!(c, '\t' | '\n' | '\r')) =>
        {
            s.to_owned()
        }
        _ => format!("hex:{}", hex::encode(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lease_store::{MemoryStore, NewReservation};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    fn subnet() -> Ipv4Network {
        "192.168.1.0/24".parse().unwrap()
    }

    fn request(mac_last: u8, start: [u8; 4], end: [u8; 4]) -> AllocationRequest {
        AllocationRequest {
            mac: mac(mac_last),
            hostname: b"client".to_vec(),
            subnet: subnet(),
            pools: vec![Pool {
                range_start: Ipv4Addr::from(start),
                range_end: Ipv4Addr::from(end),
            }],
            lease_duration: Duration::from_secs(3600),
            client_id: Vec::new(),
            vendor_class: Vec::new(),
            user_class: Vec::new(),
        }
    }

    fn allocator(store: &Arc<MemoryStore>) -> Allocator<MemoryStore> {
        Allocator::new(Arc::clone(store), Some(LeaseCache::new(64)), "test-node".into())
    }

    #[tokio::test]
    #[traced_test]
    async fn existing_active_lease_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        let req = request(1, [192, 168, 1, 100], [192, 168, 1, 110]);

        let first = alloc.allocate(&req).await.unwrap();
        let second = alloc.allocate(&req).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.ip, second.ip);
    }

    #[tokio::test]
    #[traced_test]
    async fn reservation_takes_priority_over_pools() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_reservation(NewReservation {
                mac: mac(2),
                ip: Ipv4Addr::new(192, 168, 1, 50),
                hostname: "printer".into(),
                subnet: subnet(),
                description: String::new(),
                tftp_server: None,
                boot_filename: None,
            })
            .await
            .unwrap();

        let alloc = allocator(&store);
        let lease = alloc
            .allocate(&request(2, [192, 168, 1, 100], [192, 168, 1, 110]))
            .await
            .unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(lease.state, LeaseState::Active);
        assert_eq!(lease.allocated_by, "test-node");
    }

    #[tokio::test]
    #[traced_test]
    async fn reserved_address_is_refused_to_other_macs() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_reservation(NewReservation {
                mac: mac(2),
                ip: Ipv4Addr::new(192, 168, 1, 100),
                hostname: "printer".into(),
                subnet: subnet(),
                description: String::new(),
                tftp_server: None,
                boot_filename: None,
            })
            .await
            .unwrap();

        // pool contains only the reserved address, so another MAC gets nothing
        let alloc = allocator(&store);
        let err = alloc
            .allocate(&request(9, [192, 168, 1, 100], [192, 168, 1, 100]))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::PoolExhausted));
    }

    #[tokio::test]
    #[traced_test]
    async fn lru_candidate_is_reused_first() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);

        let lease = alloc
            .allocate(&request(1, [192, 168, 1, 100], [192, 168, 1, 110]))
            .await
            .unwrap();
        store.release_lease(lease.ip, subnet()).await.unwrap();

        // a different client gets the released address back
        let reused = alloc
            .allocate(&request(2, [192, 168, 1, 100], [192, 168, 1, 110]))
            .await
            .unwrap();
        assert_eq!(reused.ip, lease.ip);
        assert_eq!(reused.mac, mac(2));
    }

    #[tokio::test]
    #[traced_test]
    async fn declined_address_is_not_reoffered() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        let req1 = request(1, [192, 168, 1, 100], [192, 168, 1, 100]);

        let lease = alloc.allocate(&req1).await.unwrap();
        alloc.decline(lease.ip, subnet()).await.unwrap();

        // declined is not in {expired, released} and the row still exists,
        // so the single-address pool is exhausted
        let err = alloc
            .allocate(&request(2, [192, 168, 1, 100], [192, 168, 1, 100]))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::PoolExhausted));
    }

    #[tokio::test]
    #[traced_test]
    async fn pool_exhaustion_with_foreign_active_lease() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        alloc
            .allocate(&request(1, [192, 168, 1, 100], [192, 168, 1, 100]))
            .await
            .unwrap();

        let err = alloc
            .allocate(&request(2, [192, 168, 1, 100], [192, 168, 1, 100]))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::PoolExhausted));
    }

    #[tokio::test]
    #[traced_test]
    async fn renewal_preserves_identity() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        let lease = alloc
            .allocate(&request(1, [192, 168, 1, 100], [192, 168, 1, 110]))
            .await
            .unwrap();

        alloc
            .renew(mac(1), lease.ip, subnet(), Duration::from_secs(3600))
            .await
            .unwrap();
        let renewed = store.lease_by_ip(lease.ip, subnet()).await.unwrap().unwrap();
        assert_eq!(renewed.ip, lease.ip);
        assert_eq!(renewed.mac, lease.mac);
        assert_eq!(renewed.subnet, lease.subnet);
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(renewed.state, LeaseState::Active);
    }

    #[tokio::test]
    #[traced_test]
    async fn renew_refuses_foreign_mac() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        let lease = alloc
            .allocate(&request(1, [192, 168, 1, 100], [192, 168, 1, 110]))
            .await
            .unwrap();

        let err = alloc
            .renew(mac(9), lease.ip, subnet(), Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::MacMismatch));
    }

    #[tokio::test]
    #[traced_test]
    async fn release_makes_address_reclaimable() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator(&store);
        let req = request(1, [192, 168, 1, 100], [192, 168, 1, 100]);
        let lease = alloc.allocate(&req).await.unwrap();

        alloc.release(lease.ip, subnet()).await.unwrap();
        let next = alloc
            .allocate(&request(2, [192, 168, 1, 100], [192, 168, 1, 100]))
            .await
            .unwrap();
        assert_eq!(next.ip, lease.ip);
    }

    // two server identities racing on one shared store never double-assign
    // an address
    #[tokio::test]
    #[traced_test]
    async fn concurrent_allocations_get_distinct_addresses() {
        let store = Arc::new(MemoryStore::new());
        let node_a = Arc::new(Allocator::new(Arc::clone(&store), None, "node-a".into()));
        let node_b = Arc::new(Allocator::new(Arc::clone(&store), None, "node-b".into()));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let alloc = if i % 2 == 0 {
                Arc::clone(&node_a)
            } else {
                Arc::clone(&node_b)
            };
            tasks.push(tokio::spawn(async move {
                alloc
                    .allocate(&request(i + 1, [192, 168, 1, 100], [192, 168, 1, 107]))
                    .await
                    .unwrap()
            }));
        }

        let mut ips = std::collections::HashSet::new();
        for task in tasks {
            let lease = task.await.unwrap();
            assert!(ips.insert(lease.ip), "address {} assigned twice", lease.ip);
        }
        assert_eq!(ips.len(), 8);
    }

    #[test]
    fn lock_keys_are_stable_and_scoped() {
        let subnet_a: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        let subnet_b: Ipv4Network = "10.0.0.0/24".parse().unwrap();
        let ip = Ipv4Addr::new(192, 168, 1, 100);

        assert_eq!(lock_key(ip, subnet_a), lock_key(ip, subnet_a));
        assert_ne!(lock_key(ip, subnet_a), lock_key(ip, subnet_b));
        assert_ne!(
            lock_key(ip, subnet_a),
            lock_key(Ipv4Addr::new(192, 168, 1, 101), subnet_a)
        );
    }

    #[test]
    fn sanitize_passes_clean_text() {
        assert_eq!(sanitize_text(b"laptop-42"), "laptop-42");
        assert_eq!(sanitize_text(b"line1\nline2\ttabbed\r"), "line1\nline2\ttabbed\r");
        assert_eq!(sanitize_text(b""), "");
    }

    #[test]
    fn sanitize_hex_encodes_control_and_binary() {
        // embedded NUL survives UTF-8 validation but is a control character
        assert_eq!(sanitize_text(b"ab\x00cd"), "hex:6162006364");
        assert_eq!(sanitize_text(&[0xff, 0xfe]), "hex:fffe");
        assert_eq!(sanitize_text(b"\x1b[31m"), "hex:1b5b33316d");
    }

    #[test]
    fn sanitize_is_stable_under_reapplication() {
        let once = sanitize_text(b"ab\x00cd");
        let twice = sanitize_text(once.as_bytes());
        assert_eq!(once, twice);
    }
}
