//! Runtime subnet configuration and the hot-swappable subnet table.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ipnetwork::Ipv4Network;

use crate::allocator::Pool;

/// Runtime view of one configured subnet.
#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub network: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration: Duration,
    /// ceiling applied to client-requested lease times
    pub max_lease_duration: Duration,
    pub options: HashMap<String, String>,
    /// DHCP option 66 default for the subnet
    pub tftp_server: Option<String>,
    /// DHCP option 67 default for the subnet
    pub boot_filename: Option<String>,
    pub pools: Vec<Pool>,
}

impl Subnet {
    /// Lease duration to grant, honoring a client-requested time up to the
    /// subnet's ceiling.
    pub fn effective_lease(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(requested) => requested.min(self.max_lease_duration),
            None => self.lease_duration,
        }
    }
}

/// The set of configured subnets, replaceable at runtime.
///
/// Readers take a cheap snapshot (`Arc` clone under a read lock); a reload
/// swaps the inner `Arc`, so in-flight handlers keep the map they started
/// with and new packets see the new one.
#[derive(Debug, Clone, Default)]
pub struct SubnetTable {
    inner: Arc<RwLock<Arc<Vec<Subnet>>>>,
}

impl SubnetTable {
    pub fn new(subnets: Vec<Subnet>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(subnets))),
        }
    }

    /// Atomically replace the subnet set.
    pub fn replace(&self, subnets: Vec<Subnet>) {
        *self.inner.write().unwrap() = Arc::new(subnets);
    }

    pub fn snapshot(&self) -> Arc<Vec<Subnet>> {
        Arc::clone(&self.inner.read().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map a packet to a subnet: the relay agent address first, then the
    /// client address (renewals), then the single configured subnet.
    pub fn resolve(&self, giaddr: Ipv4Addr, ciaddr: Ipv4Addr) -> Option<Subnet> {
        let subnets = self.snapshot();
        if !giaddr.is_unspecified() {
            if let Some(subnet) = subnets.iter().find(|s| s.network.contains(giaddr)) {
                return Some(subnet.clone());
            }
        }
        if !ciaddr.is_unspecified() {
            if let Some(subnet) = subnets.iter().find(|s| s.network.contains(ciaddr)) {
                return Some(subnet.clone());
            }
        }
        if subnets.len() == 1 {
            return Some(subnets[0].clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(network: &str, gateway: [u8; 4]) -> Subnet {
        Subnet {
            network: network.parse().unwrap(),
            gateway: Ipv4Addr::from(gateway),
            dns_servers: Vec::new(),
            lease_duration: Duration::from_secs(3600),
            max_lease_duration: Duration::from_secs(86_400),
            options: HashMap::new(),
            tftp_server: None,
            boot_filename: None,
            pools: Vec::new(),
        }
    }

    const UNSPEC: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

    #[test]
    fn giaddr_wins_over_ciaddr() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", [192, 168, 1, 1]),
            subnet("10.0.0.0/24", [10, 0, 0, 1]),
        ]);
        let hit = table
            .resolve(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 77))
            .unwrap();
        assert_eq!(hit.network.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn ciaddr_used_for_renewals() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", [192, 168, 1, 1]),
            subnet("10.0.0.0/24", [10, 0, 0, 1]),
        ]);
        let hit = table
            .resolve(UNSPEC, Ipv4Addr::new(192, 168, 1, 77))
            .unwrap();
        assert_eq!(hit.network.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn single_subnet_is_the_fallback() {
        let table = SubnetTable::new(vec![subnet("192.168.1.0/24", [192, 168, 1, 1])]);
        assert!(table.resolve(UNSPEC, UNSPEC).is_some());
    }

    #[test]
    fn ambiguous_packets_stay_unresolved() {
        let table = SubnetTable::new(vec![
            subnet("192.168.1.0/24", [192, 168, 1, 1]),
            subnet("10.0.0.0/24", [10, 0, 0, 1]),
        ]);
        assert!(table.resolve(UNSPEC, UNSPEC).is_none());
        // a giaddr that matches nothing falls through to the other rules
        assert!(table.resolve(Ipv4Addr::new(172, 16, 0, 1), UNSPEC).is_none());
    }

    #[test]
    fn replace_swaps_atomically() {
        let table = SubnetTable::new(vec![subnet("192.168.1.0/24", [192, 168, 1, 1])]);
        let before = table.snapshot();
        table.replace(vec![
            subnet("192.168.1.0/24", [192, 168, 1, 1]),
            subnet("10.0.0.0/24", [10, 0, 0, 1]),
        ]);
        // the old snapshot is untouched, new reads see the new set
        assert_eq!(before.len(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn effective_lease_clamps_requested_time() {
        let s = subnet("192.168.1.0/24", [192, 168, 1, 1]);
        assert_eq!(s.effective_lease(None), Duration::from_secs(3600));
        assert_eq!(
            s.effective_lease(Some(Duration::from_secs(600))),
            Duration::from_secs(600)
        );
        assert_eq!(
            s.effective_lease(Some(Duration::from_secs(1_000_000))),
            Duration::from_secs(86_400)
        );
    }
}
