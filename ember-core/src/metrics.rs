#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! Server-wide statistics, registered into the default prometheus registry.
//! The exporter surface is external; the core only maintains the values.
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// requests received, by DHCP message type
    pub static ref DHCP_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "ember_requests_total",
        "DHCP requests received by message type",
        &["type"]
    )
    .unwrap();

    /// replies sent, by DHCP message type
    pub static ref DHCP_RESPONSES: IntCounterVec = register_int_counter_vec!(
        "ember_responses_total",
        "DHCP responses sent by message type",
        &["type"]
    )
    .unwrap();

    /// dropped or failed messages, by reason
    pub static ref DHCP_ERRORS: IntCounterVec = register_int_counter_vec!(
        "ember_errors_total",
        "DHCP handling errors by kind",
        &["type"]
    )
    .unwrap();

    /// histogram of allocation latency
    pub static ref ALLOCATION_DURATION: Histogram = register_histogram!(
        "ember_ip_allocation_duration_seconds",
        "IP allocation duration (seconds)"
    )
    .unwrap();

    /// allocations that found no address in any pool
    pub static ref POOL_EXHAUSTED: IntCounter = register_int_counter!(
        "ember_pool_exhausted_total",
        "allocation attempts that exhausted every pool"
    )
    .unwrap();

    pub static ref LEASE_RENEWALS: IntCounter =
        register_int_counter!("ember_lease_renewals_total", "lease renewals").unwrap();
    pub static ref LEASE_RELEASES: IntCounter =
        register_int_counter!("ember_lease_releases_total", "lease releases").unwrap();
    pub static ref LEASE_DECLINES: IntCounter =
        register_int_counter!("ember_lease_declines_total", "lease declines").unwrap();

    /// lease rows by subnet and state, refreshed by the sweeper
    pub static ref LEASES_BY_STATE: IntGaugeVec = register_int_gauge_vec!(
        "ember_leases",
        "lease rows by subnet and state",
        &["subnet", "state"]
    )
    .unwrap();

    /// current lease-cache entry count
    pub static ref CACHE_SIZE: IntGauge =
        register_int_gauge!("ember_lease_cache_size", "lease cache entries").unwrap();
    /// lease-cache evictions
    pub static ref CACHE_EVICTIONS: IntGauge =
        register_int_gauge!("ember_lease_cache_evictions", "lease cache evictions").unwrap();

    /// # of in flight msgs
    pub static ref IN_FLIGHT: IntGauge =
        register_int_gauge!("ember_in_flight", "count of currently processing messages").unwrap();

    /// server uptime
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("ember_uptime", "server uptime (seconds)").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{ALLOCATION_DURATION, DHCP_REQUESTS, LEASES_BY_STATE};

    #[test]
    fn metrics_are_registered_and_exposed() {
        DHCP_REQUESTS.with_label_values(&["discover"]).inc();
        ALLOCATION_DURATION.observe(0.001);
        LEASES_BY_STATE
            .with_label_values(&["192.168.1.0/24", "active"])
            .set(3);

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(
            names.contains("ember_requests_total"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("ember_ip_allocation_duration_seconds"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("ember_leases"),
            "registered metric families: {names:?}"
        );
    }
}
