#![allow(missing_docs)]

//! Sync pipeline metrics, registered into the default prometheus registry.
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// sync attempts by outcome
    pub static ref GIT_SYNCS: IntCounterVec = register_int_counter_vec!(
        "ember_git_syncs_total",
        "Git sync attempts by outcome",
        &["status"]
    )
    .unwrap();

    /// wall time of sync attempts
    pub static ref GIT_SYNC_DURATION: Histogram = register_histogram!(
        "ember_git_sync_duration_seconds",
        "Git sync duration (seconds)"
    )
    .unwrap();

    /// unix time of the last successful sync
    pub static ref GIT_SYNC_LAST_SUCCESS: IntGauge = register_int_gauge!(
        "ember_git_sync_last_success_timestamp",
        "Unix timestamp of the last successful git sync"
    )
    .unwrap();
}
