//! Persisted entities: leases, reservations, sync audit rows.
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;

use crate::error::StoreError;

/// Lifecycle state of a lease row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Expired,
    Released,
    Declined,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Active => "active",
            LeaseState::Expired => "expired",
            LeaseState::Released => "released",
            LeaseState::Declined => "declined",
        }
    }
}

impl FromStr for LeaseState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LeaseState::Active),
            "expired" => Ok(LeaseState::Expired),
            "released" => Ok(LeaseState::Released),
            "declined" => Ok(LeaseState::Declined),
            other => Err(StoreError::Decode(format!("unknown lease state {other:?}"))),
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lease row.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: i64,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub hostname: String,
    pub subnet: Ipv4Network,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: LeaseState,
    pub client_id: String,
    pub vendor_class: String,
    pub user_class: String,
    /// opaque identity of the server instance that allocated the lease
    pub allocated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lease {
    /// active and not yet past its expiry
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active && self.expires_at > now
    }
}

/// Fields for inserting a lease; id and row timestamps are assigned by the
/// store.
#[derive(Debug, Clone)]
pub struct NewLease {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub hostname: String,
    pub subnet: Ipv4Network,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: LeaseState,
    pub client_id: String,
    pub vendor_class: String,
    pub user_class: String,
    pub allocated_by: String,
}

/// A static MAC→IP reservation row.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: i64,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub subnet: Ipv4Network,
    pub description: String,
    /// DHCP option 66 override
    pub tftp_server: Option<String>,
    /// DHCP option 67 override
    pub boot_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub subnet: Ipv4Network,
    pub description: String,
    pub tftp_server: Option<String>,
    pub boot_filename: Option<String>,
}

/// Outcome of a git sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SyncStatus::InProgress),
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StoreError::Decode(format!("unknown sync status {other:?}"))),
        }
    }
}

/// What started a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Poll,
    Manual,
    Startup,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Poll => "poll",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Startup => "startup",
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(SyncTrigger::Poll),
            "manual" => Ok(SyncTrigger::Manual),
            "startup" => Ok(SyncTrigger::Startup),
            other => Err(StoreError::Decode(format!("unknown sync trigger {other:?}"))),
        }
    }
}

/// One audit row per sync attempt; created `in_progress` before the pull and
/// finalized with the outcome.
#[derive(Debug, Clone)]
pub struct GitSyncLog {
    pub id: i64,
    pub sync_started_at: DateTime<Utc>,
    pub sync_completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub commit_hash: String,
    pub commit_message: String,
    pub commit_author: String,
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub error_message: String,
    pub changes_applied: serde_json::Value,
    pub triggered_by: SyncTrigger,
    pub triggered_by_user: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSyncLog {
    pub sync_started_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub triggered_by: SyncTrigger,
    pub triggered_by_user: String,
}

/// The currently applied configuration (singleton row).
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub commit_hash: String,
    pub applied_at: DateTime<Utc>,
    pub config_yaml: String,
}

/// Per-subnet aggregate lease counts.
#[derive(Debug, Clone)]
pub struct LeaseStatistics {
    pub subnet: Ipv4Network,
    pub active: i64,
    pub expired: i64,
    pub released: i64,
    pub declined: i64,
    pub next_expiry: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}
