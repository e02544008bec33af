//! PostgreSQL backend.
//!
//! All address-typed columns (`INET`, `MACADDR`, `CIDR`) are bound as text
//! with explicit casts and read back as text, so rows written by other
//! tooling interoperate. Embedded migrations run at connect time.
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::models::*;
use crate::{LockGuard, Storage};

/// Connection settings for [`PgStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub connection: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
}

/// Shared PostgreSQL store; cheap to clone, every clone uses the same pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect, verify the connection, and run embedded migrations.
    pub async fn connect(cfg: StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .acquire_timeout(cfg.connect_timeout)
            .connect(&cfg.connection)
            .await?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        debug!("database connected and migrations applied");
        Ok(Self { pool })
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const LEASE_COLUMNS: &str = "id, host(ip) AS ip, mac::text AS mac, hostname, subnet::text AS subnet, \
     issued_at, expires_at, last_seen, state, client_id, vendor_class, \
     user_class, allocated_by, created_at, updated_at";

const RESERVATION_COLUMNS: &str = "id, mac::text AS mac, host(ip) AS ip, hostname, subnet::text AS subnet, \
     description, tftp_server, boot_filename, created_at, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, sync_started_at, sync_completed_at, status, commit_hash, \
     commit_message, commit_author, commit_timestamp, error_message, \
     changes_applied::text AS changes_applied, triggered_by, triggered_by_user, created_at";

fn parse_ip(s: &str) -> Result<Ipv4Addr, StoreError> {
    Ipv4Addr::from_str(s).map_err(|err| StoreError::Decode(format!("bad ip {s:?}: {err}")))
}

fn parse_mac(s: &str) -> Result<MacAddr, StoreError> {
    MacAddr::from_str(s).map_err(|err| StoreError::Decode(format!("bad mac {s:?}: {err}")))
}

fn parse_subnet(s: &str) -> Result<Ipv4Network, StoreError> {
    Ipv4Network::from_str(s).map_err(|err| StoreError::Decode(format!("bad subnet {s:?}: {err}")))
}

fn row_to_lease(row: &PgRow) -> Result<Lease, StoreError> {
    let ip: String = row.try_get("ip")?;
    let mac: String = row.try_get("mac")?;
    let subnet: String = row.try_get("subnet")?;
    let state: String = row.try_get("state")?;
    Ok(Lease {
        id: row.try_get("id")?,
        ip: parse_ip(&ip)?,
        mac: parse_mac(&mac)?,
        hostname: row.try_get("hostname")?,
        subnet: parse_subnet(&subnet)?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        last_seen: row.try_get("last_seen")?,
        state: state.parse()?,
        client_id: row.try_get("client_id")?,
        vendor_class: row.try_get("vendor_class")?,
        user_class: row.try_get("user_class")?,
        allocated_by: row.try_get("allocated_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation, StoreError> {
    let mac: String = row.try_get("mac")?;
    let ip: String = row.try_get("ip")?;
    let subnet: String = row.try_get("subnet")?;
    Ok(Reservation {
        id: row.try_get("id")?,
        mac: parse_mac(&mac)?,
        ip: parse_ip(&ip)?,
        hostname: row.try_get("hostname")?,
        subnet: parse_subnet(&subnet)?,
        description: row.try_get("description")?,
        tftp_server: row.try_get("tftp_server")?,
        boot_filename: row.try_get("boot_filename")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_sync_log(row: &PgRow) -> Result<GitSyncLog, StoreError> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("triggered_by")?;
    let changes: Option<String> = row.try_get("changes_applied")?;
    let changes_applied = match changes {
        Some(text) => serde_json::from_str(&text)
            .map_err(|err| StoreError::Decode(format!("bad changes_applied json: {err}")))?,
        None => serde_json::Value::Null,
    };
    Ok(GitSyncLog {
        id: row.try_get("id")?,
        sync_started_at: row.try_get("sync_started_at")?,
        sync_completed_at: row.try_get("sync_completed_at")?,
        status: status.parse()?,
        commit_hash: row.try_get("commit_hash")?,
        commit_message: row.try_get("commit_message")?,
        commit_author: row.try_get("commit_author")?,
        commit_timestamp: row.try_get("commit_timestamp")?,
        error_message: row.try_get("error_message")?,
        changes_applied,
        triggered_by: trigger.parse()?,
        triggered_by_user: row.try_get("triggered_by_user")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Storage for PgStore {
    async fn lease_by_mac(
        &self,
        mac: MacAddr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError> {
        let query = format!(
            "SELECT {LEASE_COLUMNS} FROM leases \
             WHERE mac = $1::macaddr AND subnet = $2::cidr AND state = 'active' \
             ORDER BY expires_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(mac.to_string())
            .bind(subnet.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lease).transpose()
    }

    async fn lease_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Lease>, StoreError> {
        let query = format!(
            "SELECT {LEASE_COLUMNS} FROM leases \
             WHERE ip = $1::inet AND subnet = $2::cidr \
             ORDER BY expires_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(ip.to_string())
            .bind(subnet.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lease).transpose()
    }

    async fn create_lease(&self, lease: NewLease) -> Result<Lease, StoreError> {
        let row = sqlx::query(
            "INSERT INTO leases (ip, mac, hostname, subnet, issued_at, expires_at, last_seen, \
                                 state, client_id, vendor_class, user_class, allocated_by) \
             VALUES ($1::inet, $2::macaddr, $3, $4::cidr, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING id, created_at, updated_at",
        )
        .bind(lease.ip.to_string())
        .bind(lease.mac.to_string())
        .bind(&lease.hostname)
        .bind(lease.subnet.to_string())
        .bind(lease.issued_at)
        .bind(lease.expires_at)
        .bind(lease.last_seen)
        .bind(lease.state.as_str())
        .bind(&lease.client_id)
        .bind(&lease.vendor_class)
        .bind(&lease.user_class)
        .bind(&lease.allocated_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(Lease {
            id: row.try_get("id")?,
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
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let row = sqlx::query(
            "UPDATE leases \
             SET mac = $1::macaddr, hostname = $2, issued_at = $3, expires_at = $4, \
                 last_seen = $5, state = $6, client_id = $7, vendor_class = $8, \
                 user_class = $9, allocated_by = $10 \
             WHERE id = $11 \
             RETURNING updated_at",
        )
        .bind(lease.mac.to_string())
        .bind(&lease.hostname)
        .bind(lease.issued_at)
        .bind(lease.expires_at)
        .bind(lease.last_seen)
        .bind(lease.state.as_str())
        .bind(&lease.client_id)
        .bind(&lease.vendor_class)
        .bind(&lease.user_class)
        .bind(&lease.allocated_by)
        .bind(lease.id)
        .fetch_one(&self.pool)
        .await?;

        let mut updated = lease.clone();
        updated.updated_at = row.try_get("updated_at")?;
        Ok(updated)
    }

    async fn renew_lease(&self, id: i64, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE leases SET expires_at = $1, last_seen = $2, state = 'active' WHERE id = $3",
        )
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE leases SET state = 'released', last_seen = $1 \
             WHERE ip = $2::inet AND subnet = $3::cidr",
        )
        .bind(Utc::now())
        .bind(ip.to_string())
        .bind(subnet.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn decline_lease(&self, ip: Ipv4Addr, subnet: Ipv4Network) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE leases SET state = 'declined', last_seen = $1 \
             WHERE ip = $2::inet AND subnet = $3::cidr",
        )
        .bind(Utc::now())
        .bind(ip.to_string())
        .bind(subnet.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expired_leases(
        &self,
        subnet: Ipv4Network,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        limit: i64,
    ) -> Result<Vec<Lease>, StoreError> {
        let query = format!(
            "SELECT {LEASE_COLUMNS} FROM leases \
             WHERE subnet = $1::cidr \
               AND ip >= $2::inet \
               AND ip <= $3::inet \
               AND state IN ('expired', 'released') \
             ORDER BY expires_at ASC \
             LIMIT $4"
        );
        let rows = sqlx::query(&query)
            .bind(subnet.to_string())
            .bind(range_start.to_string())
            .bind(range_end.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_lease).collect()
    }

    async fn expire_old(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE leases SET state = 'expired' WHERE state = 'active' AND expires_at < $1")
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_old(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let result = sqlx::query(
            "DELETE FROM leases WHERE state IN ('expired', 'released') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn lease_statistics(&self) -> Result<Vec<LeaseStatistics>, StoreError> {
        let rows = sqlx::query(
            "SELECT subnet::text AS subnet, \
                    COUNT(*) FILTER (WHERE state = 'active') AS active, \
                    COUNT(*) FILTER (WHERE state = 'expired') AS expired, \
                    COUNT(*) FILTER (WHERE state = 'released') AS released, \
                    COUNT(*) FILTER (WHERE state = 'declined') AS declined, \
                    MIN(expires_at) FILTER (WHERE state = 'active') AS next_expiry, \
                    MAX(last_seen) AS last_activity \
             FROM leases GROUP BY subnet",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let subnet: String = row.try_get("subnet")?;
                Ok(LeaseStatistics {
                    subnet: parse_subnet(&subnet)?,
                    active: row.try_get("active")?,
                    expired: row.try_get("expired")?,
                    released: row.try_get("released")?,
                    declined: row.try_get("declined")?,
                    next_expiry: row.try_get("next_expiry")?,
                    last_activity: row.try_get("last_activity")?,
                })
            })
            .collect()
    }

    async fn reservation_by_mac(&self, mac: MacAddr) -> Result<Option<Reservation>, StoreError> {
        let query =
            format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE mac = $1::macaddr");
        let row = sqlx::query(&query)
            .bind(mac.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn reservation_by_ip(
        &self,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> Result<Option<Reservation>, StoreError> {
        let query = format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE ip = $1::inet AND subnet = $2::cidr"
        );
        let row = sqlx::query(&query)
            .bind(ip.to_string())
            .bind(subnet.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        let query =
            format!("SELECT {RESERVATION_COLUMNS} FROM reservations ORDER BY subnet, ip");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn create_reservation(&self, res: NewReservation) -> Result<Reservation, StoreError> {
        let row = sqlx::query(
            "INSERT INTO reservations (mac, ip, hostname, subnet, description, tftp_server, boot_filename) \
             VALUES ($1::macaddr, $2::inet, $3, $4::cidr, $5, $6, $7) \
             RETURNING id, created_at, updated_at",
        )
        .bind(res.mac.to_string())
        .bind(res.ip.to_string())
        .bind(&res.hostname)
        .bind(res.subnet.to_string())
        .bind(&res.description)
        .bind(&res.tftp_server)
        .bind(&res.boot_filename)
        .fetch_one(&self.pool)
        .await?;

        Ok(Reservation {
            id: row.try_get("id")?,
            mac: res.mac,
            ip: res.ip,
            hostname: res.hostname,
            subnet: res.subnet,
            description: res.description,
            tftp_server: res.tftp_server,
            boot_filename: res.boot_filename,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn update_reservation(&self, res: &Reservation) -> Result<Reservation, StoreError> {
        let row = sqlx::query(
            "UPDATE reservations \
             SET ip = $1::inet, hostname = $2, subnet = $3::cidr, description = $4, \
                 tftp_server = $5, boot_filename = $6 \
             WHERE id = $7 \
             RETURNING updated_at",
        )
        .bind(res.ip.to_string())
        .bind(&res.hostname)
        .bind(res.subnet.to_string())
        .bind(&res.description)
        .bind(&res.tftp_server)
        .bind(&res.boot_filename)
        .bind(res.id)
        .fetch_one(&self.pool)
        .await?;

        let mut updated = res.clone();
        updated.updated_at = row.try_get("updated_at")?;
        Ok(updated)
    }

    async fn delete_reservation(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_sync_log(&self, log: NewSyncLog) -> Result<GitSyncLog, StoreError> {
        let row = sqlx::query(
            "INSERT INTO git_sync_log (sync_started_at, status, triggered_by, triggered_by_user) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, created_at",
        )
        .bind(log.sync_started_at)
        .bind(log.status.as_str())
        .bind(log.triggered_by.as_str())
        .bind(&log.triggered_by_user)
        .fetch_one(&self.pool)
        .await?;

        Ok(GitSyncLog {
            id: row.try_get("id")?,
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
            created_at: row.try_get("created_at")?,
        })
    }

    async fn update_sync_log(&self, log: &GitSyncLog) -> Result<(), StoreError> {
        let changes = if log.changes_applied.is_null() {
            None
        } else {
            Some(log.changes_applied.to_string())
        };
        sqlx::query(
            "UPDATE git_sync_log \
             SET sync_completed_at = $1, status = $2, error_message = $3, \
                 changes_applied = $4::jsonb, commit_hash = $5, commit_message = $6, \
                 commit_author = $7, commit_timestamp = $8 \
             WHERE id = $9",
        )
        .bind(log.sync_completed_at)
        .bind(log.status.as_str())
        .bind(&log.error_message)
        .bind(changes)
        .bind(&log.commit_hash)
        .bind(&log.commit_message)
        .bind(&log.commit_author)
        .bind(log.commit_timestamp)
        .bind(log.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<GitSyncLog>, StoreError> {
        let query = format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM git_sync_log \
             ORDER BY sync_started_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_sync_log).collect()
    }

    async fn active_config(&self) -> Result<Option<ActiveConfig>, StoreError> {
        let row = sqlx::query(
            "SELECT commit_hash, applied_at, config_yaml FROM active_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(ActiveConfig {
                commit_hash: row.try_get("commit_hash")?,
                applied_at: row.try_get("applied_at")?,
                config_yaml: row.try_get("config_yaml")?,
            })
        })
        .transpose()
    }

    async fn set_active_config(
        &self,
        commit_hash: &str,
        config_yaml: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO active_config (id, commit_hash, applied_at, config_yaml) \
             VALUES (1, $1, now(), $2) \
             ON CONFLICT (id) DO UPDATE \
             SET commit_hash = EXCLUDED.commit_hash, applied_at = now(), \
                 config_yaml = EXCLUDED.config_yaml",
        )
        .bind(commit_hash)
        .bind(config_yaml)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: i64) -> Result<LockGuard, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(LockGuard::postgres(conn, key))
    }
}
