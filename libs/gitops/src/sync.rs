//! Sync service: pull → validate → apply → reload, with an audit row per
//! attempt.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use event_bus::Broadcaster;
use lease_store::{
    GitSyncLog, NewReservation, NewSyncLog, Storage, StoreError, SyncStatus, SyncTrigger,
};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::metrics;
use crate::repository::{CommitInfo, Repository};

/// Callback invoked with the newly validated configuration after the
/// reservation diff has been applied. Must be reentrancy-safe: a manual sync
/// may race a poll sync.
pub type ReloadFn = Arc<dyn Fn(&config::Config) -> anyhow::Result<()> + Send + Sync>;

/// Result of one sync attempt. Failures after the audit row exists are
/// reported here (and in the row), not as `Err`; only being unable to write
/// the audit row at all is an error.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub has_changes: bool,
    pub commit: Option<CommitInfo>,
    pub error_message: String,
    pub changes_applied: Map<String, Value>,
}

impl SyncOutcome {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            has_changes: false,
            commit: None,
            error_message: message,
            changes_applied: Map::new(),
        }
    }
}

/// Counts from one reservation diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationChanges {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

pub struct SyncService<S> {
    repo: Arc<Repository>,
    store: Arc<S>,
    reload: Option<ReloadFn>,
    events: Option<Broadcaster>,
    sync_timeout: Duration,
    current_hash: Mutex<Option<String>>,
}

impl<S> std::fmt::Debug for SyncService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService").field("repo", &self.repo).finish()
    }
}

impl<S: Storage> SyncService<S> {
    pub fn new(
        repo: Arc<Repository>,
        store: Arc<S>,
        reload: Option<ReloadFn>,
        events: Option<Broadcaster>,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            store,
            reload,
            events,
            sync_timeout,
            current_hash: Mutex::new(None),
        }
    }

    /// Hash of the last successfully applied commit, if any.
    pub fn current_commit_hash(&self) -> Option<String> {
        self.current_hash.lock().unwrap().clone()
    }

    /// Run one complete sync attempt.
    pub async fn sync(
        &self,
        trigger: SyncTrigger,
        triggered_by_user: &str,
    ) -> Result<SyncOutcome, StoreError> {
        let timer = metrics::GIT_SYNC_DURATION.start_timer();
        let mut log = self
            .store
            .create_sync_log(NewSyncLog {
                sync_started_at: Utc::now(),
                status: SyncStatus::InProgress,
                triggered_by: trigger,
                triggered_by_user: triggered_by_user.to_string(),
            })
            .await?;

        let outcome = self.run(&mut log).await;
        self.finalize(&mut log, &outcome).await;
        timer.observe_duration();
        metrics::GIT_SYNCS
            .with_label_values(&[log.status.as_str()])
            .inc();
        if outcome.success {
            metrics::GIT_SYNC_LAST_SUCCESS.set(Utc::now().timestamp());
        }

        if let Some(events) = &self.events {
            let (hash, message) = outcome
                .commit
                .as_ref()
                .map(|c| (c.hash.as_str(), c.message.as_str()))
                .unwrap_or(("", ""));
            let mut details = Map::new();
            details.insert(
                "changes_applied".into(),
                Value::Object(outcome.changes_applied.clone()),
            );
            events.git_sync(outcome.success, hash, message, details);
        }

        Ok(outcome)
    }

    async fn run(&self, log: &mut GitSyncLog) -> SyncOutcome {
        info!("pulling latest changes from config repository");
        let repo = Arc::clone(&self.repo);
        let pull = tokio::time::timeout(
            self.sync_timeout,
            tokio::task::spawn_blocking(move || repo.pull()),
        )
        .await;
        let (commit, has_changes) = match pull {
            Err(_) => return SyncOutcome::failed("repository pull timed out".into()),
            Ok(Err(join_err)) => {
                return SyncOutcome::failed(format!("repository pull task failed: {join_err}"))
            }
            Ok(Ok(Err(err))) => {
                return SyncOutcome::failed(format!("failed to pull from repository: {err}"))
            }
            Ok(Ok(Ok(pulled))) => pulled,
        };

        log.commit_hash = commit.hash.clone();
        log.commit_message = commit.message.clone();
        log.commit_author = commit.author.clone();
        log.commit_timestamp = commit.timestamp;

        let last_applied = self.current_hash.lock().unwrap().clone();
        if !has_changes && last_applied.as_deref() == Some(commit.hash.as_str()) {
            info!(commit = %commit.hash, "no changes in config repository, skipping sync");
            return SyncOutcome {
                success: true,
                has_changes: false,
                commit: Some(commit),
                error_message: String::new(),
                changes_applied: Map::new(),
            };
        }

        let config_path = self.repo.config_file_path();
        let config_text = match std::fs::read_to_string(&config_path) {
            Ok(text) => text,
            Err(err) => {
                return SyncOutcome {
                    commit: Some(commit),
                    ..SyncOutcome::failed(format!(
                        "config file {} not readable: {err}",
                        config_path.display()
                    ))
                }
            }
        };
        let new_config = match config::Config::parse_str(&config_text) {
            Ok(cfg) => cfg,
            Err(err) => {
                return SyncOutcome {
                    commit: Some(commit),
                    ..SyncOutcome::failed(format!("configuration validation failed: {err:#}"))
                }
            }
        };
        info!("configuration validated successfully");

        let changes = match apply_reservations(self.store.as_ref(), &new_config).await {
            Ok(changes) => changes,
            Err(err) => {
                return SyncOutcome {
                    commit: Some(commit),
                    ..SyncOutcome::failed(format!("failed to apply configuration: {err}"))
                }
            }
        };

        let mut changes_applied = Map::new();
        changes_applied.insert("reservations_added".into(), changes.added.into());
        changes_applied.insert("reservations_updated".into(), changes.updated.into());
        changes_applied.insert("reservations_deleted".into(), changes.deleted.into());
        changes_applied.insert("total_subnets".into(), new_config.subnets.len().into());

        if let Some(reload) = &self.reload {
            info!("reloading server configuration");
            if let Err(err) = reload(&new_config) {
                // reservation changes stay committed; only the reload failed
                return SyncOutcome {
                    commit: Some(commit),
                    ..SyncOutcome::failed(format!("failed to reload configuration: {err:#}"))
                };
            }
            changes_applied.insert("config_reloaded".into(), true.into());
        }

        if let Err(err) = self
            .store
            .set_active_config(&commit.hash, &config_text)
            .await
        {
            warn!(?err, "failed to record active configuration");
        }

        *self.current_hash.lock().unwrap() = Some(commit.hash.clone());
        info!(commit = %commit.hash, "successfully synced configuration");

        SyncOutcome {
            success: true,
            has_changes,
            commit: Some(commit),
            error_message: String::new(),
            changes_applied,
        }
    }

    async fn finalize(&self, log: &mut GitSyncLog, outcome: &SyncOutcome) {
        log.sync_completed_at = Some(Utc::now());
        log.status = if outcome.success {
            SyncStatus::Success
        } else {
            SyncStatus::Failed
        };
        log.error_message = outcome.error_message.clone();
        log.changes_applied = Value::Object(outcome.changes_applied.clone());
        if let Err(err) = self.store.update_sync_log(log).await {
            error!(?err, "failed to update git sync log");
        }
    }
}

/// Diff the configuration's reservations against the store by MAC and apply
/// additions, per-field updates, and deletions.
pub async fn apply_reservations<S: Storage>(
    store: &S,
    cfg: &config::Config,
) -> Result<ReservationChanges, StoreError> {
    let existing = store.all_reservations().await?;
    let mut by_mac: std::collections::HashMap<_, _> =
        existing.into_iter().map(|r| (r.mac, r)).collect();

    let mut changes = ReservationChanges::default();
    for subnet in &cfg.subnets {
        for host in &subnet.reservations {
            let tftp_server = host.boot.as_ref().and_then(|b| b.tftp_server.clone());
            let boot_filename = host.boot.as_ref().and_then(|b| b.filename.clone());

            if let Some(mut current) = by_mac.remove(&host.mac) {
                let dirty = current.ip != host.ip
                    || current.hostname != host.hostname
                    || current.description != host.description
                    || current.tftp_server != tftp_server
                    || current.boot_filename != boot_filename;
                if dirty {
                    current.ip = host.ip;
                    current.hostname = host.hostname.clone();
                    current.subnet = subnet.network;
                    current.description = host.description.clone();
                    current.tftp_server = tftp_server;
                    current.boot_filename = boot_filename;
                    match store.update_reservation(&current).await {
                        Ok(_) => changes.updated += 1,
                        Err(err) => error!(?err, mac = %host.mac, "failed to update reservation"),
                    }
                }
            } else {
                let new = NewReservation {
                    mac: host.mac,
                    ip: host.ip,
                    hostname: host.hostname.clone(),
                    subnet: subnet.network,
                    description: host.description.clone(),
                    tftp_server,
                    boot_filename,
                };
                match store.create_reservation(new).await {
                    Ok(_) => changes.added += 1,
                    Err(err) => error!(?err, mac = %host.mac, "failed to create reservation"),
                }
            }
        }
    }

    // anything left in the map is absent from the new configuration
    for (_, stale) in by_mac {
        match store.delete_reservation(stale.id).await {
            Ok(()) => changes.deleted += 1,
            Err(err) => error!(?err, mac = %stale.mac, "failed to delete reservation"),
        }
    }

    info!(
        added = changes.added,
        updated = changes.updated,
        deleted = changes.deleted,
        "synced reservations"
    );
    Ok(changes)
}

/// One-shot reservation sync from the local configuration, used at startup
/// when GitOps is disabled. Subnet runtime state is not touched; it comes
/// straight from the configuration handed to the server.
pub async fn sync_local_reservations<S: Storage>(
    store: &S,
    cfg: &config::Config,
) -> Result<ReservationChanges, StoreError> {
    info!("syncing reservations from local config to database");
    apply_reservations(store, cfg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testutil::{commit_file, init_source_repo};
    use crate::repository::RepoConfig;
    use config::GitAuth;
    use lease_store::MemoryStore;
    use pnet::util::MacAddr;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn config_yaml(reservations: &str) -> String {
        format!(
            r#"
server:
  interfaces: [{{ name: eth0 }}]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 192.168.1.0/24
    gateway: 192.168.1.1
    pools:
      - range_start: 192.168.1.100
        range_end: 192.168.1.200
    reservations:
{reservations}
"#
        )
    }

    const RESERVATIONS_V1: &str = r#"
      - hostname: printer
        mac: aa:bb:cc:dd:ee:01
        ip: 192.168.1.50
      - hostname: camera
        mac: aa:bb:cc:dd:ee:02
        ip: 192.168.1.51
"#;

    // printer renamed, camera gone, scanner new
    const RESERVATIONS_V2: &str = r#"
      - hostname: printer-lobby
        mac: aa:bb:cc:dd:ee:01
        ip: 192.168.1.50
      - hostname: scanner
        mac: aa:bb:cc:dd:ee:03
        ip: 192.168.1.52
"#;

    #[tokio::test]
    async fn reservation_diff_counts_adds_updates_deletes() {
        let store = MemoryStore::new();
        let v1 = config::Config::parse_str(&config_yaml(RESERVATIONS_V1)).unwrap();
        let changes = apply_reservations(&store, &v1).await.unwrap();
        assert_eq!(
            changes,
            ReservationChanges {
                added: 2,
                updated: 0,
                deleted: 0
            }
        );

        let v2 = config::Config::parse_str(&config_yaml(RESERVATIONS_V2)).unwrap();
        let changes = apply_reservations(&store, &v2).await.unwrap();
        assert_eq!(
            changes,
            ReservationChanges {
                added: 1,
                updated: 1,
                deleted: 1
            }
        );

        let all = store.all_reservations().await.unwrap();
        assert_eq!(all.len(), 2);
        let printer = store
            .reservation_by_mac("aa:bb:cc:dd:ee:01".parse::<MacAddr>().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(printer.hostname, "printer-lobby");
        assert!(store
            .reservation_by_mac("aa:bb:cc:dd:ee:02".parse::<MacAddr>().unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reapplying_identical_config_changes_nothing() {
        let store = MemoryStore::new();
        let v1 = config::Config::parse_str(&config_yaml(RESERVATIONS_V1)).unwrap();
        apply_reservations(&store, &v1).await.unwrap();
        let changes = apply_reservations(&store, &v1).await.unwrap();
        assert_eq!(changes, ReservationChanges::default());
    }

    #[tokio::test]
    async fn removing_reservation_round_trips() {
        let store = MemoryStore::new();
        let with = config::Config::parse_str(&config_yaml(RESERVATIONS_V1)).unwrap();
        let without = config::Config::parse_str(&config_yaml("      []\n")).unwrap();

        apply_reservations(&store, &with).await.unwrap();
        apply_reservations(&store, &without).await.unwrap();
        assert!(store.all_reservations().await.unwrap().is_empty());
        let changes = apply_reservations(&store, &with).await.unwrap();
        assert_eq!(changes.added, 2);
    }

    fn service(
        source: &TempDir,
        clone: &TempDir,
        store: Arc<MemoryStore>,
        reload: Option<ReloadFn>,
    ) -> SyncService<MemoryStore> {
        let repo = Arc::new(Repository::new(RepoConfig {
            url: source.path().to_str().unwrap().to_string(),
            branch: "main".into(),
            local_path: clone.path().join("checkout"),
            auth: GitAuth::None,
            config_path: "dhcp.yaml".into(),
        }));
        repo.initialize().unwrap();
        SyncService::new(repo, store, reload, None, Duration::from_secs(30))
    }

    #[tokio::test]
    #[traced_test]
    async fn sync_applies_and_audits() {
        let source = TempDir::new().unwrap();
        let clone = TempDir::new().unwrap();
        let src_repo = init_source_repo(source.path());
        commit_file(
            &src_repo,
            "dhcp.yaml",
            &config_yaml(RESERVATIONS_V1),
            "add reservations",
        );

        let store = Arc::new(MemoryStore::new());
        let reloads = Arc::new(AtomicUsize::new(0));
        let reload: ReloadFn = {
            let reloads = Arc::clone(&reloads);
            Arc::new(move |_cfg| {
                reloads.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let service = service(&source, &clone, Arc::clone(&store), Some(reload));

        let outcome = service.sync(SyncTrigger::Startup, "").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.changes_applied["reservations_added"], 2);
        assert_eq!(outcome.changes_applied["total_subnets"], 1);
        assert_eq!(outcome.changes_applied["config_reloaded"], true);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(store.all_reservations().await.unwrap().len(), 2);

        let logs = store.recent_sync_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Success);
        assert_eq!(logs[0].triggered_by, SyncTrigger::Startup);
        assert!(!logs[0].commit_hash.is_empty());
        assert!(logs[0].sync_completed_at.is_some());

        let active = store.active_config().await.unwrap().unwrap();
        assert_eq!(active.commit_hash, logs[0].commit_hash);
        assert_eq!(
            service.current_commit_hash().as_deref(),
            Some(logs[0].commit_hash.as_str())
        );

        // a second sync with no new commits short-circuits
        let outcome = service.sync(SyncTrigger::Poll, "").await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.has_changes);
        assert!(outcome.changes_applied.is_empty());
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_config_fails_sync_and_keeps_store() {
        let source = TempDir::new().unwrap();
        let clone = TempDir::new().unwrap();
        let src_repo = init_source_repo(source.path());
        commit_file(
            &src_repo,
            "dhcp.yaml",
            &config_yaml(RESERVATIONS_V1),
            "good config",
        );

        let store = Arc::new(MemoryStore::new());
        let service = service(&source, &clone, Arc::clone(&store), None);
        assert!(service.sync(SyncTrigger::Startup, "").await.unwrap().success);

        commit_file(&src_repo, "dhcp.yaml", "subnets: []\n", "broken config");
        let outcome = service.sync(SyncTrigger::Manual, "alice").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_message.contains("validation failed"));
        // prior reservations remain
        assert_eq!(store.all_reservations().await.unwrap().len(), 2);

        let logs = store.recent_sync_logs(10).await.unwrap();
        assert_eq!(logs[0].status, SyncStatus::Failed);
        assert_eq!(logs[0].triggered_by, SyncTrigger::Manual);
        assert_eq!(logs[0].triggered_by_user, "alice");
    }

    #[tokio::test]
    async fn reload_failure_fails_sync_but_keeps_reservation_writes() {
        let source = TempDir::new().unwrap();
        let clone = TempDir::new().unwrap();
        let src_repo = init_source_repo(source.path());
        commit_file(
            &src_repo,
            "dhcp.yaml",
            &config_yaml(RESERVATIONS_V1),
            "config",
        );

        let store = Arc::new(MemoryStore::new());
        let reload: ReloadFn = Arc::new(|_cfg| anyhow::bail!("listener rebind failed"));
        let service = service(&source, &clone, Arc::clone(&store), Some(reload));

        let outcome = service.sync(SyncTrigger::Poll, "").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_message.contains("reload"));
        // the diff was already committed and is not rolled back
        assert_eq!(store.all_reservations().await.unwrap().len(), 2);
        let logs = store.recent_sync_logs(10).await.unwrap();
        assert_eq!(logs[0].status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn local_reservation_sync_applies_diff() {
        let store = MemoryStore::new();
        let cfg = config::Config::parse_str(&config_yaml(RESERVATIONS_V1)).unwrap();
        let changes = sync_local_reservations(&store, &cfg).await.unwrap();
        assert_eq!(changes.added, 2);
        let res = store
            .reservation_by_ip(Ipv4Addr::new(192, 168, 1, 50), "192.168.1.0/24".parse().unwrap())
            .await
            .unwrap();
        assert!(res.is_some());
    }
}
