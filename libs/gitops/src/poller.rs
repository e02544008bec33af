//! Periodic repository polling.
use std::sync::Arc;
use std::time::Duration;

use lease_store::{Storage, StoreError, SyncTrigger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::sync::{SyncOutcome, SyncService};

/// Drives the sync service: one startup sync, then a tick per
/// `poll_interval`. Manual syncs run synchronously through
/// [`Poller::trigger_sync`] and may race a poll sync; the reload callback
/// must tolerate that.
#[derive(Debug)]
pub struct Poller<S> {
    sync: Arc<SyncService<S>>,
    poll_interval: Duration,
}

impl<S: Storage> Poller<S> {
    pub fn new(sync: Arc<SyncService<S>>, poll_interval: Duration) -> Self {
        Self {
            sync,
            poll_interval,
        }
    }

    /// Run until the token is cancelled. The startup sync failing is logged
    /// but never fatal.
    pub async fn run(&self, token: CancellationToken) {
        info!(interval = ?self.poll_interval, "starting config repository poller");

        match self.sync.sync(SyncTrigger::Startup, "").await {
            Ok(outcome) if !outcome.success => {
                error!(error = %outcome.error_message, "initial sync failed");
            }
            Ok(_) => {}
            Err(err) => error!(?err, "initial sync failed"),
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately; the startup sync covered it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("config repository poller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("poll tick, checking repository for updates");
                    match self.sync.sync(SyncTrigger::Poll, "").await {
                        Ok(outcome) if !outcome.success => {
                            error!(error = %outcome.error_message, "sync failed during polling");
                        }
                        Ok(outcome) if outcome.has_changes => {
                            info!(
                                commit = outcome.commit.as_ref().map(|c| c.hash.as_str()).unwrap_or(""),
                                changes = ?outcome.changes_applied,
                                "applied changes from config repository"
                            );
                        }
                        Ok(_) => debug!("no changes in config repository"),
                        Err(err) => error!(?err, "sync failed during polling"),
                    }
                }
            }
        }
    }

    /// Synchronous manual sync on behalf of `user`.
    pub async fn trigger_sync(&self, user: &str) -> Result<SyncOutcome, StoreError> {
        info!(user, "manual sync triggered");
        self.sync.sync(SyncTrigger::Manual, user).await
    }
}
