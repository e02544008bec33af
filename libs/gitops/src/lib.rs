//! # gitops
//!
//! Configuration-as-code pipeline: a [`Repository`] handle over the config
//! repo, a [`SyncService`] that pulls, validates, applies and audits, and a
//! [`Poller`] that drives periodic syncs.
//!
//! The flow per sync attempt: append an `in_progress` audit row, pull,
//! short-circuit when nothing changed, parse + validate the config file,
//! diff reservations against the store by MAC, invoke the reload callback,
//! record the applied configuration, finalize the audit row. Validation or
//! reload failures finalize the row as `failed` and leave the previously
//! active configuration in place.
use thiserror::Error;

pub mod metrics;
pub mod poller;
pub mod repository;
pub mod sync;

pub use poller::Poller;
pub use repository::{CommitInfo, RepoConfig, Repository};
pub use sync::{
    apply_reservations, sync_local_reservations, ReloadFn, ReservationChanges, SyncOutcome,
    SyncService,
};

#[derive(Error, Debug)]
pub enum GitError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("repository not initialized")]
    NotInitialized,
    #[error("git task failed: {0}")]
    Task(String),
}
