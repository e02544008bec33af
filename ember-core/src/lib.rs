//! # ember-core
//!
//! The DHCPv4 engine: UDP listener, message-type state machine, IP
//! allocator, and lease expiry sweeper. Persistence and cross-node
//! coordination live in `lease-store`; this crate is generic over its
//! [`lease_store::Storage`] trait.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

pub use anyhow;
pub use chrono;
pub use dhcproto;
pub use ipnetwork;
pub use pnet;
pub use tokio;
pub use tracing;

pub use crate::server::Server;

pub mod allocator;
pub mod config;
pub mod handler;
pub mod metrics;
pub mod prelude;
pub mod server;
pub mod sweeper;
