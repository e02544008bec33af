//! ember prelude
pub use crate::{
    anyhow::{self, Context, Result},
    dhcproto,
    ipnetwork::Ipv4Network,
    pnet::util::MacAddr,
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{io, net::Ipv4Addr, sync::Arc};
