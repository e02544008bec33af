//! # Server
//!
//! Binds UDP/67, decodes datagrams, and spawns one worker task per packet.
//! Workers may run in parallel; ordering between two packets from the same
//! client is not guaranteed. Shutdown drains in-flight workers within a
//! bounded grace period.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dhcproto::v4::{self, CLIENT_PORT, SERVER_PORT};
use dhcproto::{Decodable, Decoder, Encodable};
use lease_store::Storage;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub mod shutdown;
pub mod subnets;

use crate::handler::Handler;
use crate::metrics;
use shutdown::Shutdown;
use subnets::{Subnet, SubnetTable};

/// grace period for draining workers on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The DHCPv4 listener.
#[derive(Debug)]
pub struct Server<S> {
    handler: Arc<Handler<S>>,
    subnets: SubnetTable,
    addr: SocketAddr,
    grace: Duration,
}

/// One packet being processed to completion.
struct RunTask<S> {
    handler: Arc<Handler<S>>,
    soc: Arc<UdpSocket>,
    msg: v4::Message,
    peer: SocketAddr,
    shutdown: Shutdown,
    /// used to determine when all tasks have exited
    _done: mpsc::Sender<()>,
}

impl<S: Storage> Server<S> {
    pub fn new(addr: SocketAddr, subnets: SubnetTable, handler: Arc<Handler<S>>) -> Self {
        Self {
            handler,
            subnets,
            addr,
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn subnets(&self) -> &SubnetTable {
        &self.subnets
    }

    /// Hot-swap the subnet map. In-flight handlers that captured the prior
    /// map run to completion against it.
    pub fn reload_subnets(&self, subnets: Vec<Subnet>) {
        info!(count = subnets.len(), "reloading subnet configuration");
        self.subnets.replace(subnets);
    }

    /// Bind and serve until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let socket = create_socket(self.addr)?;
        self.serve(socket, token).await
    }

    pub(crate) async fn serve(&self, socket: UdpSocket, token: CancellationToken) -> Result<()> {
        let soc = Arc::new(socket);
        info!(addr = %soc.local_addr()?, subnets = self.subnets.len(), "DHCP server listening");

        let (notify_shutdown, _) = broadcast::channel::<()>(1);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                recv = soc.recv_from(&mut buf) => {
                    let (len, peer) = match recv {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(?err, "error receiving datagram");
                            continue;
                        }
                    };
                    let msg = match v4::Message::decode(&mut Decoder::new(&buf[..len])) {
                        Ok(msg) => msg,
                        Err(err) => {
                            debug!(?err, %peer, "dropping undecodable datagram");
                            continue;
                        }
                    };
                    metrics::IN_FLIGHT.inc();
                    let task = RunTask {
                        handler: Arc::clone(&self.handler),
                        soc: Arc::clone(&soc),
                        msg,
                        peer,
                        shutdown: Shutdown::new(notify_shutdown.subscribe()),
                        _done: done_tx.clone(),
                    };
                    tokio::spawn(task.run());
                }
            }
        }

        info!("notifying workers of shutdown");
        // dropping the broadcast sender signals every worker; dropping our
        // mpsc sender lets recv() below complete once all workers are gone
        drop(notify_shutdown);
        drop(done_tx);
        if time::timeout(self.grace, done_rx.recv()).await.is_err() {
            error!(grace = ?self.grace, "workers did not finish within grace period, exiting anyway");
        } else {
            info!("all workers finished cleanly");
        }
        Ok(())
    }
}

impl<S: Storage> RunTask<S> {
    async fn run(self) {
        let RunTask {
            handler,
            soc,
            msg,
            peer,
            mut shutdown,
            _done,
        } = self;

        tokio::select! {
            _ = shutdown.recv() => {
                trace!("task received shutdown notifier");
            }
            _ = async {
                match handler.handle(&msg).await {
                    Ok(Some(resp)) => {
                        let dst = resp_addr(&msg, peer);
                        match resp.to_vec() {
                            Ok(bytes) => {
                                if let Err(err) = soc.send_to(&bytes, dst).await {
                                    error!(?err, %dst, "failed to send reply");
                                }
                            }
                            Err(err) => error!(?err, "failed to encode reply"),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        metrics::DHCP_ERRORS.with_label_values(&["handler"]).inc();
                        warn!(?err, "error handling message, dropping");
                    }
                }
            } => {}
        }
        metrics::IN_FLIGHT.dec();
    }
}

/// Where a reply goes: back through the relay, unicast to a client that has
/// an address, otherwise broadcast on the local segment.
fn resp_addr(req: &v4::Message, peer: SocketAddr) -> SocketAddr {
    if !req.giaddr().is_unspecified() {
        return SocketAddr::new(IpAddr::V4(req.giaddr()), SERVER_PORT);
    }
    if !req.ciaddr().is_unspecified() {
        return SocketAddr::new(IpAddr::V4(req.ciaddr()), CLIENT_PORT);
    }
    if peer.ip().is_unspecified() || req.flags().broadcast() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), CLIENT_PORT);
    }
    peer
}

fn create_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
    socket
        .set_reuse_address(true)
        .context("failed to set_reuse_address")?;
    socket
        .set_broadcast(true)
        .context("failed to set_broadcast")?;
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking mode on socket")?;
    socket
        .bind(&addr.into())
        .context("failed to bind socket")?;
    Ok(UdpSocket::from_std(socket.into())?)
}
