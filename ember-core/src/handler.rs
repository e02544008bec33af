//! DHCPv4 message-type state machine.
//!
//! The handler is stateless and idempotent over packets; per-client state
//! lives only in the lease store, so any worker (on any node) can process
//! any packet.
use std::net::Ipv4Addr;
use std::time::Duration;

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use event_bus::{Broadcaster, EventType};
use lease_store::{Reservation, Storage, StoreError};
use pnet::util::MacAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::{AllocationError, AllocationRequest, Allocator};
use crate::metrics;
use crate::server::subnets::{Subnet, SubnetTable};

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Packet-level entry point; one instance serves every worker task.
pub struct Handler<S> {
    store: std::sync::Arc<S>,
    allocator: Allocator<S>,
    subnets: SubnetTable,
    events: Broadcaster,
}

impl<S> std::fmt::Debug for Handler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish()
    }
}

impl<S: Storage> Handler<S> {
    pub fn new(
        store: std::sync::Arc<S>,
        allocator: Allocator<S>,
        subnets: SubnetTable,
        events: Broadcaster,
    ) -> Self {
        Self {
            store,
            allocator,
            subnets,
            events,
        }
    }

    /// Dispatch one request; `Ok(None)` means no reply is sent (DHCP is
    /// tolerant of drops).
    pub async fn handle(&self, req: &Message) -> Result<Option<Message>, HandlerError> {
        let msg_type = req.opts().msg_type();
        metrics::DHCP_REQUESTS
            .with_label_values(&[type_label(msg_type)])
            .inc();

        let Some(mac) = client_mac(req) else {
            debug!("dropping message with malformed chaddr");
            return Ok(None);
        };
        debug!(
            msg_type = ?msg_type,
            %mac,
            xid = req.xid(),
            giaddr = %req.giaddr(),
            ciaddr = %req.ciaddr(),
            "received DHCP message"
        );

        match msg_type {
            Some(MessageType::Discover) => self.discover(req, mac).await,
            Some(MessageType::Request) => self.request(req, mac).await,
            Some(MessageType::Release) => self.release(req, mac).await,
            Some(MessageType::Decline) => self.decline(req, mac).await,
            Some(MessageType::Inform) => self.inform(req, mac).await,
            other => {
                debug!(msg_type = ?other, "unsupported message type, dropping");
                Ok(None)
            }
        }
    }

    async fn discover(&self, req: &Message, mac: MacAddr) -> Result<Option<Message>, HandlerError> {
        let Some(subnet) = self.resolve_subnet(req) else {
            return Ok(None);
        };

        let lease_duration = subnet.effective_lease(requested_lease_time(req));
        let alloc_req = self.allocation_request(req, mac, &subnet, lease_duration);
        let lease = match self.allocator.allocate(&alloc_req).await {
            Ok(lease) => lease,
            Err(AllocationError::PoolExhausted) => {
                metrics::POOL_EXHAUSTED.inc();
                metrics::DHCP_ERRORS.with_label_values(&["allocation"]).inc();
                warn!(%mac, subnet = %subnet.network, "no address available, dropping DISCOVER");
                return Ok(None);
            }
            Err(err) => {
                metrics::DHCP_ERRORS.with_label_values(&["allocation"]).inc();
                return Err(err.into());
            }
        };
        info!(%mac, ip = %lease.ip, subnet = %subnet.network, "allocated address for DISCOVER");
        self.publish(EventType::DhcpDiscover, lease.ip, mac, req, &subnet);

        let mut resp = base_reply(req, MessageType::Offer, subnet.gateway);
        resp.set_yiaddr(lease.ip);

        // per-host PXE overrides come from the reservation, when one exists
        let reservation = self.store.reservation_by_mac(mac).await.ok().flatten();
        add_options(&mut resp, &subnet, reservation.as_ref(), lease_duration);

        self.publish(EventType::DhcpOffer, lease.ip, mac, req, &subnet);
        metrics::DHCP_RESPONSES.with_label_values(&["offer"]).inc();
        Ok(Some(resp))
    }

    async fn request(&self, req: &Message, mac: MacAddr) -> Result<Option<Message>, HandlerError> {
        let Some(subnet) = self.resolve_subnet(req) else {
            return Ok(None);
        };

        // option 50 wins, ciaddr covers renewals
        let requested_ip = requested_ip(req).or_else(|| {
            let ciaddr = req.ciaddr();
            (!ciaddr.is_unspecified()).then_some(ciaddr)
        });
        let Some(requested_ip) = requested_ip else {
            return Ok(Some(self.nak(req, mac, &subnet, "No IP address requested")));
        };
        if !subnet.network.contains(requested_ip) {
            warn!(%requested_ip, subnet = %subnet.network, "requested address outside subnet");
            return Ok(Some(self.nak(
                req,
                mac,
                &subnet,
                "Requested IP address not in subnet",
            )));
        }

        let lease_duration = subnet.effective_lease(requested_lease_time(req));
        match self.store.lease_by_ip(requested_ip, subnet.network).await? {
            Some(lease) if lease.mac != mac => {
                warn!(
                    %requested_ip,
                    lease_mac = %lease.mac,
                    request_mac = %mac,
                    "MAC mismatch for requested address"
                );
                return Ok(Some(self.nak(
                    req,
                    mac,
                    &subnet,
                    "IP already allocated to another client",
                )));
            }
            Some(_) => {
                match self
                    .allocator
                    .renew(mac, requested_ip, subnet.network, lease_duration)
                    .await
                {
                    Ok(()) => info!(%mac, ip = %requested_ip, "renewed lease"),
                    Err(AllocationError::MacMismatch) => {
                        // the owner changed between the lookup and the lock
                        return Ok(Some(self.nak(
                            req,
                            mac,
                            &subnet,
                            "IP already allocated to another client",
                        )));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => {
                let alloc_req = self.allocation_request(req, mac, &subnet, lease_duration);
                let lease = match self.allocator.allocate(&alloc_req).await {
                    Ok(lease) => lease,
                    Err(AllocationError::PoolExhausted) => {
                        metrics::POOL_EXHAUSTED.inc();
                        metrics::DHCP_ERRORS.with_label_values(&["allocation"]).inc();
                        warn!(%mac, "no address available, dropping REQUEST");
                        return Ok(None);
                    }
                    Err(err) => {
                        metrics::DHCP_ERRORS.with_label_values(&["allocation"]).inc();
                        return Err(err.into());
                    }
                };
                if lease.ip != requested_ip {
                    warn!(%requested_ip, allocated_ip = %lease.ip, "allocated address differs from requested");
                }
                info!(%mac, ip = %lease.ip, "created new lease for REQUEST");
            }
        }

        let mut resp = base_reply(req, MessageType::Ack, subnet.gateway);
        if !req.giaddr().is_unspecified() {
            // relayed replies travel back via broadcast on the far segment
            resp.set_flags(req.flags().set_broadcast());
        }
        resp.set_yiaddr(requested_ip);

        let reservation = self.store.reservation_by_mac(mac).await.ok().flatten();
        add_options(&mut resp, &subnet, reservation.as_ref(), lease_duration);

        self.publish(EventType::DhcpRequest, requested_ip, mac, req, &subnet);
        self.publish(EventType::DhcpAck, requested_ip, mac, req, &subnet);
        metrics::DHCP_RESPONSES.with_label_values(&["ack"]).inc();
        Ok(Some(resp))
    }

    async fn release(&self, req: &Message, mac: MacAddr) -> Result<Option<Message>, HandlerError> {
        let Some(subnet) = self.resolve_subnet(req) else {
            return Ok(None);
        };
        let ip = req.ciaddr();
        self.allocator.release(ip, subnet.network).await?;
        info!(%mac, %ip, "released lease");
        self.publish(EventType::DhcpRelease, ip, mac, req, &subnet);
        // RELEASE has no reply
        Ok(None)
    }

    async fn decline(&self, req: &Message, mac: MacAddr) -> Result<Option<Message>, HandlerError> {
        let Some(subnet) = self.resolve_subnet(req) else {
            return Ok(None);
        };
        let Some(declined_ip) = requested_ip(req) else {
            warn!(%mac, "DECLINE without option 50 (requested IP), dropping");
            return Ok(None);
        };
        self.allocator.decline(declined_ip, subnet.network).await?;
        warn!(%mac, ip = %declined_ip, "client declined address (conflict reported)");
        self.publish(EventType::DhcpDecline, declined_ip, mac, req, &subnet);
        // DECLINE has no reply
        Ok(None)
    }

    async fn inform(&self, req: &Message, mac: MacAddr) -> Result<Option<Message>, HandlerError> {
        let Some(subnet) = self.resolve_subnet(req) else {
            return Ok(None);
        };
        // options only, no lease; yiaddr stays 0.0.0.0
        let mut resp = base_reply(req, MessageType::Ack, subnet.gateway);
        add_options(&mut resp, &subnet, None, subnet.lease_duration);
        info!(%mac, "answered INFORM");
        metrics::DHCP_RESPONSES.with_label_values(&["ack"]).inc();
        Ok(Some(resp))
    }

    fn nak(&self, req: &Message, mac: MacAddr, subnet: &Subnet, reason: &str) -> Message {
        let mut resp = base_reply(req, MessageType::Nak, subnet.gateway);
        resp.opts_mut()
            .insert(DhcpOption::Message(reason.to_string()));
        info!(%mac, reason, "sending NAK");
        let ip = requested_ip(req).unwrap_or_else(|| req.ciaddr());
        self.publish(EventType::DhcpNak, ip, mac, req, subnet);
        metrics::DHCP_RESPONSES.with_label_values(&["nak"]).inc();
        resp
    }

    fn resolve_subnet(&self, req: &Message) -> Option<Subnet> {
        match self.subnets.resolve(req.giaddr(), req.ciaddr()) {
            Some(subnet) => Some(subnet),
            None => {
                metrics::DHCP_ERRORS
                    .with_label_values(&["subnet_unresolved"])
                    .inc();
                warn!(
                    giaddr = %req.giaddr(),
                    ciaddr = %req.ciaddr(),
                    subnets = self.subnets.len(),
                    "cannot determine subnet for message, dropping"
                );
                None
            }
        }
    }

    fn allocation_request(
        &self,
        req: &Message,
        mac: MacAddr,
        subnet: &Subnet,
        lease_duration: Duration,
    ) -> AllocationRequest {
        AllocationRequest {
            mac,
            hostname: opt_hostname(req),
            subnet: subnet.network,
            pools: subnet.pools.clone(),
            lease_duration,
            client_id: opt_bytes(req, OptionCode::ClientIdentifier),
            vendor_class: opt_bytes(req, OptionCode::ClassIdentifier),
            user_class: opt_bytes(req, OptionCode::from(77)),
        }
    }

    fn publish(&self, kind: EventType, ip: Ipv4Addr, mac: MacAddr, req: &Message, subnet: &Subnet) {
        let hostname = String::from_utf8_lossy(&opt_hostname(req)).into_owned();
        let mut details = serde_json::Map::new();
        details.insert("subnet".into(), subnet.network.to_string().into());
        self.events.dhcp_event(kind, ip, mac, &hostname, details);
    }
}

/// Reply skeleton: BOOTREPLY with xid/flags/chaddr copied from the request
/// and giaddr preserved for the relay return path.
fn base_reply(req: &Message, msg_type: MessageType, siaddr: Ipv4Addr) -> Message {
    let mut msg = Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        siaddr,
        req.giaddr(),
        req.chaddr(),
    );
    msg.set_opcode(Opcode::BootReply)
        .set_htype(req.htype())
        .set_flags(req.flags());
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg
}

/// Standard option set, with reservation PXE fields overriding the subnet's
/// per field.
fn add_options(
    resp: &mut Message,
    subnet: &Subnet,
    reservation: Option<&Reservation>,
    lease_duration: Duration,
) {
    let opts = resp.opts_mut();
    opts.insert(DhcpOption::AddressLeaseTime(lease_duration.as_secs() as u32));
    if !subnet.gateway.is_unspecified() {
        opts.insert(DhcpOption::Router(vec![subnet.gateway]));
    }
    if !subnet.dns_servers.is_empty() {
        opts.insert(DhcpOption::DomainNameServer(subnet.dns_servers.clone()));
    }
    opts.insert(DhcpOption::SubnetMask(subnet.network.mask()));
    if let Some(domain) = subnet.options.get("domain_name") {
        opts.insert(DhcpOption::DomainName(domain.clone()));
    }
    opts.insert(DhcpOption::ServerIdentifier(subnet.gateway));

    let mut tftp_server = subnet.tftp_server.clone();
    let mut boot_filename = subnet.boot_filename.clone();
    if let Some(reservation) = reservation {
        if let Some(tftp) = &reservation.tftp_server {
            if !tftp.is_empty() {
                tftp_server = Some(tftp.clone());
            }
        }
        if let Some(filename) = &reservation.boot_filename {
            if !filename.is_empty() {
                boot_filename = Some(filename.clone());
            }
        }
    }
    // option 66: TFTP server name
    if let Some(tftp) = tftp_server.filter(|s| !s.is_empty()) {
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::from(66),
            tftp.into_bytes(),
        )));
    }
    // option 67: bootfile name
    if let Some(filename) = boot_filename.filter(|s| !s.is_empty()) {
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::from(67),
            filename.into_bytes(),
        )));
    }
}

fn client_mac(req: &Message) -> Option<MacAddr> {
    let chaddr = req.chaddr();
    if chaddr.len() < 6 {
        return None;
    }
    Some(MacAddr::new(
        chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5],
    ))
}

fn requested_ip(req: &Message) -> Option<Ipv4Addr> {
    match req.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) if !ip.is_unspecified() => Some(*ip),
        _ => None,
    }
}

fn requested_lease_time(req: &Message) -> Option<Duration> {
    match req.opts().get(OptionCode::AddressLeaseTime) {
        Some(DhcpOption::AddressLeaseTime(secs)) => Some(Duration::from_secs(u64::from(*secs))),
        _ => None,
    }
}

fn opt_hostname(req: &Message) -> Vec<u8> {
    match req.opts().get(OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) => name.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn opt_bytes(req: &Message, code: OptionCode) -> Vec<u8> {
    match req.opts().get(code) {
        Some(DhcpOption::ClientIdentifier(bytes)) => bytes.clone(),
        Some(DhcpOption::ClassIdentifier(bytes)) => bytes.clone(),
        Some(DhcpOption::Unknown(opt)) => opt.data().to_vec(),
        _ => Vec::new(),
    }
}

fn type_label(msg_type: Option<MessageType>) -> &'static str {
    match msg_type {
        Some(MessageType::Discover) => "discover",
        Some(MessageType::Offer) => "offer",
        Some(MessageType::Request) => "request",
        Some(MessageType::Ack) => "ack",
        Some(MessageType::Nak) => "nak",
        Some(MessageType::Release) => "release",
        Some(MessageType::Decline) => "decline",
        Some(MessageType::Inform) => "inform",
        _ => "unknown",
    }
}
