use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::{debug, info};

use hg_common::{HwAddr, LeaseEventKind};

use crate::config::ValidatedV4;
use crate::options::{
    DhcpOption, DHCPACK, DHCPDECLINE, DHCPDISCOVER, DHCPNAK, DHCPOFFER, DHCPRELEASE,
    DHCPREQUEST, OPT_HOSTNAME, OPT_RELAY_AGENT_INFO,
};
use crate::packet::{DhcpPacket, BOOTREQUEST, HTYPE_ETHERNET};
use crate::probe;
use crate::store::SharedLeaseStore;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Where the serialized reply is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPeer {
    UnicastIp(SocketAddrV4),
    Broadcast,
    /// L2-unicast to a client that cannot receive IP unicast yet.
    MacUnicast { mac: HwAddr, yiaddr: Ipv4Addr },
}

enum Action {
    Reply,
    Nak,
    Drop,
}

/// The DHCPv4 protocol engine: parses nothing and owns no sockets, it maps
/// one inbound packet to at most one reply plus its peer address.
pub struct Dhcp4Engine {
    cfg: ValidatedV4,
    store: SharedLeaseStore,
}

impl Dhcp4Engine {
    pub fn new(cfg: ValidatedV4, store: SharedLeaseStore) -> Self {
        Self { cfg, store }
    }

    pub fn store(&self) -> &SharedLeaseStore {
        &self.store
    }

    pub fn config(&self) -> &ValidatedV4 {
        &self.cfg
    }

    pub async fn handle_packet(&self, msg: &DhcpPacket) -> Option<(DhcpPacket, ReplyPeer)> {
        if msg.op != BOOTREQUEST || msg.htype != HTYPE_ETHERNET {
            return None;
        }
        let mac = msg.hwaddr().filter(|m| !m.is_zero())?;
        let msg_type = msg.msg_type()?;

        let mut resp = msg.reply_skeleton(self.cfg.server_id);
        let mut events = Vec::new();

        let action = match msg_type {
            DHCPDISCOVER => self.handle_discover(msg, &mac, &mut resp, &mut events).await,
            DHCPREQUEST => self.handle_request(msg, &mac, &mut resp, &mut events).await,
            DHCPDECLINE => self.handle_decline(msg, &mac, &mut resp, &mut events).await,
            DHCPRELEASE => self.handle_release(msg, &mac, &mut resp, &mut events).await,
            other => {
                debug!("Ignoring DHCPv4 message type {other} from {mac}");
                return None;
            }
        };

        // Any store mutation happened under a guard that is dropped by now.
        if !events.is_empty() {
            self.store.publish(&events);
        }

        match action {
            Action::Drop => return None,
            Action::Nak => {
                resp.set_msg_type(DHCPNAK);
                resp.yiaddr = Ipv4Addr::UNSPECIFIED;
            }
            Action::Reply => {
                resp.add_option(DhcpOption::subnet_mask(self.cfg.subnet_mask));
                resp.add_option(DhcpOption::router(self.cfg.gateway));
                resp.add_option(DhcpOption::lease_time(
                    self.cfg.lease_duration.as_secs() as u32
                ));
            }
        }

        // RFC 3046: relay agent information is echoed back unchanged.
        if let Some(relay_info) = msg.get_option(OPT_RELAY_AGENT_INFO) {
            resp.add_option(relay_info.clone());
        }

        self.cfg.policy.apply(msg.param_request_list(), &mut resp.options);

        let peer = route_reply(msg, &mut resp);
        Some((resp, peer))
    }

    async fn handle_discover(
        &self,
        _msg: &DhcpPacket,
        mac: &HwAddr,
        resp: &mut DhcpPacket,
        events: &mut Vec<LeaseEventKind>,
    ) -> Action {
        let mut store = self.store.write().await;

        if let Some(lease) = store.find_by_mac(mac) {
            info!("DHCPDISCOVER from {mac}: offering existing {}", lease.ip);
            if let std::net::IpAddr::V4(ip) = lease.ip {
                resp.yiaddr = ip;
            }
            resp.set_msg_type(DHCPOFFER);
            return Action::Reply;
        }

        loop {
            let Some(lease) = store.reserve(mac) else {
                debug!("DHCPDISCOVER from {mac}: pool exhausted");
                return Action::Drop;
            };
            events.push(LeaseEventKind::DbStore);
            let std::net::IpAddr::V4(ip) = lease.ip else {
                return Action::Drop;
            };

            if probe::ip_in_use(ip, self.cfg.icmp_timeout).await {
                info!("Address {ip} is answering pings, blocking it");
                store.blocklist(lease.ip);
                continue;
            }

            info!("DHCPOFFER {ip} to {mac}");
            events.push(LeaseEventKind::Added);
            resp.yiaddr = ip;
            resp.set_msg_type(DHCPOFFER);
            return Action::Reply;
        }
    }

    /// REQUEST sub-state dispatch per RFC 2131 §4.3.2, keyed on the
    /// (server id, requested IP, ciaddr) tuple.
    async fn handle_request(
        &self,
        msg: &DhcpPacket,
        mac: &HwAddr,
        resp: &mut DhcpPacket,
        events: &mut Vec<LeaseEventKind>,
    ) -> Action {
        let mut store = self.store.write().await;

        let lease_ip = if msg.has_server_id() {
            // SELECTING
            if msg.server_id() != Some(self.cfg.server_id) {
                debug!("DHCPREQUEST from {mac} addressed to another server");
                return Action::Drop;
            }
            let Some(requested) = msg.requested_ip() else {
                return Action::Nak;
            };
            match store.find_by_mac(mac) {
                Some(lease) if lease.ip == std::net::IpAddr::V4(requested) => lease.ip,
                _ => {
                    info!("DHCPNAK: {mac} requested {requested} in SELECTING without a matching lease");
                    return Action::Nak;
                }
            }
        } else if msg.has_requested_ip() {
            // INIT-REBOOT
            let Some(requested) = msg.requested_ip() else {
                return Action::Drop;
            };
            if !self.cfg.subnet_contains(requested) {
                info!("DHCPNAK: {mac} rebooted on the wrong network ({requested})");
                return Action::Nak;
            }
            match store.find_by_mac(mac) {
                None => {
                    debug!("INIT-REBOOT from {mac}: no record, staying silent");
                    return Action::Drop;
                }
                Some(lease) if lease.ip == std::net::IpAddr::V4(requested) => lease.ip,
                Some(_) => return Action::Nak,
            }
        } else if msg.ciaddr != Ipv4Addr::UNSPECIFIED {
            // RENEWING / REBINDING
            match store.find_by_mac(mac) {
                None => {
                    debug!("RENEW from {mac}: no record, staying silent");
                    return Action::Drop;
                }
                Some(lease) if lease.ip == std::net::IpAddr::V4(msg.ciaddr) => lease.ip,
                Some(_) => return Action::Nak,
            }
        } else {
            debug!("DHCPREQUEST from {mac} without server id, requested IP or ciaddr");
            return Action::Drop;
        };

        let std::net::IpAddr::V4(ip) = lease_ip else {
            return Action::Drop;
        };

        let lease = store.find_by_mac(mac).cloned();
        let Some(lease) = lease else {
            return Action::Drop;
        };

        if lease.is_static {
            if !lease.hostname.is_empty() {
                resp.add_option(DhcpOption::client_fqdn(&lease.hostname));
            }
        } else {
            let client_hostname = msg.hostname();
            let committed = store.commit(mac, client_hostname.as_deref());
            events.push(LeaseEventKind::DbStore);
            events.push(LeaseEventKind::Added);

            let wants_hostname = client_hostname.is_some()
                || msg
                    .param_request_list()
                    .is_some_and(|prl| prl.contains(&OPT_HOSTNAME));
            if wants_hostname {
                if let Some(committed) = committed {
                    if !committed.hostname.is_empty() {
                        resp.add_option(DhcpOption::hostname(&committed.hostname));
                    }
                }
            }
        }

        info!("DHCPACK {ip} to {mac}");
        resp.yiaddr = ip;
        resp.ciaddr = msg.ciaddr;
        resp.set_msg_type(DHCPACK);
        Action::Reply
    }

    async fn handle_decline(
        &self,
        msg: &DhcpPacket,
        mac: &HwAddr,
        resp: &mut DhcpPacket,
        events: &mut Vec<LeaseEventKind>,
    ) -> Action {
        let declined = match msg.requested_ip() {
            Some(ip) => ip,
            None if msg.ciaddr != Ipv4Addr::UNSPECIFIED => msg.ciaddr,
            None => return Action::Drop,
        };

        let mut store = self.store.write().await;
        let matching = store
            .find_by_mac(mac)
            .filter(|l| l.ip == std::net::IpAddr::V4(declined))
            .cloned();
        let Some(old) = matching else {
            debug!("DHCPDECLINE from {mac} for {declined}: no matching lease");
            return Action::Drop;
        };
        if old.is_static {
            return Action::Drop;
        }

        info!("DHCPDECLINE from {mac} for {declined}, reallocating");
        store.blocklist(old.ip);
        events.push(LeaseEventKind::DbStore);

        if let Some(fresh) = store.reserve(mac) {
            if !old.hostname.is_empty() {
                store.commit(mac, Some(&old.hostname));
            }
            if let std::net::IpAddr::V4(ip) = fresh.ip {
                resp.yiaddr = ip;
            }
            events.push(LeaseEventKind::Added);
        }

        resp.set_msg_type(DHCPACK);
        Action::Reply
    }

    async fn handle_release(
        &self,
        msg: &DhcpPacket,
        mac: &HwAddr,
        resp: &mut DhcpPacket,
        events: &mut Vec<LeaseEventKind>,
    ) -> Action {
        let released = match msg.requested_ip() {
            Some(ip) => ip,
            None if msg.ciaddr != Ipv4Addr::UNSPECIFIED => msg.ciaddr,
            None => return Action::Drop,
        };

        let removed = {
            let mut store = self.store.write().await;
            store.release(mac, std::net::IpAddr::V4(released))
        };
        if removed > 0 {
            info!("DHCPRELEASE from {mac}: removed {removed} lease(s) for {released}");
            events.push(LeaseEventKind::DbStore);
        }

        resp.set_msg_type(DHCPACK);
        Action::Reply
    }
}

/// Choose the peer the reply is sent to (RFC 2131 §4.1).
pub fn route_reply(msg: &DhcpPacket, resp: &mut DhcpPacket) -> ReplyPeer {
    let is_nak = resp.msg_type() == Some(DHCPNAK);

    if msg.giaddr != Ipv4Addr::UNSPECIFIED {
        // Relayed: the relay agent needs the broadcast flag to deliver a
        // NAK to a client without an address.
        if is_nak {
            resp.set_broadcast();
        }
        return ReplyPeer::UnicastIp(SocketAddrV4::new(msg.giaddr, SERVER_PORT));
    }
    if is_nak {
        return ReplyPeer::Broadcast;
    }
    if msg.ciaddr != Ipv4Addr::UNSPECIFIED {
        return ReplyPeer::UnicastIp(SocketAddrV4::new(msg.ciaddr, CLIENT_PORT));
    }
    if !msg.is_broadcast() {
        if let Some(mac) = msg.hwaddr() {
            if !mac.is_zero() {
                return ReplyPeer::MacUnicast { mac, yiaddr: resp.yiaddr };
            }
        }
    }
    ReplyPeer::Broadcast
}
