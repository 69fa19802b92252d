use std::net::IpAddr;

use chrono::Utc;
use tracing::{debug, info};

use hg_common::{HwAddr, LeaseEventKind};

use crate::config::ValidatedV6;
use crate::duid;
use crate::message::{
    V6Message, MSG_ADVERTISE, MSG_CONFIRM, MSG_DECLINE, MSG_REBIND, MSG_RELEASE, MSG_RENEW,
    MSG_REPLY, MSG_REQUEST, MSG_SOLICIT,
};
use crate::options::{
    IaAddr, IaNa, V6Option, OPTION_CLIENTID, OPTION_DNS_SERVERS, OPTION_RAPID_COMMIT,
    OPTION_SERVERID,
};
use crate::store::SharedLeaseStoreV6;

/// The DHCPv6 protocol engine (RFC 8415). Holds the server DUID generated
/// at startup and the v6 lease table.
pub struct Dhcp6Engine {
    cfg: ValidatedV6,
    duid: Vec<u8>,
    store: SharedLeaseStoreV6,
}

impl Dhcp6Engine {
    pub fn new(cfg: ValidatedV6, store: SharedLeaseStoreV6) -> Self {
        let duid = duid::server_duid(&cfg.interface_mac);
        Self { cfg, duid, store }
    }

    pub fn config(&self) -> &ValidatedV6 {
        &self.cfg
    }

    pub fn store(&self) -> &SharedLeaseStoreV6 {
        &self.store
    }

    pub fn duid(&self) -> &[u8] {
        &self.duid
    }

    /// Map one inbound datagram to at most one serialized reply.
    pub async fn handle_packet(&self, data: &[u8]) -> Option<Vec<u8>> {
        let msg = V6Message::parse(data)?;

        let client_id = match msg.client_id() {
            Some(id) => id.to_vec(),
            None => {
                debug!("DHCPv6 message type {} without client id", msg.msg_type);
                return None;
            }
        };

        // Server identifier policy, RFC 8415 §16.
        match msg.msg_type {
            MSG_SOLICIT | MSG_CONFIRM | MSG_REBIND => {
                if msg.server_id().is_some() {
                    debug!("DHCPv6 message type {} must not carry a server id", msg.msg_type);
                    return None;
                }
            }
            MSG_REQUEST | MSG_RENEW | MSG_RELEASE | MSG_DECLINE => {
                if msg.server_id() != Some(self.duid.as_slice()) {
                    debug!("DHCPv6 message type {} with missing or foreign server id", msg.msg_type);
                    return None;
                }
            }
            other => {
                debug!("Ignoring DHCPv6 message type {other}");
                return None;
            }
        }

        let reply_type = if msg.msg_type == MSG_SOLICIT && !msg.rapid_commit() {
            MSG_ADVERTISE
        } else {
            MSG_REPLY
        };

        let mac = match duid::mac_from_duid(&client_id) {
            Some(mac) => mac,
            None => {
                debug!("DHCPv6 client id does not embed a hardware address");
                return None;
            }
        };

        let mut events = Vec::new();
        let reply = self
            .build_reply(&msg, reply_type, &mac, &client_id, &mut events)
            .await;
        if !events.is_empty() {
            self.store.publish(&events);
        }
        reply.map(|m| m.to_bytes())
    }

    async fn build_reply(
        &self,
        msg: &V6Message,
        reply_type: u8,
        mac: &HwAddr,
        client_id: &[u8],
        events: &mut Vec<LeaseEventKind>,
    ) -> Option<V6Message> {
        let mut store = self.store.write().await;

        let lease = match store.find_by_mac(mac) {
            Some(l) => l.clone(),
            None if msg.msg_type == MSG_SOLICIT => {
                let lease = store.reserve(mac)?;
                info!("DHCPv6: reserved {} for {mac}", lease.ip);
                events.push(LeaseEventKind::DbStore);
                events.push(LeaseEventKind::Added);
                lease
            }
            None => {
                debug!("DHCPv6 message type {} from unknown client {mac}", msg.msg_type);
                return None;
            }
        };

        // The address-confirming message types must carry an IA_NA with
        // exactly one address, and it must be the lease's.
        let client_iana = msg.ia_na();
        if matches!(msg.msg_type, MSG_REQUEST | MSG_CONFIRM | MSG_RENEW | MSG_REBIND) {
            let addrs = client_iana.as_ref().map(|ia| ia.addresses())?;
            if addrs.len() != 1 || IpAddr::V6(addrs[0].addr) != lease.ip {
                debug!("DHCPv6 message type {} from {mac} with mismatched IA_NA", msg.msg_type);
                return None;
            }
        }

        let lifetime = match msg.msg_type {
            MSG_CONFIRM => store.remaining_lifetime(&lease, Utc::now()),
            MSG_REQUEST | MSG_RENEW | MSG_REBIND => {
                store.commit(mac)?;
                events.push(LeaseEventKind::DbStore);
                events.push(LeaseEventKind::Added);
                store.lease_duration_secs()
            }
            MSG_SOLICIT if msg.rapid_commit() => {
                store.commit(mac)?;
                events.push(LeaseEventKind::DbStore);
                store.lease_duration_secs()
            }
            MSG_SOLICIT => store.lease_duration_secs(),
            MSG_RELEASE | MSG_DECLINE => {
                let removed = store.release(mac, lease.ip);
                if removed > 0 {
                    info!(
                        "DHCPv6 {} from {mac}: removed {removed} lease(s) for {}",
                        if msg.msg_type == MSG_RELEASE { "RELEASE" } else { "DECLINE" },
                        lease.ip
                    );
                    events.push(LeaseEventKind::DbStore);
                }
                0
            }
            _ => return None,
        };
        drop(store);

        let mut resp = V6Message::new(reply_type, msg.xid);
        resp.add_option(V6Option::new(OPTION_CLIENTID, client_id.to_vec()));

        // Honoring the expedited exchange is signalled by echoing the
        // Rapid Commit option (RFC 8415 §21.14).
        if msg.msg_type == MSG_SOLICIT && msg.rapid_commit() {
            resp.add_option(V6Option::new(OPTION_RAPID_COMMIT, vec![]));
        }

        if matches!(
            msg.msg_type,
            MSG_SOLICIT | MSG_REQUEST | MSG_CONFIRM | MSG_RENEW | MSG_REBIND
        ) {
            let IpAddr::V6(addr) = lease.ip else {
                return None;
            };
            let iana = IaNa {
                iaid: client_iana.map(|ia| ia.iaid).unwrap_or(1),
                t1: lifetime / 2,
                t2: lifetime * 2 / 3,
                options: vec![IaAddr {
                    addr,
                    preferred: lifetime,
                    valid: lifetime,
                }
                .to_option()],
            };
            resp.add_option(iana.to_option());
        }

        if msg.requested_options().contains(&OPTION_DNS_SERVERS)
            && !self.cfg.dns_servers.is_empty()
        {
            resp.add_option(V6Option::dns_servers(&self.cfg.dns_servers));
        }

        if let Some(fqdn) = msg.fqdn() {
            resp.add_option(fqdn.clone());
        }

        resp.add_option(V6Option::status_success());
        resp.add_option(V6Option::new(OPTION_SERVERID, self.duid.clone()));
        Some(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hg_common::EventBus;

    use crate::config::tests::test_config;
    use crate::options::{OPTION_CLIENT_FQDN, OPTION_IA_NA, OPTION_ORO, OPTION_RAPID_COMMIT, OPTION_STATUS_CODE};
    use crate::store::LeaseStoreV6;
    use hg_common::LeaseFilter;

    fn engine() -> Dhcp6Engine {
        let cfg = test_config().validate().unwrap();
        let store = LeaseStoreV6::new(&cfg);
        Dhcp6Engine::new(cfg, SharedLeaseStoreV6::new(store, Arc::new(EventBus::new())))
    }

    fn client_duid() -> Vec<u8> {
        // DUID-LL for aa:aa:aa:aa:aa:aa
        let mut duid = vec![0x00, 0x03, 0x00, 0x01];
        duid.extend_from_slice(&[0xaa; 6]);
        duid
    }

    fn solicit() -> V6Message {
        let mut msg = V6Message::new(MSG_SOLICIT, [1, 2, 3]);
        msg.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        msg
    }

    fn reply_iana(resp: &V6Message) -> IaNa {
        IaNa::parse(&resp.get_option(OPTION_IA_NA).unwrap().data).unwrap()
    }

    async fn advertise(engine: &Dhcp6Engine) -> V6Message {
        let bytes = engine.handle_packet(&solicit().to_bytes()).await.unwrap();
        V6Message::parse(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_solicit_advertises_first_address() {
        let engine = engine();
        let resp = advertise(&engine).await;
        assert_eq!(resp.msg_type, MSG_ADVERTISE);
        assert_eq!(resp.xid, [1, 2, 3]);
        assert_eq!(resp.client_id(), Some(&client_duid()[..]));
        assert_eq!(resp.server_id(), Some(engine.duid()));
        assert!(resp.get_option(OPTION_STATUS_CODE).is_some());

        let iana = reply_iana(&resp);
        let addrs = iana.addresses();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].addr, "2001::2".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(addrs[0].valid, 86_400);
        assert_eq!(iana.t1, 43_200);
        assert_eq!(iana.t2, 57_600);
    }

    #[tokio::test]
    async fn test_solicit_with_rapid_commit_replies() {
        let engine = engine();
        let mut msg = solicit();
        msg.add_option(V6Option::new(OPTION_RAPID_COMMIT, vec![]));
        let resp = V6Message::parse(&engine.handle_packet(&msg.to_bytes()).await.unwrap()).unwrap();
        assert_eq!(resp.msg_type, MSG_REPLY);
        assert!(resp.rapid_commit());
    }

    #[tokio::test]
    async fn test_request_commits_lease() {
        let engine = engine();
        let adv = advertise(&engine).await;
        let offered = reply_iana(&adv);

        let mut request = V6Message::new(MSG_REQUEST, [4, 5, 6]);
        request.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        request.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        request.add_option(offered.to_option());

        let resp =
            V6Message::parse(&engine.handle_packet(&request.to_bytes()).await.unwrap()).unwrap();
        assert_eq!(resp.msg_type, MSG_REPLY);
        let iana = reply_iana(&resp);
        assert_eq!(iana.addresses()[0].addr, "2001::2".parse::<std::net::Ipv6Addr>().unwrap());
        assert_eq!(iana.addresses()[0].valid, 86_400);

        let dynamic = engine.store().get(LeaseFilter::Dynamic).await;
        assert_eq!(dynamic.len(), 1);
    }

    #[tokio::test]
    async fn test_server_id_policy() {
        let engine = engine();

        // SOLICIT with a server id is dropped
        let mut msg = solicit();
        msg.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        assert!(engine.handle_packet(&msg.to_bytes()).await.is_none());

        // REQUEST without one is dropped
        let mut msg = V6Message::new(MSG_REQUEST, [0, 0, 1]);
        msg.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        assert!(engine.handle_packet(&msg.to_bytes()).await.is_none());

        // REQUEST with a foreign one is dropped
        let mut msg = V6Message::new(MSG_REQUEST, [0, 0, 1]);
        msg.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        msg.add_option(V6Option::new(OPTION_SERVERID, vec![0, 1, 2, 3]));
        assert!(engine.handle_packet(&msg.to_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_client_id_is_dropped() {
        let engine = engine();
        let msg = V6Message::new(MSG_SOLICIT, [1, 2, 3]);
        assert!(engine.handle_packet(&msg.to_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn test_request_with_mismatched_iana_is_dropped() {
        let engine = engine();
        advertise(&engine).await;

        let wrong = IaNa {
            iaid: 1,
            t1: 0,
            t2: 0,
            options: vec![IaAddr {
                addr: "2001::99".parse().unwrap(),
                preferred: 0,
                valid: 0,
            }
            .to_option()],
        };
        let mut request = V6Message::new(MSG_REQUEST, [4, 5, 6]);
        request.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        request.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        request.add_option(wrong.to_option());
        assert!(engine.handle_packet(&request.to_bytes()).await.is_none());

        // and entirely without an IA_NA
        let mut request = V6Message::new(MSG_REQUEST, [4, 5, 6]);
        request.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        request.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        assert!(engine.handle_packet(&request.to_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_client_renew_is_dropped() {
        let engine = engine();
        let mut renew = V6Message::new(MSG_RENEW, [7, 7, 7]);
        renew.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        renew.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        assert!(engine.handle_packet(&renew.to_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn test_dns_on_request_only_when_asked() {
        let engine = engine();
        let resp = advertise(&engine).await;
        assert!(resp.get_option(OPTION_DNS_SERVERS).is_none());

        let mut msg = solicit();
        msg.xid = [2, 2, 2];
        msg.add_option(V6Option::new(OPTION_ORO, OPTION_DNS_SERVERS.to_be_bytes().to_vec()));
        let resp = V6Message::parse(&engine.handle_packet(&msg.to_bytes()).await.unwrap()).unwrap();
        let dns = resp.get_option(OPTION_DNS_SERVERS).unwrap();
        assert_eq!(dns.data.len(), 16);
    }

    #[tokio::test]
    async fn test_fqdn_is_echoed() {
        let engine = engine();
        let mut msg = solicit();
        msg.add_option(V6Option::new(OPTION_CLIENT_FQDN, vec![0x01, 4, b'h', b'o', b's', b't']));
        let resp = V6Message::parse(&engine.handle_packet(&msg.to_bytes()).await.unwrap()).unwrap();
        assert_eq!(
            resp.get_option(OPTION_CLIENT_FQDN).unwrap().data,
            vec![0x01, 4, b'h', b'o', b's', b't']
        );
    }

    #[tokio::test]
    async fn test_release_removes_lease() {
        let engine = engine();
        let adv = advertise(&engine).await;
        let iana = reply_iana(&adv);

        let mut release = V6Message::new(MSG_RELEASE, [9, 9, 9]);
        release.add_option(V6Option::new(OPTION_CLIENTID, client_duid()));
        release.add_option(V6Option::new(OPTION_SERVERID, engine.duid().to_vec()));
        release.add_option(iana.to_option());
        let resp =
            V6Message::parse(&engine.handle_packet(&release.to_bytes()).await.unwrap()).unwrap();
        assert_eq!(resp.msg_type, MSG_REPLY);
        // no IA_NA in a release reply
        assert!(resp.get_option(OPTION_IA_NA).is_none());
        assert!(engine.store().get(LeaseFilter::All).await.is_empty());
    }
}
