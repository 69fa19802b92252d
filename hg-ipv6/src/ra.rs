//! Router Advertisement sender via raw ICMPv6 socket (RFC 4861).

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ValidatedV6;

const ND_ROUTER_ADVERT: u8 = 134;
const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_PREFIX_INFO: u8 = 3;
const OPT_MTU: u8 = 5;
const OPT_RDNSS: u8 = 25;

const ROUTER_LIFETIME: u16 = 1800;
const PREFIX_LIFETIME: u32 = 3600;

/// Build the fixed Router Advertisement packet sent for the lifetime of
/// the process. The checksum stays zero; the kernel fills it in.
pub fn build_ra_packet(cfg: &ValidatedV6) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);

    // ICMPv6 header
    buf.push(ND_ROUTER_ADVERT);
    buf.push(0); // Code
    buf.extend_from_slice(&[0, 0]); // Checksum

    buf.push(64); // Cur Hop Limit
    // M and O are cleared when SLAAC is the only address source.
    let flags = if cfg.ra_slaac_only { 0x00 } else { 0x80 | 0x40 };
    buf.push(flags);
    buf.extend_from_slice(&ROUTER_LIFETIME.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // Reachable Time
    buf.extend_from_slice(&0u32.to_be_bytes()); // Retrans Timer

    // Prefix Information: the /64 the dynamic block lives in, on-link and
    // autonomous.
    buf.push(OPT_PREFIX_INFO);
    buf.push(4); // length in units of 8 bytes
    buf.push(64); // prefix length
    buf.push(0xC0); // L + A
    buf.extend_from_slice(&PREFIX_LIFETIME.to_be_bytes()); // Valid Lifetime
    buf.extend_from_slice(&PREFIX_LIFETIME.to_be_bytes()); // Preferred Lifetime
    buf.extend_from_slice(&0u32.to_be_bytes()); // Reserved
    buf.extend_from_slice(&cfg.range_start.octets()[..8]);
    buf.extend_from_slice(&[0u8; 8]);

    // MTU
    buf.push(OPT_MTU);
    buf.push(1);
    buf.extend_from_slice(&[0, 0]); // Reserved
    buf.extend_from_slice(&cfg.interface_mtu.to_be_bytes());

    // Source Link-Layer Address, padded to a multiple of 8 bytes.
    let hw = cfg.interface_mac.as_bytes();
    let slla_len = (2 + hw.len()).div_ceil(8);
    buf.push(OPT_SOURCE_LINK_ADDR);
    buf.push(slla_len as u8);
    buf.extend_from_slice(hw);
    buf.resize(buf.len() + (slla_len * 8 - 2 - hw.len()), 0);

    // Recursive DNS Server
    if let Some(dns) = cfg.dns_servers.first() {
        buf.push(OPT_RDNSS);
        buf.push(3);
        buf.extend_from_slice(&[0, 0]); // Reserved
        buf.extend_from_slice(&PREFIX_LIFETIME.to_be_bytes());
        buf.extend_from_slice(&dns.octets());
    }

    buf
}

/// Re-transmit the advertisement to `ff02::1` every send period until
/// shutdown.
pub async fn run_ra_sender(cfg: ValidatedV6, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    if !cfg.ra_enabled() {
        info!("Router Advertisements disabled");
        return Ok(());
    }

    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
        .context("creating ICMPv6 socket")?;

    // RFC 4861 requires hop limit 255 on RAs.
    socket.set_multicast_hops_v6(255)?;
    socket.set_unicast_hops_v6(255)?;

    #[cfg(target_os = "linux")]
    if !cfg.interface.is_empty() {
        socket.bind_device(Some(cfg.interface.as_bytes()))?;
    }

    socket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(socket.into())?;

    let packet = build_ra_packet(&cfg);
    let dest = SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1),
        0,
        0,
        0,
    ));

    info!(
        "RA sender: advertising {}/64 to ff02::1 every {:?}",
        cfg.range_start, cfg.packet_send_period
    );

    let mut ticker = tokio::time::interval(cfg.packet_send_period);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("RA sender shutting down");
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&packet, dest).await {
                    warn!("Failed to send Router Advertisement: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_ra_packet_layout() {
        let cfg = {
            let mut c = test_config();
            c.ra_allow_slaac = true;
            c.validate().unwrap()
        };
        let pkt = build_ra_packet(&cfg);

        // header
        assert_eq!(pkt[0], ND_ROUTER_ADVERT);
        assert_eq!(pkt[1], 0);
        assert_eq!(&pkt[2..4], &[0, 0]);
        assert_eq!(pkt[4], 64);
        assert_eq!(pkt[5], 0xC0); // M + O, not slaac-only
        assert_eq!(u16::from_be_bytes([pkt[6], pkt[7]]), 1800);
        assert_eq!(&pkt[8..16], &[0u8; 8]); // reachable + retrans

        // prefix option
        assert_eq!(pkt[16], OPT_PREFIX_INFO);
        assert_eq!(pkt[17], 4);
        assert_eq!(pkt[18], 64);
        assert_eq!(pkt[19], 0xC0);
        assert_eq!(u32::from_be_bytes([pkt[20], pkt[21], pkt[22], pkt[23]]), 3600);
        assert_eq!(u32::from_be_bytes([pkt[24], pkt[25], pkt[26], pkt[27]]), 3600);
        // prefix: first 8 bytes of 2001::2, then zeroes
        assert_eq!(&pkt[32..40], &[0x20, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&pkt[40..48], &[0u8; 8]);

        // MTU option
        assert_eq!(pkt[48], OPT_MTU);
        assert_eq!(pkt[49], 1);
        assert_eq!(u32::from_be_bytes([pkt[52], pkt[53], pkt[54], pkt[55]]), 1500);

        // SLLA: 6-byte MAC padded into one 8-byte unit
        assert_eq!(pkt[56], OPT_SOURCE_LINK_ADDR);
        assert_eq!(pkt[57], 1);
        assert_eq!(&pkt[58..64], cfg.interface_mac.as_bytes());

        // RDNSS
        assert_eq!(pkt[64], OPT_RDNSS);
        assert_eq!(pkt[65], 3);
        assert_eq!(u32::from_be_bytes([pkt[68], pkt[69], pkt[70], pkt[71]]), 3600);
        assert_eq!(
            &pkt[72..88],
            &"2001::1".parse::<Ipv6Addr>().unwrap().octets()
        );
        assert_eq!(pkt.len(), 88);
    }

    #[test]
    fn test_slaac_only_clears_managed_flags() {
        let cfg = {
            let mut c = test_config();
            c.ra_slaac_only = true;
            c.validate().unwrap()
        };
        let pkt = build_ra_packet(&cfg);
        assert_eq!(pkt[5], 0x00);
    }

    #[test]
    fn test_slla_padding_for_long_addresses() {
        let cfg = {
            let mut c = test_config();
            c.ra_allow_slaac = true;
            // 20-octet IPoIB-style address
            c.interface_mac = (0..20)
                .map(|i| format!("{i:02x}"))
                .collect::<Vec<_>>()
                .join(":");
            c.validate().unwrap()
        };
        let pkt = build_ra_packet(&cfg);
        let slla_at = 56;
        assert_eq!(pkt[slla_at], OPT_SOURCE_LINK_ADDR);
        // ceil((2 + 20) / 8) = 3 units
        assert_eq!(pkt[slla_at + 1], 3);
        // option spans 24 bytes; the 2 trailing bytes are padding
        assert_eq!(&pkt[slla_at + 2 + 20..slla_at + 24], &[0, 0]);
    }
}
