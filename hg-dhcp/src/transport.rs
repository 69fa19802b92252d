//! DHCPv4 transport: a broadcast-capable UDP socket on port 67 for all
//! UDP-addressable peers, and an `AF_PACKET` socket for L2-unicast replies
//! to clients that do not yet have an address.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use hg_common::HwAddr;

use crate::config::ValidatedV4;
use crate::state_machine::{ReplyPeer, CLIENT_PORT, SERVER_PORT};

pub struct Transport {
    udp: tokio::net::UdpSocket,
    #[cfg(target_os = "linux")]
    raw: Option<raw::RawLinkSocket>,
    server_mac: HwAddr,
    server_ip: Ipv4Addr,
    iface_broadcast: Ipv4Addr,
    broadcast_echo: bool,
}

impl Transport {
    pub fn bind(cfg: &ValidatedV4) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating DHCP UDP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        let addr: SocketAddr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            SERVER_PORT,
        ));
        socket.bind(&addr.into()).context("binding 0.0.0.0:67")?;

        #[cfg(target_os = "linux")]
        if !cfg.interface.is_empty() {
            socket.bind_device(Some(cfg.interface.as_bytes()))?;
            info!("DHCP bound to interface {}", cfg.interface);
        }

        socket.set_nonblocking(true)?;
        let udp = tokio::net::UdpSocket::from_std(socket.into())?;

        #[cfg(target_os = "linux")]
        let raw = match raw::RawLinkSocket::open(&cfg.interface) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Raw packet socket unavailable, L2 unicast falls back to broadcast: {e:#}");
                None
            }
        };

        Ok(Self {
            udp,
            #[cfg(target_os = "linux")]
            raw,
            server_mac: cfg.interface_mac.clone(),
            server_ip: cfg.server_id,
            iface_broadcast: cfg.broadcast,
            broadcast_echo: cfg.broadcast_echo,
        })
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.udp.recv_from(buf).await
    }

    fn broadcast_peer(&self) -> SocketAddrV4 {
        // Linux delivers a 255.255.255.255 write on the bound interface;
        // macOS/BSD kernels reject it, so those send the interface
        // broadcast instead.
        #[cfg(target_os = "linux")]
        {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
        }
        #[cfg(not(target_os = "linux"))]
        {
            SocketAddrV4::new(self.iface_broadcast, CLIENT_PORT)
        }
    }

    /// Send one serialized reply to the chosen peer.
    pub async fn write_to(&self, bytes: &[u8], peer: &ReplyPeer) -> Result<()> {
        match peer {
            ReplyPeer::UnicastIp(addr) => {
                self.udp.send_to(bytes, SocketAddr::V4(*addr)).await?;
            }
            ReplyPeer::Broadcast => {
                self.udp
                    .send_to(bytes, SocketAddr::V4(self.broadcast_peer()))
                    .await?;
            }
            ReplyPeer::MacUnicast { mac, yiaddr } => {
                self.send_mac_unicast(bytes, mac, *yiaddr).await?;
                if self.broadcast_echo {
                    // Interop duplicate; some clients only listen for the
                    // broadcast copy.
                    self.udp
                        .send_to(bytes, SocketAddr::V4(self.broadcast_peer()))
                        .await?;
                }
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn send_mac_unicast(&self, bytes: &[u8], mac: &HwAddr, yiaddr: Ipv4Addr) -> Result<()> {
        let Some(raw) = &self.raw else {
            debug!("No raw socket, sending broadcast instead of L2 unicast");
            self.udp
                .send_to(bytes, SocketAddr::V4(self.broadcast_peer()))
                .await?;
            return Ok(());
        };
        let frame = build_frame(&self.server_mac, mac, self.server_ip, yiaddr, bytes)?;
        raw.send(&frame)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn send_mac_unicast(&self, bytes: &[u8], _mac: &HwAddr, _yiaddr: Ipv4Addr) -> Result<()> {
        self.udp
            .send_to(bytes, SocketAddr::V4(self.broadcast_peer()))
            .await?;
        Ok(())
    }
}

/// Assemble the Ethernet/IPv4/UDP reply frame: server MAC as source, TTL
/// 64, no fragmentation, UDP checksum over the IPv4 pseudo-header.
fn build_frame(
    src_mac: &HwAddr,
    dst_mac: &HwAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    payload: &[u8],
) -> Result<Vec<u8>> {
    const ETH_ALEN: usize = 6;
    let mut src = [0u8; ETH_ALEN];
    let mut dst = [0u8; ETH_ALEN];
    let n = src_mac.len().min(ETH_ALEN);
    src[..n].copy_from_slice(&src_mac.as_bytes()[..n]);
    let n = dst_mac.len().min(ETH_ALEN);
    dst[..n].copy_from_slice(&dst_mac.as_bytes()[..n]);

    let builder = etherparse::PacketBuilder::ethernet2(src, dst)
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .udp(SERVER_PORT, CLIENT_PORT);

    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .context("assembling L2 reply frame")?;
    Ok(frame)
}

#[cfg(target_os = "linux")]
mod raw {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use anyhow::{bail, Context, Result};

    /// `AF_PACKET` socket bound to the serving interface, accepting only
    /// `EtherType = IPv4`. Used to emit L2-unicast replies.
    pub(super) struct RawLinkSocket {
        fd: OwnedFd,
    }

    impl RawLinkSocket {
        pub(super) fn open(iface: &str) -> Result<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW,
                    (libc::ETH_P_IP as u16).to_be() as libc::c_int,
                )
            };
            if fd < 0 {
                return Err(std::io::Error::last_os_error()).context("creating AF_PACKET socket");
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            let ifindex = if iface.is_empty() {
                0
            } else {
                let name = std::ffi::CString::new(iface).context("interface name")?;
                let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
                if idx == 0 {
                    bail!("unknown interface {iface:?}");
                }
                idx as libc::c_int
            };

            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = (libc::ETH_P_IP as u16).to_be();
            addr.sll_ifindex = ifindex;

            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("binding AF_PACKET socket to {iface:?}"));
            }

            Ok(Self { fd })
        }

        pub(super) fn send(&self, frame: &[u8]) -> Result<()> {
            let rc = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    frame.as_ptr().cast(),
                    frame.len(),
                    0,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                // A close during shutdown surfaces here; not a failure.
                if err.kind() == std::io::ErrorKind::NotConnected {
                    return Ok(());
                }
                return Err(err).context("sending raw frame");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_layout() {
        let src: HwAddr = "02:00:00:00:00:01".parse().unwrap();
        let dst: HwAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let payload = [0xabu8; 12];
        let frame = build_frame(
            &src,
            &dst,
            "192.168.10.1".parse().unwrap(),
            "192.168.10.100".parse().unwrap(),
            &payload,
        )
        .unwrap();

        // Ethernet: dst, src, EtherType 0x0800
        assert_eq!(&frame[0..6], dst.as_bytes());
        assert_eq!(&frame[6..12], src.as_bytes());
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        // IPv4: version/IHL, TTL 64, protocol UDP, addresses
        assert_eq!(frame[14] >> 4, 4);
        assert_eq!(frame[14 + 8], 64);
        assert_eq!(frame[14 + 9], 17);
        assert_eq!(&frame[14 + 12..14 + 16], &[192, 168, 10, 1]);
        assert_eq!(&frame[14 + 16..14 + 20], &[192, 168, 10, 100]);
        // UDP: 67 -> 68, length, non-zero checksum
        let ihl = usize::from(frame[14] & 0x0f) * 4;
        let udp = &frame[14 + ihl..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), SERVER_PORT);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), CLIENT_PORT);
        assert_eq!(
            u16::from_be_bytes([udp[4], udp[5]]) as usize,
            8 + payload.len()
        );
        assert_ne!(u16::from_be_bytes([udp[6], udp[7]]), 0);
        assert_eq!(&udp[8..], &payload);
    }

    #[test]
    fn test_build_frame_parses_back() {
        let src: HwAddr = "02:00:00:00:00:01".parse().unwrap();
        let dst: HwAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let payload = b"dhcp-payload";
        let frame = build_frame(
            &src,
            &dst,
            "192.168.10.1".parse().unwrap(),
            "192.168.10.100".parse().unwrap(),
            payload,
        )
        .unwrap();

        let sliced = etherparse::SlicedPacket::from_ethernet(&frame).unwrap();
        match sliced.transport {
            Some(etherparse::TransportSlice::Udp(udp)) => {
                assert_eq!(udp.source_port(), SERVER_PORT);
                assert_eq!(udp.destination_port(), CLIENT_PORT);
                assert_eq!(udp.payload(), payload);
            }
            other => panic!("expected UDP transport, got {other:?}"),
        }
    }
}
