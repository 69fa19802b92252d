//! ICMP echo probe used to detect an address already in use on the LAN
//! before it is offered.

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ECHO_IDENT: u16 = 0x6847; // "hG"

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn echo_request(seq: u16) -> Vec<u8> {
    let mut pkt = vec![
        ICMP_ECHO_REQUEST,
        0, // code
        0,
        0, // checksum, filled below
    ];
    pkt.extend_from_slice(&ECHO_IDENT.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    let sum = checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

/// True when the received datagram is an echo reply from `target` carrying
/// our identifier. Raw ICMPv4 sockets deliver the IPv4 header first.
fn is_reply_from(buf: &[u8], target: Ipv4Addr) -> bool {
    if buf.len() < 20 {
        return false;
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if buf.len() < ihl + 8 {
        return false;
    }
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let icmp = &buf[ihl..];
    src == target
        && icmp[0] == ICMP_ECHO_REPLY
        && icmp[4..6] == ECHO_IDENT.to_be_bytes()
}

fn probe_blocking(target: Ipv4Addr, timeout: Duration) -> Result<bool> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .context("creating ICMP socket")?;
    socket
        .set_read_timeout(Some(timeout))
        .context("setting ICMP read timeout")?;

    let request = echo_request(1);
    let dest = SocketAddrV4::new(target, 0);
    socket
        .send_to(&request, &dest.into())
        .context("sending ICMP echo request")?;

    let deadline = Instant::now() + timeout;
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv(&mut buf) {
            Ok(len) => {
                // Safety: the kernel initialized the first `len` bytes.
                let data: &[u8] =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast(), len) };
                if is_reply_from(data, target) {
                    return Ok(true);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e).context("receiving ICMP reply"),
        }
    }
}

/// Probe a candidate address before offering it. Returns `true` when the
/// address answered and must not be handed out. Disabled (no timeout) or
/// failing probes report the address as available; allocation never fails
/// on probe errors.
pub async fn ip_in_use(target: Ipv4Addr, timeout: Option<Duration>) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };

    let result = tokio::task::spawn_blocking(move || probe_blocking(target, timeout)).await;
    match result {
        Ok(Ok(in_use)) => {
            debug!("ICMP probe of {target}: {}", if in_use { "in use" } else { "free" });
            in_use
        }
        Ok(Err(e)) => {
            warn!("ICMP probe of {target} failed, treating as free: {e:#}");
            false
        }
        Err(e) => {
            warn!("ICMP probe task for {target} failed, treating as free: {e}");
            false
        }
    }
}
