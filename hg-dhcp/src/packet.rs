//! DHCPv4 packet parser/serializer (RFC 2131)

use std::net::Ipv4Addr;

use thiserror::Error;

use hg_common::HwAddr;

use crate::options::{
    self, DhcpOption, OPT_CLIENT_ID, OPT_HOSTNAME, OPT_MSG_TYPE, OPT_PARAM_REQUEST,
    OPT_REQUESTED_IP, OPT_SERVER_ID,
};

/// The four bytes separating the fixed header from the option region.
pub const COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Fixed header size up to (not including) the cookie.
const FIXED_LEN: usize = 236;
/// Smallest datagram this parser accepts: header plus cookie.
const MIN_LEN: usize = FIXED_LEN + COOKIE.len();
/// Replies are padded up to the BOOTP minimum some clients still expect.
const MIN_REPLY_LEN: usize = 300;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;

const FLAG_BROADCAST: u16 = 0x8000;

#[derive(Error, Debug)]
pub enum DhcpParseError {
    #[error("truncated DHCPv4 packet ({0} bytes)")]
    Truncated(usize),
    #[error("missing DHCPv4 magic cookie")]
    BadCookie,
}

/// Bounds-checked cursor over the fixed header region. The caller verifies
/// the total length once up front, so every getter may index freely.
struct FieldReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.at];
        self.at += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes([self.u8(), self.u8()])
    }

    fn u32(&mut self) -> u32 {
        let hi = self.u16();
        let lo = self.u16();
        (u32::from(hi) << 16) | u32::from(lo)
    }

    fn ip(&mut self) -> Ipv4Addr {
        Ipv4Addr::new(self.u8(), self.u8(), self.u8(), self.u8())
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.at..self.at + N]);
        self.at += N;
        out
    }
}

/// Parsed DHCPv4 packet
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parse a DHCP packet from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, DhcpParseError> {
        if data.len() < MIN_LEN {
            return Err(DhcpParseError::Truncated(data.len()));
        }
        if data[FIXED_LEN..MIN_LEN] != COOKIE {
            return Err(DhcpParseError::BadCookie);
        }

        let mut r = FieldReader::new(&data[..FIXED_LEN]);
        let packet = DhcpPacket {
            op: r.u8(),
            htype: r.u8(),
            hlen: r.u8(),
            hops: r.u8(),
            xid: r.u32(),
            secs: r.u16(),
            flags: r.u16(),
            ciaddr: r.ip(),
            yiaddr: r.ip(),
            siaddr: r.ip(),
            giaddr: r.ip(),
            chaddr: r.bytes(),
            sname: r.bytes(),
            file: r.bytes(),
            options: options::parse_options(&data[MIN_LEN..]),
        };
        Ok(packet)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_REPLY_LEN);
        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&COOKIE);
        out.extend_from_slice(&options::encode_options(&self.options));

        if out.len() < MIN_REPLY_LEN {
            out.resize(MIN_REPLY_LEN, 0);
        }
        out
    }

    /// Client hardware address, validated against hlen.
    pub fn hwaddr(&self) -> Option<HwAddr> {
        let len = self.hlen as usize;
        if len > self.chaddr.len() {
            return None;
        }
        HwAddr::new(&self.chaddr[..len]).ok()
    }

    /// Find option by code
    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    pub fn has_option(&self, code: u8) -> bool {
        self.get_option(code).is_some()
    }

    /// Get DHCP message type
    pub fn msg_type(&self) -> Option<u8> {
        self.get_option(OPT_MSG_TYPE)?.as_u8()
    }

    /// Get requested IP address
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP)?.as_ipv4()
    }

    /// True if a Requested IP option is present, whatever its payload.
    pub fn has_requested_ip(&self) -> bool {
        self.has_option(OPT_REQUESTED_IP)
    }

    /// Get server identifier
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    pub fn has_server_id(&self) -> bool {
        self.has_option(OPT_SERVER_ID)
    }

    /// Get hostname
    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)?.as_str()
    }

    /// Parameter request list (option 55)
    pub fn param_request_list(&self) -> Option<&[u8]> {
        self.get_option(OPT_PARAM_REQUEST).map(|o| o.data.as_slice())
    }

    /// Get client identifier
    pub fn client_id(&self) -> Option<&[u8]> {
        self.get_option(OPT_CLIENT_ID).map(|o| o.data.as_slice())
    }

    /// Check if broadcast flag is set
    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    pub fn set_broadcast(&mut self) {
        self.flags |= FLAG_BROADCAST;
    }

    /// Build the reply skeleton for this request: a BOOTREPLY that copies
    /// xid, htype, flags, chaddr and giaddr (RFC 2131 §4.3.1). The caller
    /// sets the message type, yiaddr and the remaining options.
    pub fn reply_skeleton(&self, server_id: Ipv4Addr) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::server_id(server_id)],
        }
    }

    /// Replace the message-type option (inserting it first if absent).
    pub fn set_msg_type(&mut self, t: u8) {
        if let Some(opt) = self.options.iter_mut().find(|o| o.code == OPT_MSG_TYPE) {
            opt.data = vec![t];
        } else {
            self.options.insert(0, DhcpOption::msg_type(t));
        }
    }

    pub fn add_option(&mut self, opt: DhcpOption) {
        self.options.push(opt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DHCPREQUEST;

    const TEST_XID: u32 = 0x4a_90_3b_07;
    const TEST_MAC: [u8; 6] = [0x0c, 0x4f, 0x32, 0x08, 0xd1, 0x65];

    /// Assemble a BOOTREQUEST the way a client would put it on the wire.
    fn raw_request(msg_type: u8) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[BOOTREQUEST, HTYPE_ETHERNET, 6, 0]);
        wire.extend_from_slice(&TEST_XID.to_be_bytes());
        wire.extend_from_slice(&[0u8; 4]); // secs + flags
        wire.extend_from_slice(&[0u8; 16]); // ciaddr..giaddr
        wire.extend_from_slice(&TEST_MAC);
        wire.extend_from_slice(&[0u8; 10]); // chaddr tail
        wire.extend_from_slice(&[0u8; 64 + 128]); // sname + file
        wire.extend_from_slice(&COOKIE);
        wire.extend_from_slice(&[OPT_MSG_TYPE, 1, msg_type]);
        wire.extend_from_slice(&[OPT_HOSTNAME, 4, b'o', b'v', b'e', b'n']);
        wire.push(options::OPT_END);
        wire
    }

    #[test]
    fn test_parse_request() {
        let pkt = DhcpPacket::parse(&raw_request(DHCPREQUEST)).unwrap();
        assert_eq!(pkt.op, BOOTREQUEST);
        assert_eq!(pkt.xid, TEST_XID);
        assert_eq!(pkt.hwaddr().unwrap().as_bytes(), &TEST_MAC);
        assert_eq!(pkt.msg_type(), Some(DHCPREQUEST));
        assert_eq!(pkt.hostname().as_deref(), Some("oven"));
        assert!(!pkt.is_broadcast());
    }

    #[test]
    fn test_parse_rejects_short_and_bad_cookie() {
        let wire = raw_request(DHCPREQUEST);
        assert!(matches!(
            DhcpPacket::parse(&wire[..MIN_LEN - 1]),
            Err(DhcpParseError::Truncated(_))
        ));

        let mut wire = wire;
        wire[FIXED_LEN] ^= 0xff;
        assert!(matches!(
            DhcpPacket::parse(&wire),
            Err(DhcpParseError::BadCookie)
        ));
    }

    #[test]
    fn test_serialize_pads_and_reparses() {
        let pkt = DhcpPacket::parse(&raw_request(DHCPREQUEST)).unwrap();
        let wire = pkt.to_bytes();
        assert!(wire.len() >= MIN_REPLY_LEN);

        let again = DhcpPacket::parse(&wire).unwrap();
        assert_eq!(again.xid, pkt.xid);
        assert_eq!(again.chaddr, pkt.chaddr);
        assert_eq!(again.msg_type(), pkt.msg_type());
        assert_eq!(again.hostname(), pkt.hostname());
    }

    #[test]
    fn test_reply_skeleton_copies_request_fields() {
        let mut wire = raw_request(DHCPREQUEST);
        wire[10] = 0x80; // client asked for broadcast replies
        wire[24..28].copy_from_slice(&[172, 16, 4, 1]); // relayed via giaddr
        let request = DhcpPacket::parse(&wire).unwrap();

        let server_id: Ipv4Addr = "172.16.0.1".parse().unwrap();
        let mut reply = request.reply_skeleton(server_id);
        reply.set_msg_type(options::DHCPOFFER);

        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.xid, request.xid);
        assert!(reply.is_broadcast());
        assert_eq!(reply.giaddr, Ipv4Addr::new(172, 16, 4, 1));
        assert_eq!(reply.chaddr, request.chaddr);
        assert_eq!(reply.server_id(), Some(server_id));
        assert_eq!(reply.msg_type(), Some(options::DHCPOFFER));
        assert_eq!(reply.ciaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_set_msg_type_replaces_existing() {
        let mut pkt = DhcpPacket::parse(&raw_request(DHCPREQUEST)).unwrap();
        pkt.set_msg_type(options::DHCPACK);
        assert_eq!(pkt.msg_type(), Some(options::DHCPACK));
        let count = pkt
            .options
            .iter()
            .filter(|o| o.code == OPT_MSG_TYPE)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_hwaddr_honours_hlen() {
        let mut wire = raw_request(DHCPREQUEST);
        wire[2] = 20; // longer than the 16-byte chaddr field can carry
        assert!(DhcpPacket::parse(&wire).unwrap().hwaddr().is_none());

        wire[2] = 5; // not a hardware address length we serve
        assert!(DhcpPacket::parse(&wire).unwrap().hwaddr().is_none());
    }
}
