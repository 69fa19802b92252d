//! DHCPv6 option codec (RFC 8415 §21): flat code/length TLVs, with the
//! IA_NA / IA Address containers parsed out of their nested payloads.

use std::net::Ipv6Addr;

/// DHCPv6 option codes
pub const OPTION_CLIENTID: u16 = 1;
pub const OPTION_SERVERID: u16 = 2;
pub const OPTION_IA_NA: u16 = 3;
pub const OPTION_IAADDR: u16 = 5;
pub const OPTION_ORO: u16 = 6;
pub const OPTION_RELAY_MSG: u16 = 9;
pub const OPTION_STATUS_CODE: u16 = 13;
pub const OPTION_RAPID_COMMIT: u16 = 14;
pub const OPTION_DNS_SERVERS: u16 = 23;
pub const OPTION_CLIENT_FQDN: u16 = 39;

pub const STATUS_SUCCESS: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V6Option {
    pub code: u16,
    pub data: Vec<u8>,
}

impl V6Option {
    pub fn new(code: u16, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn status_success() -> Self {
        let mut data = STATUS_SUCCESS.to_be_bytes().to_vec();
        data.extend_from_slice(b"Success");
        Self::new(OPTION_STATUS_CODE, data)
    }

    pub fn dns_servers(addrs: &[Ipv6Addr]) -> Self {
        let mut data = Vec::with_capacity(addrs.len() * 16);
        for addr in addrs {
            data.extend_from_slice(&addr.octets());
        }
        Self::new(OPTION_DNS_SERVERS, data)
    }
}

/// Parse a flat option region.
pub fn parse_options(data: &[u8]) -> Vec<V6Option> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let code = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + len > data.len() {
            break;
        }

        options.push(V6Option::new(code, data[offset..offset + len].to_vec()));
        offset += len;
    }

    options
}

pub fn encode_options(options: &[V6Option], buf: &mut Vec<u8>) {
    for opt in options {
        buf.extend_from_slice(&opt.code.to_be_bytes());
        buf.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&opt.data);
    }
}

/// An IA_NA container (RFC 8415 §21.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Vec<V6Option>,
}

impl IaNa {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        Some(Self {
            iaid: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            t1: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            t2: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            options: parse_options(&data[12..]),
        })
    }

    pub fn addresses(&self) -> Vec<IaAddr> {
        self.options
            .iter()
            .filter(|o| o.code == OPTION_IAADDR)
            .filter_map(|o| IaAddr::parse(&o.data))
            .collect()
    }

    pub fn to_option(&self) -> V6Option {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&self.iaid.to_be_bytes());
        data.extend_from_slice(&self.t1.to_be_bytes());
        data.extend_from_slice(&self.t2.to_be_bytes());
        encode_options(&self.options, &mut data);
        V6Option::new(OPTION_IA_NA, data)
    }
}

/// An IA Address option (RFC 8415 §21.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaAddr {
    pub addr: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
}

impl IaAddr {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 24 {
            return None;
        }
        let octets: [u8; 16] = data[0..16].try_into().ok()?;
        Some(Self {
            addr: Ipv6Addr::from(octets),
            preferred: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            valid: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        })
    }

    pub fn to_option(&self) -> V6Option {
        let mut data = Vec::with_capacity(24);
        data.extend_from_slice(&self.addr.octets());
        data.extend_from_slice(&self.preferred.to_be_bytes());
        data.extend_from_slice(&self.valid.to_be_bytes());
        V6Option::new(OPTION_IAADDR, data)
    }
}
