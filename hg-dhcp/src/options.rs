use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tracing::warn;

/// Option codes this server reads or writes (RFC 2132)
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_NON_LOCAL_SOURCE_ROUTING: u8 = 20;
pub const OPT_DEFAULT_IP_TTL: u8 = 23;
pub const OPT_BROADCAST_ADDR: u8 = 28;
pub const OPT_PERFORM_MASK_DISCOVERY: u8 = 29;
pub const OPT_MASK_SUPPLIER: u8 = 30;
pub const OPT_PERFORM_ROUTER_DISCOVERY: u8 = 31;
pub const OPT_ROUTER_SOLICITATION_ADDR: u8 = 32;
pub const OPT_TRAILER_ENCAPSULATION: u8 = 34;
pub const OPT_ETHERNET_ENCAPSULATION: u8 = 36;
pub const OPT_TCP_KEEPALIVE_INTERVAL: u8 = 38;
pub const OPT_TCP_KEEPALIVE_GARBAGE: u8 = 39;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_CLIENT_FQDN: u8 = 81;
pub const OPT_RELAY_AGENT_INFO: u8 = 82;
pub const OPT_END: u8 = 255;
pub const OPT_PAD: u8 = 0;

/// Message types (option 53 values)
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPDECLINE: u8 = 4;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;
pub const DHCPRELEASE: u8 = 7;
pub const DHCPINFORM: u8 = 8;

/// One code/payload pair from the option region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn msg_type(t: u8) -> Self {
        Self::new(OPT_MSG_TYPE, vec![t])
    }

    pub fn server_id(ip: Ipv4Addr) -> Self {
        Self::new(OPT_SERVER_ID, ip.octets().to_vec())
    }

    pub fn lease_time(secs: u32) -> Self {
        Self::new(OPT_LEASE_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn subnet_mask(mask: Ipv4Addr) -> Self {
        Self::new(OPT_SUBNET_MASK, mask.octets().to_vec())
    }

    pub fn router(ip: Ipv4Addr) -> Self {
        Self::new(OPT_ROUTER, ip.octets().to_vec())
    }

    pub fn dns_servers(ips: &[Ipv4Addr]) -> Self {
        let mut data = Vec::with_capacity(ips.len() * 4);
        for ip in ips {
            data.extend_from_slice(&ip.octets());
        }
        Self::new(OPT_DNS_SERVER, data)
    }

    pub fn hostname(name: &str) -> Self {
        Self::new(OPT_HOSTNAME, name.as_bytes().to_vec())
    }

    /// Client FQDN (RFC 4702) with the S and O flags set and both RCODE
    /// fields at 0xFF, as sent for static leases with a known hostname.
    pub fn client_fqdn(name: &str) -> Self {
        let mut data = vec![0x03, 0xff, 0xff];
        data.extend_from_slice(name.as_bytes());
        Self::new(OPT_CLIENT_FQDN, data)
    }

    /// The payload as an IPv4 address, when it is exactly four bytes.
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.data.len() == 4 {
            Some(Ipv4Addr::new(self.data[0], self.data[1], self.data[2], self.data[3]))
        } else {
            None
        }
    }

    /// The payload as a big-endian u32.
    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]))
        } else {
            None
        }
    }

    /// The payload as UTF-8 text.
    pub fn as_str(&self) -> Option<String> {
        String::from_utf8(self.data.clone()).ok()
    }

    /// The payload's first byte.
    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Walk the option region following the cookie: code, length, payload,
/// until END. Pads are skipped; anything truncated ends the walk.
pub fn parse_options(data: &[u8]) -> Vec<DhcpOption> {
    let mut parsed = Vec::new();
    let mut rest = data;

    while let [code, tail @ ..] = rest {
        match *code {
            OPT_END => break,
            OPT_PAD => {
                rest = tail;
            }
            code => {
                let [len, payload @ ..] = tail else { break };
                let len = usize::from(*len);
                if payload.len() < len {
                    break;
                }
                parsed.push(DhcpOption::new(code, payload[..len].to_vec()));
                rest = &payload[len..];
            }
        }
    }

    parsed
}

/// Encode an option list, END-terminated.
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let mut wire = Vec::new();
    for opt in options {
        wire.push(opt.code);
        wire.push(opt.data.len() as u8);
        wire.extend_from_slice(&opt.data);
    }
    wire.push(OPT_END);
    wire
}

// ── Administrator option directives ────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("invalid option code {0:?}")]
    BadCode(String),
    #[error("unknown option type {0:?}")]
    UnknownType(String),
    #[error("invalid value {value:?} for option type {kind}")]
    BadValue { kind: &'static str, value: String },
}

/// Value of a configured option: raw bytes, or an instruction to strip the
/// code from every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Data(Vec<u8>),
    Delete,
}

/// Parse an administrator directive of the form `<CODE> <TYPE> <VALUE>`.
///
/// Types: hex, ip, ips, text, bool, dur, u8, u16, del.
pub fn parse_directive(s: &str) -> Result<(u8, OptionValue), DirectiveError> {
    let s = s.trim();
    let (code_str, rest) = s
        .split_once(char::is_whitespace)
        .ok_or_else(|| DirectiveError::BadCode(s.to_string()))?;
    let code: u8 = code_str
        .parse()
        .ok()
        .filter(|c| *c >= 1)
        .ok_or_else(|| DirectiveError::BadCode(code_str.to_string()))?;

    let rest = rest.trim();
    let (kind, value) = match rest.split_once(char::is_whitespace) {
        Some((k, v)) => (k, v.trim()),
        None => (rest, ""),
    };

    let data = match kind {
        "del" => return Ok((code, OptionValue::Delete)),
        "hex" => hex::decode(value).map_err(|_| DirectiveError::BadValue {
            kind: "hex",
            value: value.to_string(),
        })?,
        "ip" => parse_v4(value, "ip")?.octets().to_vec(),
        "ips" => {
            let mut data = Vec::new();
            for part in value.split(',') {
                data.extend_from_slice(&parse_v4(part.trim(), "ips")?.octets());
            }
            data
        }
        "text" => value.as_bytes().to_vec(),
        "bool" => match value {
            "true" => vec![0x01],
            "false" => vec![0x00],
            _ => {
                return Err(DirectiveError::BadValue {
                    kind: "bool",
                    value: value.to_string(),
                })
            }
        },
        "dur" => parse_duration_secs(value)
            .ok_or_else(|| DirectiveError::BadValue {
                kind: "dur",
                value: value.to_string(),
            })?
            .to_be_bytes()
            .to_vec(),
        "u8" => vec![value.parse::<u8>().map_err(|_| DirectiveError::BadValue {
            kind: "u8",
            value: value.to_string(),
        })?],
        "u16" => value
            .parse::<u16>()
            .map_err(|_| DirectiveError::BadValue {
                kind: "u16",
                value: value.to_string(),
            })?
            .to_be_bytes()
            .to_vec(),
        other => return Err(DirectiveError::UnknownType(other.to_string())),
    };

    Ok((code, OptionValue::Data(data)))
}

fn parse_v4(s: &str, kind: &'static str) -> Result<Ipv4Addr, DirectiveError> {
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        _ => Err(DirectiveError::BadValue { kind, value: s.to_string() }),
    }
}

/// Duration literal: bare seconds or a number with an s/m/h/d suffix.
fn parse_duration_secs(s: &str) -> Option<u32> {
    let (digits, mult) = match s.as_bytes().last()? {
        b's' => (&s[..s.len() - 1], 1u32),
        b'm' => (&s[..s.len() - 1], 60),
        b'h' => (&s[..s.len() - 1], 3600),
        b'd' => (&s[..s.len() - 1], 86_400),
        b'0'..=b'9' => (s, 1),
        _ => return None,
    };
    digits.parse::<u32>().ok()?.checked_mul(mult)
}

// ── Response option policy (RFC 2131 §4.3.1) ───────────────────────────

/// Implicit Host-Requirements defaults plus the explicit configured
/// overrides. The two maps are disjoint: an explicit entry removes the
/// code from the implicit table at construction.
#[derive(Debug, Clone, Default)]
pub struct OptionPolicy {
    implicit: HashMap<u8, Vec<u8>>,
    explicit: HashMap<u8, OptionValue>,
}

impl OptionPolicy {
    /// Build the tables from the interface's DNS-serving addresses and the
    /// configured directives. Unparseable directives are logged and
    /// skipped; they never prevent startup.
    pub fn new(dns: &[Ipv4Addr], directives: &[String]) -> Self {
        let mut implicit: HashMap<u8, Vec<u8>> = HashMap::new();

        // RFC 1122/1123 defaults.
        implicit.insert(OPT_NON_LOCAL_SOURCE_ROUTING, vec![0x00]);
        implicit.insert(OPT_DEFAULT_IP_TTL, vec![64]);
        implicit.insert(OPT_PERFORM_MASK_DISCOVERY, vec![0x00]);
        implicit.insert(OPT_MASK_SUPPLIER, vec![0x00]);
        implicit.insert(OPT_PERFORM_ROUTER_DISCOVERY, vec![0x01]);
        implicit.insert(
            OPT_ROUTER_SOLICITATION_ADDR,
            Ipv4Addr::new(224, 0, 0, 2).octets().to_vec(),
        );
        implicit.insert(
            OPT_BROADCAST_ADDR,
            Ipv4Addr::BROADCAST.octets().to_vec(),
        );
        implicit.insert(OPT_TRAILER_ENCAPSULATION, vec![0x00]);
        implicit.insert(OPT_ETHERNET_ENCAPSULATION, vec![0x00]);
        implicit.insert(OPT_TCP_KEEPALIVE_INTERVAL, 0u32.to_be_bytes().to_vec());
        implicit.insert(OPT_TCP_KEEPALIVE_GARBAGE, vec![0x00]);

        // DNS servers from the interface; clients are known to refuse a
        // singleton list, so one address is sent twice.
        if !dns.is_empty() {
            let list: Vec<Ipv4Addr> = if dns.len() == 1 {
                vec![dns[0], dns[0]]
            } else {
                dns.to_vec()
            };
            implicit.insert(OPT_DNS_SERVER, DhcpOption::dns_servers(&list).data);
        }

        let mut explicit = HashMap::new();
        for directive in directives {
            match parse_directive(directive) {
                Ok((code, value)) => {
                    implicit.remove(&code);
                    explicit.insert(code, value);
                }
                Err(e) => {
                    warn!("Skipping DHCP option directive {directive:?}: {e}");
                }
            }
        }

        Self { implicit, explicit }
    }

    /// Apply the policy to a response option list: add implicit defaults
    /// the client asked for in its parameter request list, then apply the
    /// explicit overrides and deletions.
    pub fn apply(&self, prl: Option<&[u8]>, options: &mut Vec<DhcpOption>) {
        if let Some(prl) = prl {
            for code in prl {
                if options.iter().any(|o| o.code == *code) {
                    continue;
                }
                if let Some(data) = self.implicit.get(code) {
                    options.push(DhcpOption::new(*code, data.clone()));
                }
            }
        }

        for (code, value) in &self.explicit {
            match value {
                OptionValue::Delete => options.retain(|o| o.code != *code),
                OptionValue::Data(data) => {
                    options.retain(|o| o.code != *code);
                    options.push(DhcpOption::new(*code, data.clone()));
                }
            }
        }
    }
}
