//! DHCPv6 message codec (RFC 8415 §8): type, transaction id, options.
//! Relayed messages are unwrapped to the innermost client message.

use crate::options::{
    self, V6Option, OPTION_CLIENTID, OPTION_CLIENT_FQDN, OPTION_IA_NA, OPTION_ORO,
    OPTION_RAPID_COMMIT, OPTION_RELAY_MSG, OPTION_SERVERID,
};
use crate::options::IaNa;

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_CONFIRM: u8 = 4;
pub const MSG_RENEW: u8 = 5;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RELEASE: u8 = 8;
pub const MSG_DECLINE: u8 = 9;
pub const MSG_RELAY_FORW: u8 = 12;
pub const MSG_RELAY_REPL: u8 = 13;

/// Relay nesting is bounded by RFC 8415 §19 (HOP_COUNT_LIMIT).
const MAX_RELAY_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V6Message {
    pub msg_type: u8,
    pub xid: [u8; 3],
    pub options: Vec<V6Option>,
}

impl V6Message {
    /// Parse a client message, unwrapping any relay encapsulation first.
    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::parse_inner(data, 0)
    }

    fn parse_inner(data: &[u8], depth: usize) -> Option<Self> {
        if depth > MAX_RELAY_DEPTH || data.is_empty() {
            return None;
        }

        let msg_type = data[0];
        if msg_type == MSG_RELAY_FORW || msg_type == MSG_RELAY_REPL {
            // type(1) hop-count(1) link-address(16) peer-address(16) options
            if data.len() < 34 {
                return None;
            }
            let inner = options::parse_options(&data[34..])
                .into_iter()
                .find(|o| o.code == OPTION_RELAY_MSG)?;
            return Self::parse_inner(&inner.data, depth + 1);
        }

        if data.len() < 4 {
            return None;
        }
        Some(Self {
            msg_type,
            xid: [data[1], data[2], data[3]],
            options: options::parse_options(&data[4..]),
        })
    }

    pub fn new(msg_type: u8, xid: [u8; 3]) -> Self {
        Self {
            msg_type,
            xid,
            options: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.xid);
        options::encode_options(&self.options, &mut buf);
        buf
    }

    pub fn get_option(&self, code: u16) -> Option<&V6Option> {
        self.options.iter().find(|o| o.code == code)
    }

    pub fn add_option(&mut self, opt: V6Option) {
        self.options.push(opt);
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.get_option(OPTION_CLIENTID).map(|o| o.data.as_slice())
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.get_option(OPTION_SERVERID).map(|o| o.data.as_slice())
    }

    pub fn rapid_commit(&self) -> bool {
        self.get_option(OPTION_RAPID_COMMIT).is_some()
    }

    pub fn ia_na(&self) -> Option<IaNa> {
        IaNa::parse(&self.get_option(OPTION_IA_NA)?.data)
    }

    pub fn fqdn(&self) -> Option<&V6Option> {
        self.get_option(OPTION_CLIENT_FQDN)
    }

    /// Option codes the client asked for (Option Request Option).
    pub fn requested_options(&self) -> Vec<u16> {
        match self.get_option(OPTION_ORO) {
            Some(o) => o
                .data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut msg = V6Message::new(MSG_SOLICIT, [1, 2, 3]);
        msg.add_option(V6Option::new(OPTION_CLIENTID, vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]));
        msg.add_option(V6Option::new(OPTION_RAPID_COMMIT, vec![]));

        let parsed = V6Message::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.rapid_commit());
        assert_eq!(parsed.client_id(), Some(&[0, 3, 0, 1, 1, 2, 3, 4, 5, 6][..]));
    }

    #[test]
    fn test_relay_unwrap() {
        let mut inner = V6Message::new(MSG_REQUEST, [9, 8, 7]);
        inner.add_option(V6Option::new(OPTION_CLIENTID, vec![1, 2, 3, 4, 5, 6, 7, 8]));
        let inner_bytes = inner.to_bytes();

        let mut relay = vec![MSG_RELAY_FORW, 0];
        relay.extend_from_slice(&[0u8; 32]); // link + peer addresses
        relay.extend_from_slice(&OPTION_RELAY_MSG.to_be_bytes());
        relay.extend_from_slice(&(inner_bytes.len() as u16).to_be_bytes());
        relay.extend_from_slice(&inner_bytes);

        let parsed = V6Message::parse(&relay).unwrap();
        assert_eq!(parsed.msg_type, MSG_REQUEST);
        assert_eq!(parsed.xid, [9, 8, 7]);
    }

    #[test]
    fn test_relay_without_inner_message() {
        let mut relay = vec![MSG_RELAY_FORW, 0];
        relay.extend_from_slice(&[0u8; 32]);
        assert!(V6Message::parse(&relay).is_none());
    }

    #[test]
    fn test_short_input() {
        assert!(V6Message::parse(&[]).is_none());
        assert!(V6Message::parse(&[MSG_SOLICIT, 1]).is_none());
        assert!(V6Message::parse(&[MSG_RELAY_FORW, 0, 0]).is_none());
    }

    #[test]
    fn test_requested_options() {
        let mut msg = V6Message::new(MSG_SOLICIT, [0, 0, 1]);
        msg.add_option(V6Option::new(OPTION_ORO, vec![0, 23, 0, 39]));
        assert_eq!(msg.requested_options(), vec![23, 39]);
    }
}
