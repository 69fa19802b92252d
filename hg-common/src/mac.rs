use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Hardware address lengths accepted on the wire: Ethernet, EUI-64, IPoIB.
const VALID_LENGTHS: [usize; 3] = [6, 8, 20];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    #[error("invalid hardware address length {0}, expected 6, 8 or 20 octets")]
    BadLength(usize),
    #[error("invalid hardware address {0:?}, expected colon-separated hex")]
    BadFormat(String),
}

/// A client hardware address (6, 8 or 20 octets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwAddr(Vec<u8>);

impl HwAddr {
    pub fn new(octets: &[u8]) -> Result<Self, MacError> {
        if !VALID_LENGTHS.contains(&octets.len()) {
            return Err(MacError::BadLength(octets.len()));
        }
        Ok(Self(octets.to_vec()))
    }

    /// An all-zero Ethernet address, used to mark blocklisted leases.
    pub fn zero() -> Self {
        Self(vec![0u8; 6])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for HwAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let mut octets = Vec::new();
        for part in s.split(':') {
            let b = u8::from_str_radix(part, 16)
                .map_err(|_| MacError::BadFormat(s.to_string()))?;
            octets.push(b);
        }
        Self::new(&octets)
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: HwAddr = "aa:BB:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_reject_bad_lengths() {
        assert!(matches!(
            "aa:bb:cc".parse::<HwAddr>(),
            Err(MacError::BadLength(3))
        ));
        assert!(HwAddr::new(&[0u8; 8]).is_ok());
        assert!(HwAddr::new(&[0u8; 20]).is_ok());
        assert!(HwAddr::new(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_reject_bad_format() {
        assert!("aa:zz:cc:dd:ee:ff".parse::<HwAddr>().is_err());
        assert!("".parse::<HwAddr>().is_err());
    }

    #[test]
    fn test_zero() {
        assert!(HwAddr::zero().is_zero());
        assert!(!"aa:bb:cc:dd:ee:ff".parse::<HwAddr>().unwrap().is_zero());
    }
}
