use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mac::HwAddr;

/// Which leases a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseFilter {
    Dynamic,
    Static,
    All,
}

/// Policy errors returned synchronously to the admin caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("another static lease uses hostname {0:?}")]
    DuplicateHostname(String),
    #[error("a static lease already exists for {0}")]
    StaticExists(IpAddr),
    #[error("no matching lease found")]
    NotFound,
    #[error("invalid hardware address")]
    InvalidMac,
    #[error("invalid IP address {0}")]
    InvalidIp(IpAddr),
    #[error("IP address {0} is outside the configured subnet")]
    IpOutsideSubnet(IpAddr),
    #[error("IP address {0} is the gateway address")]
    GatewayIp(IpAddr),
}

/// An address binding handed out to (or reserved for) a client.
///
/// `expires` is `None` for static leases, which never expire. A lease whose
/// hardware address is all-zero marks an IP that answered a conflict probe;
/// it holds its slot until the expiry passes and the slot is recycled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub hwaddr: HwAddr,
    pub ip: IpAddr,
    pub hostname: String,
    pub expires: Option<DateTime<Utc>>,
    pub is_static: bool,
}

impl Lease {
    pub fn new_static(hwaddr: HwAddr, ip: IpAddr, hostname: String) -> Self {
        Self {
            hwaddr,
            ip,
            hostname,
            expires: None,
            is_static: true,
        }
    }

    pub fn new_dynamic(hwaddr: HwAddr, ip: IpAddr, expires: DateTime<Utc>) -> Self {
        Self {
            hwaddr,
            ip,
            hostname: String::new(),
            expires: Some(expires),
            is_static: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(t) => !self.is_static && t <= now,
            None => false,
        }
    }

    /// True for the placeholder leases that keep a conflicted IP out of the
    /// allocation pool.
    pub fn is_blocklisted(&self) -> bool {
        self.hwaddr.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn mac() -> HwAddr {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[test]
    fn test_static_never_expires() {
        let lease = Lease::new_static(mac(), "192.168.0.2".parse().unwrap(), "h".into());
        assert!(!lease.is_expired(Utc::now() + TimeDelta::days(365)));
    }

    #[test]
    fn test_dynamic_expiry() {
        let now = Utc::now();
        let lease = Lease::new_dynamic(mac(), "192.168.0.2".parse().unwrap(), now);
        assert!(lease.is_expired(now));
        assert!(!lease.is_expired(now - TimeDelta::seconds(1)));
    }

    #[test]
    fn test_blocklisted() {
        let mut lease = Lease::new_dynamic(mac(), "192.168.0.2".parse().unwrap(), Utc::now());
        assert!(!lease.is_blocklisted());
        lease.hwaddr = HwAddr::zero();
        assert!(lease.is_blocklisted());
    }
}
