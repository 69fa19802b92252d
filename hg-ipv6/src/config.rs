use std::net::Ipv6Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hg_common::HwAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub interface_mac: String,
    #[serde(default = "default_mtu")]
    pub interface_mtu: u32,
    /// Start of the dynamic block; addresses sharing its first 15 octets
    /// with a final octet at or above it are allocatable.
    #[serde(default)]
    pub range_start: String,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u32,
    /// Announce the prefix for SLAAC alongside DHCPv6.
    #[serde(default)]
    pub ra_allow_slaac: bool,
    /// SLAAC only: send RAs but never start the DHCPv6 engine.
    #[serde(default)]
    pub ra_slaac_only: bool,
    #[serde(default = "default_send_period")]
    pub packet_send_period_secs: u64,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

fn default_mtu() -> u32 {
    1500
}

fn default_lease_duration() -> u32 {
    86_400
}

fn default_send_period() -> u64 {
    1
}

impl Default for Ipv6Config {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid IPv6 address {0:?}")]
    BadAddress(String),
    #[error("range start must not be unspecified")]
    ZeroRangeStart,
    #[error("invalid interface MAC {0:?}")]
    BadInterfaceMac(String),
}

#[derive(Debug, Clone)]
pub struct ValidatedV6 {
    pub interface: String,
    pub interface_mac: HwAddr,
    pub interface_mtu: u32,
    pub range_start: Ipv6Addr,
    pub lease_duration: Duration,
    pub ra_allow_slaac: bool,
    pub ra_slaac_only: bool,
    pub packet_send_period: Duration,
    pub dns_servers: Vec<Ipv6Addr>,
}

impl ValidatedV6 {
    pub fn ra_enabled(&self) -> bool {
        self.ra_allow_slaac || self.ra_slaac_only
    }

    pub fn dhcp_enabled(&self) -> bool {
        !self.ra_slaac_only
    }
}

impl Ipv6Config {
    pub fn validate(&self) -> Result<ValidatedV6, ConfigError> {
        let range_start: Ipv6Addr = self
            .range_start
            .parse()
            .map_err(|_| ConfigError::BadAddress(self.range_start.clone()))?;
        if range_start.is_unspecified() {
            return Err(ConfigError::ZeroRangeStart);
        }

        let interface_mac: HwAddr = self
            .interface_mac
            .parse()
            .map_err(|_| ConfigError::BadInterfaceMac(self.interface_mac.clone()))?;

        let mut dns_servers = Vec::new();
        for s in &self.dns_servers {
            dns_servers.push(
                s.parse::<Ipv6Addr>()
                    .map_err(|_| ConfigError::BadAddress(s.clone()))?,
            );
        }

        let lease_duration = if self.lease_duration_secs == 0 {
            Duration::from_secs(86_400)
        } else {
            Duration::from_secs(u64::from(self.lease_duration_secs))
        };

        Ok(ValidatedV6 {
            interface: self.interface.clone(),
            interface_mac,
            interface_mtu: self.interface_mtu,
            range_start,
            lease_duration,
            ra_allow_slaac: self.ra_allow_slaac,
            ra_slaac_only: self.ra_slaac_only,
            packet_send_period: Duration::from_secs(self.packet_send_period_secs.max(1)),
            dns_servers,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> Ipv6Config {
        Ipv6Config {
            enabled: true,
            interface: "br-lan".into(),
            interface_mac: "02:00:00:00:00:01".into(),
            range_start: "2001::2".into(),
            dns_servers: vec!["2001::1".into()],
            ..Ipv6Config::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let v = test_config().validate().unwrap();
        assert_eq!(v.range_start, "2001::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(v.lease_duration, Duration::from_secs(86_400));
        assert!(!v.ra_enabled());
        assert!(v.dhcp_enabled());
    }

    #[test]
    fn test_slaac_only_disables_dhcp() {
        let mut cfg = test_config();
        cfg.ra_slaac_only = true;
        let v = cfg.validate().unwrap();
        assert!(v.ra_enabled());
        assert!(!v.dhcp_enabled());
    }

    #[test]
    fn test_bad_range_start() {
        let mut cfg = test_config();
        cfg.range_start = "not-an-ip".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::BadAddress(_))));

        let mut cfg = test_config();
        cfg.range_start = "::".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroRangeStart)));
    }
}
