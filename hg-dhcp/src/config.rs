use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hg_common::HwAddr;

use crate::options::OptionPolicy;
use crate::range::{Ip4Range, RangeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp4Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub interface: String,
    /// MAC of the serving interface, used as the raw-frame source address.
    #[serde(default)]
    pub interface_mac: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default = "default_netmask")]
    pub subnet_mask: String,
    #[serde(default)]
    pub range_start: String,
    #[serde(default)]
    pub range_end: String,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u32,
    /// 0 disables the pre-offer conflict probe.
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_msec: u64,
    /// Option directives, `<CODE> <TYPE> <VALUE>` per entry.
    #[serde(default)]
    pub options: Vec<String>,
    /// DNS-serving addresses of the interface; the first doubles as the
    /// server identifier.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// Duplicate MAC-unicast replies as a 255.255.255.255 broadcast.
    #[serde(default = "default_true")]
    pub broadcast_echo: bool,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
}

fn default_true() -> bool {
    true
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_lease_duration() -> u32 {
    86_400
}

fn default_icmp_timeout() -> u64 {
    1000
}

fn default_lease_file() -> String {
    "/var/lib/homegate/leases.json".to_string()
}

impl Default for Dhcp4Config {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid IPv4 address {0:?}")]
    BadAddress(String),
    #[error("invalid interface MAC {0:?}")]
    BadInterfaceMac(String),
    #[error("subnet mask {0} is not contiguous")]
    BadMask(Ipv4Addr),
    #[error("range start must not be unspecified")]
    ZeroRangeStart,
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("range endpoint {0} is outside subnet {1}/{2}")]
    RangeOutsideSubnet(Ipv4Addr, Ipv4Addr, Ipv4Addr),
    #[error("gateway {0} must not be inside the dynamic range")]
    GatewayInRange(Ipv4Addr),
}

/// The v4 engine's validated view of its configuration.
#[derive(Debug, Clone)]
pub struct ValidatedV4 {
    pub interface: String,
    pub interface_mac: HwAddr,
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Network address, `gateway & mask`.
    pub network: Ipv4Addr,
    /// Interface broadcast, `network | !mask`.
    pub broadcast: Ipv4Addr,
    pub range: Ip4Range,
    pub server_id: Ipv4Addr,
    pub lease_duration: Duration,
    pub icmp_timeout: Option<Duration>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub policy: OptionPolicy,
    pub broadcast_echo: bool,
    pub lease_file: PathBuf,
}

impl ValidatedV4 {
    pub fn subnet_contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.subnet_mask) == u32::from(self.network)
    }
}

fn parse_v4(s: &str) -> Result<Ipv4Addr, ConfigError> {
    s.parse().map_err(|_| ConfigError::BadAddress(s.to_string()))
}

impl Dhcp4Config {
    /// Validate the configuration into the engine's working form. Any error
    /// disables the v4 family (the caller decides whether the other family
    /// keeps the process alive).
    pub fn validate(&self) -> Result<ValidatedV4, ConfigError> {
        let gateway = parse_v4(&self.gateway)?;
        let subnet_mask = parse_v4(&self.subnet_mask)?;

        // Contiguous mask: ones followed by zeroes.
        let mask = u32::from(subnet_mask);
        if mask == 0 || (!mask + 1) & !mask != 0 {
            return Err(ConfigError::BadMask(subnet_mask));
        }

        let range_start = parse_v4(&self.range_start)?;
        if range_start.is_unspecified() {
            return Err(ConfigError::ZeroRangeStart);
        }
        let range_end = parse_v4(&self.range_end)?;
        let range = Ip4Range::new(range_start, range_end)?;

        let network = Ipv4Addr::from(u32::from(gateway) & mask);
        let broadcast = Ipv4Addr::from(u32::from(network) | !mask);
        for endpoint in [range_start, range_end] {
            if u32::from(endpoint) & mask != u32::from(network) {
                return Err(ConfigError::RangeOutsideSubnet(endpoint, network, subnet_mask));
            }
        }

        if range.contains(gateway) {
            return Err(ConfigError::GatewayInRange(gateway));
        }

        let interface_mac: HwAddr = self
            .interface_mac
            .parse()
            .map_err(|_| ConfigError::BadInterfaceMac(self.interface_mac.clone()))?;

        let mut dns_servers = Vec::new();
        for s in &self.dns_servers {
            dns_servers.push(parse_v4(s)?);
        }
        let server_id = dns_servers.first().copied().unwrap_or(gateway);

        let lease_duration = if self.lease_duration_secs == 0 {
            Duration::from_secs(86_400)
        } else {
            Duration::from_secs(u64::from(self.lease_duration_secs))
        };

        let icmp_timeout = if self.icmp_timeout_msec == 0 {
            None
        } else {
            Some(Duration::from_millis(self.icmp_timeout_msec))
        };

        Ok(ValidatedV4 {
            interface: self.interface.clone(),
            interface_mac,
            gateway,
            subnet_mask,
            network,
            broadcast,
            range,
            server_id,
            lease_duration,
            icmp_timeout,
            policy: OptionPolicy::new(&dns_servers, &self.options),
            dns_servers,
            broadcast_echo: self.broadcast_echo,
            lease_file: PathBuf::from(&self.lease_file),
        })
    }
}
