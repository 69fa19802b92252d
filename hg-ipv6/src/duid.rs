//! DHCP Unique Identifiers (RFC 8415 §11).

use std::time::{Duration, SystemTime};

use hg_common::HwAddr;

const DUID_TYPE_LLT: u16 = 1;
const DUID_TYPE_EN: u16 = 2;
const DUID_TYPE_LL: u16 = 3;

const HW_TYPE_ETHERNET: u16 = 1;

// DUID-LLT time is counted from midnight (UTC), January 1, 2000.
const BASE_TIME: Duration = Duration::new(946_684_800, 0);

/// Build the server's DUID-LLT from the interface MAC and the current
/// time. Generated once at startup.
pub fn server_duid(mac: &HwAddr) -> Vec<u8> {
    let time: u32 = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|s| s.checked_sub(BASE_TIME))
        .map(|t| t.as_secs() as u32)
        .unwrap_or_default();

    let mut duid = Vec::with_capacity(8 + mac.len());
    duid.extend_from_slice(&DUID_TYPE_LLT.to_be_bytes());
    duid.extend_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
    duid.extend_from_slice(&time.to_be_bytes());
    duid.extend_from_slice(mac.as_bytes());
    duid
}

/// Extract the client's hardware address from its DUID. LLT and LL carry
/// it directly; EN identifiers are only accepted when they happen to be
/// hardware-address shaped.
pub fn mac_from_duid(duid: &[u8]) -> Option<HwAddr> {
    if duid.len() < 2 {
        return None;
    }
    let duid_type = u16::from_be_bytes([duid[0], duid[1]]);
    let raw = match duid_type {
        DUID_TYPE_LLT => duid.get(8..)?,
        DUID_TYPE_LL => duid.get(4..)?,
        DUID_TYPE_EN => duid.get(6..)?,
        _ => return None,
    };
    HwAddr::new(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> HwAddr {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[test]
    fn test_server_duid_layout() {
        let duid = server_duid(&mac());
        assert_eq!(duid.len(), 14);
        assert_eq!(&duid[0..2], &[0x00, 0x01]); // DUID-LLT
        assert_eq!(&duid[2..4], &[0x00, 0x01]); // Ethernet
        assert_eq!(&duid[8..], mac().as_bytes());
        // time field is non-zero on any sane clock
        assert_ne!(&duid[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mac_from_duid_llt_roundtrip() {
        let duid = server_duid(&mac());
        assert_eq!(mac_from_duid(&duid), Some(mac()));
    }

    #[test]
    fn test_mac_from_duid_ll() {
        let mut duid = vec![0x00, 0x03, 0x00, 0x01];
        duid.extend_from_slice(mac().as_bytes());
        assert_eq!(mac_from_duid(&duid), Some(mac()));
    }

    #[test]
    fn test_mac_from_duid_en() {
        let mut duid = vec![0x00, 0x02, 0x00, 0x00, 0x09, 0x3c];
        duid.extend_from_slice(mac().as_bytes());
        assert_eq!(mac_from_duid(&duid), Some(mac()));

        // identifier that is not hardware-address shaped
        let duid = vec![0x00, 0x02, 0x00, 0x00, 0x09, 0x3c, 0x01, 0x02];
        assert_eq!(mac_from_duid(&duid), None);
    }

    #[test]
    fn test_mac_from_duid_rejects_garbage() {
        assert_eq!(mac_from_duid(&[]), None);
        assert_eq!(mac_from_duid(&[0x00]), None);
        assert_eq!(mac_from_duid(&[0x00, 0x04, 1, 2, 3]), None);
        // LLT too short for any address
        assert_eq!(mac_from_duid(&[0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0]), None);
    }
}
