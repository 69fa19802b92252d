use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hg_common::{EventBus, Family, HwAddr, Lease, LeaseEventKind, LeaseFilter, StoreError};

use crate::config::ValidatedV6;

/// The v6 lease table.
///
/// The dynamic block is every address sharing the first 15 octets of
/// `range_start` whose final octet is at or above `range_start`'s; a dense
/// 256-entry index over that final octet tracks occupancy. This pins the
/// pool to a /120 tail, narrower than any RFC requires, but it matches the
/// deployed behavior and keeps allocation a table walk.
#[derive(Debug)]
pub struct LeaseStoreV6 {
    leases: Vec<Lease>,
    hostnames: HashSet<String>,
    taken: [bool; 256],
    range_start: Ipv6Addr,
    lease_duration: TimeDelta,
}

impl LeaseStoreV6 {
    pub fn new(cfg: &ValidatedV6) -> Self {
        Self {
            leases: Vec::new(),
            hostnames: HashSet::new(),
            taken: [false; 256],
            range_start: cfg.range_start,
            lease_duration: TimeDelta::from_std(cfg.lease_duration)
                .unwrap_or_else(|_| TimeDelta::seconds(86_400)),
        }
    }

    pub fn in_range(&self, ip: Ipv6Addr) -> bool {
        let (o, s) = (ip.octets(), self.range_start.octets());
        o[..15] == s[..15] && o[15] >= s[15]
    }

    fn addr_at(&self, octet: u8) -> Ipv6Addr {
        let mut o = self.range_start.octets();
        o[15] = octet;
        Ipv6Addr::from(o)
    }

    fn insert(&mut self, lease: Lease) {
        if let IpAddr::V6(ip) = lease.ip {
            if self.in_range(ip) {
                self.taken[usize::from(ip.octets()[15])] = true;
            }
        }
        if !lease.hostname.is_empty() {
            self.hostnames.insert(lease.hostname.clone());
        }
        self.leases.push(lease);
    }

    fn remove_at(&mut self, i: usize) -> Lease {
        let lease = self.leases.swap_remove(i);
        if let IpAddr::V6(ip) = lease.ip {
            if self.in_range(ip) {
                self.taken[usize::from(ip.octets()[15])] = false;
            }
        }
        if !lease.hostname.is_empty() {
            self.hostnames.remove(&lease.hostname);
        }
        lease
    }

    pub fn find_by_mac(&self, mac: &HwAddr) -> Option<&Lease> {
        if mac.is_zero() {
            return None;
        }
        self.leases.iter().find(|l| l.hwaddr == *mac)
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<&Lease> {
        self.leases.iter().find(|l| l.ip == ip)
    }

    // ── admin operations ───────────────────────────────────────────────

    pub fn add_static(&mut self, lease: Lease) -> Result<Vec<LeaseEventKind>, StoreError> {
        if lease.hwaddr.is_zero() {
            return Err(StoreError::InvalidMac);
        }
        let IpAddr::V6(_) = lease.ip else {
            return Err(StoreError::InvalidIp(lease.ip));
        };
        if !lease.hostname.is_empty() {
            if let Some(other) = self
                .leases
                .iter()
                .find(|l| l.is_static && l.hostname == lease.hostname)
            {
                if other.hwaddr != lease.hwaddr || other.ip != lease.ip {
                    return Err(StoreError::DuplicateHostname(lease.hostname));
                }
            }
        }

        let mut displaced = Vec::new();
        for (i, l) in self.leases.iter().enumerate() {
            if l.hwaddr == lease.hwaddr || l.ip == lease.ip {
                if l.is_static {
                    return Err(StoreError::StaticExists(l.ip));
                }
                displaced.push(i);
            }
        }
        displaced.sort_unstable();
        for i in displaced.into_iter().rev() {
            self.remove_at(i);
        }

        self.insert(Lease {
            is_static: true,
            expires: None,
            ..lease
        });
        Ok(vec![LeaseEventKind::DbStore, LeaseEventKind::AddedStatic])
    }

    pub fn update_static(&mut self, lease: Lease) -> Result<Vec<LeaseEventKind>, StoreError> {
        let IpAddr::V6(_) = lease.ip else {
            return Err(StoreError::InvalidIp(lease.ip));
        };
        let i = self
            .leases
            .iter()
            .position(|l| l.is_static && l.hwaddr == lease.hwaddr)
            .ok_or(StoreError::NotFound)?;

        if let Some(other) = self.find_by_ip(lease.ip) {
            if other.hwaddr != lease.hwaddr {
                return Err(StoreError::StaticExists(other.ip));
            }
        }
        if !lease.hostname.is_empty()
            && self.hostnames.contains(&lease.hostname)
            && self.leases[i].hostname != lease.hostname
        {
            return Err(StoreError::DuplicateHostname(lease.hostname));
        }

        self.remove_at(i);
        self.insert(Lease {
            is_static: true,
            expires: None,
            ..lease
        });
        Ok(vec![LeaseEventKind::DbStore, LeaseEventKind::AddedStatic])
    }

    pub fn remove_static(&mut self, lease: &Lease) -> Result<Vec<LeaseEventKind>, StoreError> {
        let i = self
            .leases
            .iter()
            .position(|l| l.ip == lease.ip)
            .ok_or(StoreError::NotFound)?;
        let found = &self.leases[i];
        if !found.is_static || found.hwaddr != lease.hwaddr || found.hostname != lease.hostname {
            return Err(StoreError::NotFound);
        }
        self.remove_at(i);
        Ok(vec![LeaseEventKind::DbStore, LeaseEventKind::RemovedStatic])
    }

    pub fn get(&self, filter: LeaseFilter) -> Vec<Lease> {
        let now = Utc::now();
        self.leases
            .iter()
            .filter(|l| match filter {
                LeaseFilter::All => true,
                LeaseFilter::Static => l.is_static,
                LeaseFilter::Dynamic => {
                    !l.is_static && !l.is_expired(now) && !l.is_blocklisted()
                }
            })
            .cloned()
            .collect()
    }

    /// Replace the table with `seed`; dynamic entries outside the /120
    /// tail are dropped.
    pub fn reset(&mut self, seed: Vec<Lease>) -> Vec<LeaseEventKind> {
        self.leases.clear();
        self.hostnames.clear();
        self.taken = [false; 256];
        for lease in seed {
            let IpAddr::V6(ip) = lease.ip else {
                continue;
            };
            if (lease.is_static || self.in_range(ip)) && self.find_by_ip(lease.ip).is_none() {
                self.insert(lease);
            }
        }
        vec![LeaseEventKind::DbStore, LeaseEventKind::RemovedAll]
    }

    // ── resolver lookups ───────────────────────────────────────────────

    fn live(&self, l: &Lease) -> bool {
        !l.is_blocklisted() && !l.is_expired(Utc::now())
    }

    pub fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.leases
            .iter()
            .find(|l| l.ip == ip && self.live(l))
            .map(|l| l.hwaddr.clone())
    }

    pub fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.leases
            .iter()
            .find(|l| l.ip == ip && self.live(l) && !l.hostname.is_empty())
            .map(|l| l.hostname.clone())
    }

    pub fn ip_by_host(&self, host: &str) -> Option<IpAddr> {
        let host = host.to_lowercase();
        self.leases
            .iter()
            .find(|l| l.hostname == host && self.live(l))
            .map(|l| l.ip)
    }

    // ── allocation ─────────────────────────────────────────────────────

    /// Allocate the lowest free final octet at or above the range start,
    /// or recycle an expired dynamic slot.
    pub fn reserve(&mut self, mac: &HwAddr) -> Option<Lease> {
        let first = self.range_start.octets()[15];
        let free = (first..=u8::MAX).find(|o| !self.taken[usize::from(*o)]);

        if let Some(octet) = free {
            let lease = Lease::new_dynamic(
                mac.clone(),
                IpAddr::V6(self.addr_at(octet)),
                Utc::now() + self.lease_duration,
            );
            self.insert(lease.clone());
            return Some(lease);
        }

        let now = Utc::now();
        let i = self
            .leases
            .iter()
            .position(|l| !l.is_static && l.is_expired(now))?;
        let hostname = std::mem::take(&mut self.leases[i].hostname);
        if !hostname.is_empty() {
            self.hostnames.remove(&hostname);
        }
        self.leases[i].hwaddr = mac.clone();
        self.leases[i].expires = Some(now + self.lease_duration);
        Some(self.leases[i].clone())
    }

    /// Advance a dynamic lease's expiry a full lease duration from now.
    pub fn commit(&mut self, mac: &HwAddr) -> Option<Lease> {
        let lease = self.leases.iter_mut().find(|l| l.hwaddr == *mac)?;
        if !lease.is_static {
            lease.expires = Some(Utc::now() + self.lease_duration);
        }
        Some(lease.clone())
    }

    /// Seconds left on the lease; zero once expired and unbounded for a
    /// static binding, capped at the configured duration.
    pub fn remaining_lifetime(&self, lease: &Lease, now: DateTime<Utc>) -> u32 {
        let full = self.lease_duration.num_seconds().max(0) as u32;
        match lease.expires {
            None => full,
            Some(t) => (t - now).num_seconds().clamp(0, i64::from(full)) as u32,
        }
    }

    pub fn lease_duration_secs(&self) -> u32 {
        self.lease_duration.num_seconds().max(0) as u32
    }

    /// Remove every dynamic lease matching `mac` and `ip`.
    pub fn release(&mut self, mac: &HwAddr, ip: IpAddr) -> usize {
        let mut removed = 0;
        while let Some(i) = self
            .leases
            .iter()
            .position(|l| !l.is_static && l.hwaddr == *mac && l.ip == ip)
        {
            self.remove_at(i);
            removed += 1;
        }
        removed
    }
}

/// Thread-safe handle mirroring the v4 store wrapper; events go out after
/// the guard is dropped.
#[derive(Clone)]
pub struct SharedLeaseStoreV6 {
    inner: Arc<RwLock<LeaseStoreV6>>,
    events: Arc<EventBus>,
}

impl SharedLeaseStoreV6 {
    pub fn new(store: LeaseStoreV6, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
            events,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, LeaseStoreV6> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, LeaseStoreV6> {
        self.inner.write().await
    }

    pub fn publish(&self, kinds: &[LeaseEventKind]) {
        self.events.publish(Family::V6, kinds);
    }

    pub async fn add_static(&self, lease: Lease) -> Result<(), StoreError> {
        let kinds = self.inner.write().await.add_static(lease)?;
        self.publish(&kinds);
        Ok(())
    }

    pub async fn update_static(&self, lease: Lease) -> Result<(), StoreError> {
        let kinds = self.inner.write().await.update_static(lease)?;
        self.publish(&kinds);
        Ok(())
    }

    pub async fn remove_static(&self, lease: &Lease) -> Result<(), StoreError> {
        let kinds = self.inner.write().await.remove_static(lease)?;
        self.publish(&kinds);
        Ok(())
    }

    pub async fn get(&self, filter: LeaseFilter) -> Vec<Lease> {
        self.inner.read().await.get(filter)
    }

    pub async fn reset(&self, seed: Vec<Lease>) {
        let kinds = self.inner.write().await.reset(seed);
        self.publish(&kinds);
    }

    pub async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.inner.read().await.mac_by_ip(ip)
    }

    pub async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.inner.read().await.host_by_ip(ip)
    }

    pub async fn ip_by_host(&self, host: &str) -> Option<IpAddr> {
        self.inner.read().await.ip_by_host(host)
    }
}
