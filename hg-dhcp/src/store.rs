use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hg_common::{EventBus, Family, HwAddr, Lease, LeaseEventKind};

pub use hg_common::{LeaseFilter, StoreError};

use crate::bitset::OffsetBitSet;
use crate::config::ValidatedV4;
use crate::hostname::{generate_hostname, normalize_hostname};
use crate::range::Ip4Range;

/// The v4 lease table. One instance per server, always accessed through
/// [`SharedLeaseStore`] outside of construction.
///
/// Deletion swap-removes, so lease order is not stable; the snapshot layer
/// sorts by hostname before writing.
#[derive(Debug)]
pub struct LeaseStore {
    leases: Vec<Lease>,
    /// Non-empty hostnames currently in use, lowercase.
    hostnames: HashSet<String>,
    bits: OffsetBitSet,
    range: Ip4Range,
    gateway: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    network: Ipv4Addr,
    lease_duration: TimeDelta,
}

impl LeaseStore {
    pub fn new(cfg: &ValidatedV4) -> Self {
        Self {
            leases: Vec::new(),
            hostnames: HashSet::new(),
            bits: OffsetBitSet::new(),
            range: cfg.range,
            gateway: cfg.gateway,
            subnet_mask: cfg.subnet_mask,
            network: cfg.network,
            lease_duration: TimeDelta::from_std(cfg.lease_duration)
                .unwrap_or_else(|_| TimeDelta::seconds(86_400)),
        }
    }

    pub fn range(&self) -> &Ip4Range {
        &self.range
    }

    fn subnet_contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.subnet_mask) == u32::from(self.network)
    }

    fn as_v4(ip: IpAddr) -> Result<Ipv4Addr, StoreError> {
        match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(StoreError::InvalidIp(ip)),
        }
    }

    // ── internal bookkeeping ───────────────────────────────────────────

    fn insert(&mut self, lease: Lease) {
        if let IpAddr::V4(ip) = lease.ip {
            if let Some(offset) = self.range.offset(ip) {
                self.bits.set(offset, true);
            }
        }
        if !lease.hostname.is_empty() {
            self.hostnames.insert(lease.hostname.clone());
        }
        self.leases.push(lease);
    }

    /// Swap-remove the lease at `i`, clearing its bitset bit and hostname.
    fn remove_at(&mut self, i: usize) -> Lease {
        let lease = self.leases.swap_remove(i);
        if let IpAddr::V4(ip) = lease.ip {
            if let Some(offset) = self.range.offset(ip) {
                self.bits.set(offset, false);
            }
        }
        if !lease.hostname.is_empty() {
            self.hostnames.remove(&lease.hostname);
        }
        lease
    }

    fn index_by_ip(&self, ip: IpAddr) -> Option<usize> {
        self.leases.iter().position(|l| l.ip == ip)
    }

    fn index_by_mac(&self, mac: &HwAddr) -> Option<usize> {
        if mac.is_zero() {
            return None;
        }
        self.leases.iter().position(|l| l.hwaddr == *mac)
    }

    pub fn find_by_mac(&self, mac: &HwAddr) -> Option<&Lease> {
        self.index_by_mac(mac).map(|i| &self.leases[i])
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<&Lease> {
        self.index_by_ip(ip).map(|i| &self.leases[i])
    }

    // ── admin operations ───────────────────────────────────────────────

    pub fn add_static(&mut self, lease: Lease) -> Result<Vec<LeaseEventKind>, StoreError> {
        if lease.hwaddr.is_zero() {
            return Err(StoreError::InvalidMac);
        }
        let ip = Self::as_v4(lease.ip)?;
        if ip == self.gateway {
            return Err(StoreError::GatewayIp(lease.ip));
        }
        if !self.subnet_contains(ip) {
            return Err(StoreError::IpOutsideSubnet(lease.ip));
        }
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

        // A static entry displaces dynamic leases holding the same MAC or
        // IP, but never another static one.
        let mut displaced = Vec::new();
        for (i, l) in self.leases.iter().enumerate() {
            if l.hwaddr == lease.hwaddr || l.ip == lease.ip {
                if l.is_static {
                    return Err(StoreError::StaticExists(l.ip));
                }
                displaced.push(i);
            }
        }
        // Remove back-to-front so swap_remove does not shift earlier hits.
        displaced.sort_unstable();
        for i in displaced.into_iter().rev() {
            self.remove_at(i);
        }

        // A dynamic lease elsewhere may still hold the hostname; the static
        // add wins and the dynamic lease loses the name.
        if !lease.hostname.is_empty() {
            for l in &mut self.leases {
                if !l.is_static && l.hostname == lease.hostname {
                    self.hostnames.remove(&l.hostname);
                    l.hostname.clear();
                }
            }
        }

        self.insert(Lease {
            is_static: true,
            expires: None,
            ..lease
        });
        Ok(vec![LeaseEventKind::DbStore, LeaseEventKind::AddedStatic])
    }

    pub fn update_static(&mut self, lease: Lease) -> Result<Vec<LeaseEventKind>, StoreError> {
        let ip = Self::as_v4(lease.ip)?;
        if ip == self.gateway {
            return Err(StoreError::GatewayIp(lease.ip));
        }
        if !self.subnet_contains(ip) {
            return Err(StoreError::IpOutsideSubnet(lease.ip));
        }

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
        let i = self.index_by_ip(lease.ip).ok_or(StoreError::NotFound)?;
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

    /// Replace the whole table with `seed`, dropping dynamic entries
    /// outside the range and static entries outside the subnet.
    pub fn reset(&mut self, seed: Vec<Lease>) -> Vec<LeaseEventKind> {
        self.leases.clear();
        self.hostnames.clear();
        self.bits.clear();
        for lease in seed {
            let Ok(ip) = Self::as_v4(lease.ip) else {
                continue;
            };
            let keep = if lease.is_static {
                self.subnet_contains(ip)
            } else {
                self.range.contains(ip)
            };
            if keep && self.index_by_ip(lease.ip).is_none() {
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

    /// Allocate a lease for `mac`: the lowest free range offset, or a
    /// recycled expired dynamic slot when the pool is full.
    pub fn reserve(&mut self, mac: &HwAddr) -> Option<Lease> {
        let bits = &self.bits;
        let range = self.range;
        let free = range.find(|ip| {
            range
                .offset(ip)
                .is_some_and(|offset| !bits.is_set(offset))
        });

        if let Some(ip) = free {
            let lease = Lease::new_dynamic(
                mac.clone(),
                IpAddr::V4(ip),
                Utc::now() + self.lease_duration,
            );
            self.insert(lease.clone());
            return Some(lease);
        }

        // Pool exhausted: recycle the first expired dynamic slot, keeping
        // its IP.
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

    /// Mark the lease holding `ip` as conflicted: zero its MAC, drop its
    /// hostname and push the expiry a full lease duration out so the slot
    /// stays blocked.
    pub fn blocklist(&mut self, ip: IpAddr) {
        if let Some(i) = self.index_by_ip(ip) {
            let hostname = std::mem::take(&mut self.leases[i].hostname);
            if !hostname.is_empty() {
                self.hostnames.remove(&hostname);
            }
            self.leases[i].hwaddr = HwAddr::zero();
            self.leases[i].expires = Some(Utc::now() + self.lease_duration);
        }
    }

    /// Commit a dynamic lease at REQUEST time: settle the hostname and
    /// advance the expiry. `candidate` is the client-requested name before
    /// normalization.
    pub fn commit(&mut self, mac: &HwAddr, candidate: Option<&str>) -> Option<Lease> {
        let i = self.index_by_mac(mac)?;
        if self.leases[i].is_static {
            return Some(self.leases[i].clone());
        }

        let ip = self.leases[i].ip;
        let previous = self.leases[i].hostname.clone();
        let mut chosen = candidate
            .and_then(normalize_hostname)
            .unwrap_or_else(|| generate_hostname(ip));

        let collides = |store: &Self, name: &str, own: usize| {
            store
                .leases
                .iter()
                .enumerate()
                .any(|(j, l)| j != own && l.hostname == name)
        };

        if collides(self, &chosen, i) {
            // A fresh allocation falls back to the generated name; a lease
            // that already had one keeps it.
            chosen = if previous.is_empty() {
                generate_hostname(ip)
            } else {
                previous.clone()
            };
            if collides(self, &chosen, i) {
                chosen = previous.clone();
            }
        }

        if chosen != previous {
            if !previous.is_empty() {
                self.hostnames.remove(&previous);
            }
            if !chosen.is_empty() {
                self.hostnames.insert(chosen.clone());
            }
            self.leases[i].hostname = chosen;
        }
        self.leases[i].expires = Some(Utc::now() + self.lease_duration);
        Some(self.leases[i].clone())
    }

    /// Remove every dynamic lease matching `mac` and `ip` (RELEASE).
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

/// Thread-safe handle around the store. Mutations publish their
/// lease-change events only after the write guard has been dropped, so
/// subscribers may call back in without deadlocking.
#[derive(Clone)]
pub struct SharedLeaseStore {
    inner: Arc<RwLock<LeaseStore>>,
    events: Arc<EventBus>,
    family: Family,
}

impl SharedLeaseStore {
    pub fn new(store: LeaseStore, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
            events,
            family: Family::V4,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, LeaseStore> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, LeaseStore> {
        self.inner.write().await
    }

    /// Publish events for a mutation performed through [`write`]. Must be
    /// called after the guard is dropped.
    pub fn publish(&self, kinds: &[LeaseEventKind]) {
        self.events.publish(self.family, kinds);
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
