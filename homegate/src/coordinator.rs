//! Owns both DHCP engines, the RA emitter and the snapshot writer, and
//! presents the lease queries the DNS resolver consumes.

use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hg_common::{EventBus, HwAddr, Lease, LeaseEvent, LeaseEventKind, LeaseFilter, StoreError};
use hg_dhcp::snapshot;
use hg_dhcp::store::{LeaseStore, SharedLeaseStore};
use hg_dhcp::{Dhcp4Config, Dhcp4Engine};
use hg_ipv6::store::{LeaseStoreV6, SharedLeaseStoreV6};
use hg_ipv6::{Dhcp6Engine, Ipv6Config};

/// How long a service must stay up before its crash count is forgotten.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Restart policy for a coordinator-owned service. The packet loops are
/// the reason this process exists, so they always come back; the RA
/// emitter and the snapshot writer get a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
enum Restart {
    Always,
    UpTo(u32),
}

impl Restart {
    fn exhausted(self, crashes: u32) -> bool {
        match self {
            Self::Always => false,
            Self::UpTo(limit) => crashes > limit,
        }
    }
}

/// Keep `service` running until it returns `Ok(())` (the shutdown path).
/// Failures and panics are logged and the service is relaunched after a
/// pause that grows with consecutive crashes.
fn keep_running<S, Fut>(name: &'static str, policy: Restart, service: S) -> JoinHandle<()>
where
    S: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut crashes = 0u32;
        loop {
            let launched = Instant::now();
            // A panic must not take the coordinator down with it, so each
            // run gets its own task.
            match tokio::spawn(service()).await {
                Ok(Ok(())) => {
                    info!("{name} stopped");
                    return;
                }
                Ok(Err(e)) => error!("{name} died: {e:#}"),
                Err(join_err) => error!("{name} panicked: {join_err}"),
            }

            if launched.elapsed() >= STABLE_AFTER {
                crashes = 0;
            }
            crashes += 1;

            if policy.exhausted(crashes) {
                error!("{name} keeps crashing, leaving it down");
                return;
            }

            let pause = Duration::from_millis(250).saturating_mul(crashes.min(20));
            warn!("{name} crashed {crashes} time(s), relaunching in {pause:?}");
            tokio::time::sleep(pause).await;
        }
    })
}

/// Combined on-disk configuration, one section per family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomegateConfig {
    #[serde(default)]
    pub dhcp4: Dhcp4Config,
    #[serde(default)]
    pub ipv6: Ipv6Config,
}

impl HomegateConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?)
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

pub struct Coordinator {
    events: Arc<EventBus>,
    v4: Option<Arc<Dhcp4Engine>>,
    v6: Option<Arc<Dhcp6Engine>>,
    lease_file: PathBuf,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Validate both families, migrate and load the lease database, and
    /// seed the stores. A family that fails validation is disabled; with
    /// neither family usable, startup fails.
    pub fn new(config: &HomegateConfig) -> Result<Self> {
        let events = Arc::new(EventBus::new());

        let v4_cfg = if config.dhcp4.enabled {
            match config.dhcp4.validate() {
                Ok(v) => Some(v),
                Err(e) => {
                    error!("DHCPv4 disabled by invalid configuration: {e}");
                    None
                }
            }
        } else {
            None
        };

        let v6_cfg = if config.ipv6.enabled {
            match config.ipv6.validate() {
                Ok(v) => Some(v),
                Err(e) => {
                    error!("DHCPv6/RA disabled by invalid configuration: {e}");
                    None
                }
            }
        } else {
            None
        };

        if v4_cfg.is_none() && v6_cfg.is_none() {
            bail!("neither the v4 nor the v6 family is enabled");
        }

        // Both families persist into one snapshot file.
        let lease_file = PathBuf::from(&config.dhcp4.lease_file);
        let legacy_file = lease_file
            .parent()
            .map(|d| d.join(snapshot::LEGACY_DB_NAME))
            .unwrap_or_else(|| PathBuf::from(snapshot::LEGACY_DB_NAME));
        snapshot::migrate_legacy(&legacy_file, &lease_file)?;
        let seed = snapshot::load(&lease_file)?;
        let (seed_v4, seed_v6): (Vec<Lease>, Vec<Lease>) =
            seed.into_iter().partition(|l| l.ip.is_ipv4());

        let v4 = v4_cfg.map(|cfg| {
            let mut store = LeaseStore::new(&cfg);
            store.reset(seed_v4);
            Arc::new(Dhcp4Engine::new(
                cfg,
                SharedLeaseStore::new(store, events.clone()),
            ))
        });

        let v6 = v6_cfg.map(|cfg| {
            let mut store = LeaseStoreV6::new(&cfg);
            store.reset(seed_v6);
            Arc::new(Dhcp6Engine::new(
                cfg.clone(),
                SharedLeaseStoreV6::new(store, events.clone()),
            ))
        });

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            events,
            v4,
            v6,
            lease_file,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the supervised server loops, the RA emitter and the snapshot
    /// writer.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        if let Some(engine) = &self.v4 {
            let engine = engine.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(keep_running("dhcp4", Restart::Always, move || {
                hg_dhcp::server::run_dhcp4_server(engine.clone(), shutdown.clone())
            }));
        }

        if let Some(engine) = &self.v6 {
            if engine.config().dhcp_enabled() {
                let engine = engine.clone();
                let shutdown = self.shutdown.subscribe();
                tasks.push(keep_running("dhcp6", Restart::Always, move || {
                    hg_ipv6::server::run_dhcp6_server(engine.clone(), shutdown.clone())
                }));
            } else {
                info!("SLAAC-only mode, DHCPv6 engine not started");
            }

            if engine.config().ra_enabled() {
                let cfg = engine.config().clone();
                let shutdown = self.shutdown.subscribe();
                tasks.push(keep_running("ipv6-ra", Restart::UpTo(10), move || {
                    hg_ipv6::ra::run_ra_sender(cfg.clone(), shutdown.clone())
                }));
            }
        }

        // Snapshot writer: coalesces DbStore events, one write in flight.
        {
            let v4 = self.v4.as_ref().map(|e| e.store().clone());
            let v6 = self.v6.as_ref().map(|e| e.store().clone());
            let path = self.lease_file.clone();
            let events = self.events.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(keep_running("lease-db", Restart::UpTo(10), move || {
                run_snapshot_writer(
                    v4.clone(),
                    v6.clone(),
                    path.clone(),
                    events.clone(),
                    shutdown.clone(),
                )
            }));
        }

        info!("Coordinator started ({} tasks)", tasks.len());
    }

    /// Signal shutdown, wait for the tasks to drain, then flush a final
    /// snapshot.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        if let Err(e) = self.flush().await {
            error!("Failed to write final lease snapshot: {e:#}");
        } else {
            info!("Lease snapshot flushed");
        }
    }

    /// Write the current lease set to disk.
    pub async fn flush(&self) -> Result<()> {
        write_snapshot(
            &self.v4.as_ref().map(|e| e.store().clone()),
            &self.v6.as_ref().map(|e| e.store().clone()),
            &self.lease_file,
        )
        .await
    }

    /// Lease-change notifications, delivered after the triggering mutation
    /// has been applied and the store lock released.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    // ── admin surface ──────────────────────────────────────────────────

    pub async fn add_static(&self, lease: Lease) -> Result<(), StoreError> {
        match lease.ip {
            IpAddr::V4(_) => match &self.v4 {
                Some(engine) => engine.store().add_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
            IpAddr::V6(_) => match &self.v6 {
                Some(engine) => engine.store().add_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
        }
    }

    pub async fn update_static(&self, lease: Lease) -> Result<(), StoreError> {
        match lease.ip {
            IpAddr::V4(_) => match &self.v4 {
                Some(engine) => engine.store().update_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
            IpAddr::V6(_) => match &self.v6 {
                Some(engine) => engine.store().update_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
        }
    }

    pub async fn remove_static(&self, lease: &Lease) -> Result<(), StoreError> {
        match lease.ip {
            IpAddr::V4(_) => match &self.v4 {
                Some(engine) => engine.store().remove_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
            IpAddr::V6(_) => match &self.v6 {
                Some(engine) => engine.store().remove_static(lease).await,
                None => Err(StoreError::InvalidIp(lease.ip)),
            },
        }
    }

    /// Drop every lease in both families.
    pub async fn reset_leases(&self) {
        if let Some(engine) = &self.v4 {
            engine.store().reset(Vec::new()).await;
        }
        if let Some(engine) = &self.v6 {
            engine.store().reset(Vec::new()).await;
        }
    }

    // ── query surface for the DNS resolver ─────────────────────────────

    pub async fn leases(&self, filter: LeaseFilter) -> Vec<Lease> {
        let mut out = Vec::new();
        if let Some(engine) = &self.v4 {
            out.extend(engine.store().get(filter).await);
        }
        if let Some(engine) = &self.v6 {
            out.extend(engine.store().get(filter).await);
        }
        out
    }

    pub async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        match ip {
            IpAddr::V4(_) => self.v4.as_ref()?.store().mac_by_ip(ip).await,
            IpAddr::V6(_) => self.v6.as_ref()?.store().mac_by_ip(ip).await,
        }
    }

    pub async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(_) => self.v4.as_ref()?.store().host_by_ip(ip).await,
            IpAddr::V6(_) => self.v6.as_ref()?.store().host_by_ip(ip).await,
        }
    }

    pub async fn ip_by_host(&self, host: &str) -> Option<IpAddr> {
        if let Some(engine) = &self.v4 {
            if let Some(ip) = engine.store().ip_by_host(host).await {
                return Some(ip);
            }
        }
        self.v6.as_ref()?.store().ip_by_host(host).await
    }
}

async fn write_snapshot(
    v4: &Option<SharedLeaseStore>,
    v6: &Option<SharedLeaseStoreV6>,
    path: &std::path::Path,
) -> Result<()> {
    let mut leases = Vec::new();
    if let Some(store) = v4 {
        leases.extend(store.get(LeaseFilter::All).await);
    }
    if let Some(store) = v6 {
        leases.extend(store.get(LeaseFilter::All).await);
    }
    snapshot::save(path, &leases)
}

async fn run_snapshot_writer(
    v4: Option<SharedLeaseStore>,
    v6: Option<SharedLeaseStoreV6>,
    path: PathBuf,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            event = rx.recv() => match event {
                Ok(ev) if ev.kind == LeaseEventKind::DbStore => {
                    if let Err(e) = write_snapshot(&v4, &v6, &path).await {
                        // In-memory state stays authoritative.
                        warn!("Failed to write lease snapshot: {e:#}");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Snapshot writer lagged {missed} events, writing now");
                    if let Err(e) = write_snapshot(&v4, &v6, &path).await {
                        warn!("Failed to write lease snapshot: {e:#}");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
