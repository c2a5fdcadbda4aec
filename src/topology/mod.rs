/// Live view of the Sentinel-managed topology
///
/// Readers load an immutable `Topology` snapshot through an atomic pointer
/// and never block. A single background task owns the sentinel
/// subscription, applies failovers and periodic refreshes, and publishes
/// every accepted snapshot on a watch channel for the pool manager.
///
/// Snapshots are ordered by epoch, not by arrival: an update whose epoch is
/// not newer than the current one never replaces the primary.
pub mod sentinel;

pub use sentinel::{FailoverEvent, FailoverStream, RespSentinelSource, SentinelSource};

use crate::config::SentinelConfig;
use crate::core::{Backoff, NodeAddr};
use crate::error::{CacheError, CacheResult};
use arc_swap::ArcSwapOption;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One generation of the primary/replica layout
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub primary: NodeAddr,
    pub replicas: Vec<NodeAddr>,
    /// Sentinels monitoring this master
    pub quorum_nodes: Vec<NodeAddr>,
    pub quorum_size: usize,
    pub epoch: u64,
}

/// Watcher settings, lifted out of `SentinelConfig`
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub master_name: String,
    pub discovery_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub refresh_interval: Duration,
    pub default_quorum: usize,
}

impl From<&SentinelConfig> for WatcherSettings {
    fn from(config: &SentinelConfig) -> Self {
        Self {
            master_name: config.master_name.clone(),
            discovery_timeout: config.discovery_timeout(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_cap: Duration::from_millis(config.reconnect_cap_ms),
            refresh_interval: config.refresh_interval(),
            default_quorum: config.quorum,
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from(&crate::config::Config::default().sentinel)
    }
}

pub struct TopologyWatcher {
    seeds: Vec<NodeAddr>,
    settings: WatcherSettings,
    source: Arc<dyn SentinelSource>,
    current: ArcSwapOption<Topology>,
    changes: watch::Sender<Option<Arc<Topology>>>,
    degraded: AtomicBool,
    failovers: AtomicU64,
}

impl TopologyWatcher {
    pub fn new(seeds: Vec<NodeAddr>, settings: WatcherSettings, source: Arc<dyn SentinelSource>) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            seeds,
            settings,
            source,
            current: ArcSwapOption::empty(),
            changes,
            degraded: AtomicBool::new(false),
            failovers: AtomicU64::new(0),
        }
    }

    /// Last known primary, possibly stale. Never blocks.
    pub fn current_primary(&self) -> Option<NodeAddr> {
        self.current.load().as_ref().map(|t| t.primary.clone())
    }

    pub fn current_replicas(&self) -> Vec<NodeAddr> {
        self.current
            .load()
            .as_ref()
            .map(|t| t.replicas.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<Arc<Topology>> {
        self.current.load_full()
    }

    pub fn epoch(&self) -> Option<u64> {
        self.current.load().as_ref().map(|t| t.epoch)
    }

    /// A primary has been resolved at least once
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// The notification channel is down; the last known topology is served
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Topology>>> {
        self.changes.subscribe()
    }

    /// Apply a failover notification. Rejected unless `epoch` is strictly
    /// newer than the current epoch, which makes duplicate and out-of-order
    /// notifications harmless. Returns whether the update was applied.
    pub fn on_topology_change(&self, old_primary: &NodeAddr, new_primary: &NodeAddr, epoch: u64) -> bool {
        let mut applied = false;
        self.current.rcu(|current| {
            applied = false;
            match current {
                Some(topology) if epoch <= topology.epoch => current.clone(),
                Some(topology) => {
                    applied = true;
                    let replicas = topology
                        .replicas
                        .iter()
                        .filter(|r| *r != new_primary)
                        .cloned()
                        .collect();
                    Some(Arc::new(Topology {
                        primary: new_primary.clone(),
                        replicas,
                        quorum_nodes: topology.quorum_nodes.clone(),
                        quorum_size: topology.quorum_size,
                        epoch,
                    }))
                }
                None => {
                    applied = true;
                    Some(Arc::new(Topology {
                        primary: new_primary.clone(),
                        replicas: Vec::new(),
                        quorum_nodes: Vec::new(),
                        quorum_size: self.settings.default_quorum,
                        epoch,
                    }))
                }
            }
        });

        if applied {
            self.failovers.fetch_add(1, Ordering::Relaxed);
            info!(old_primary = %old_primary, new_primary = %new_primary, epoch, "failover applied");
            self.publish();
        } else {
            debug!(new_primary = %new_primary, epoch, "stale failover notification ignored");
        }
        applied
    }

    /// Apply a full snapshot from discovery. A newer epoch replaces
    /// everything; the same epoch with the same primary may only refresh the
    /// replica and sentinel lists. Returns whether anything changed.
    pub fn apply_snapshot(&self, topology: Topology) -> bool {
        let incoming = Arc::new(topology);
        let mut applied = false;
        let mut primary_changed = false;

        self.current.rcu(|current| {
            applied = false;
            primary_changed = false;
            match current {
                None => {
                    applied = true;
                    Some(Arc::clone(&incoming))
                }
                Some(existing) if incoming.epoch > existing.epoch => {
                    applied = true;
                    primary_changed = existing.primary != incoming.primary;
                    Some(Arc::clone(&incoming))
                }
                Some(existing)
                    if incoming.epoch == existing.epoch
                        && incoming.primary == existing.primary
                        && (incoming.replicas != existing.replicas
                            || incoming.quorum_nodes != existing.quorum_nodes) =>
                {
                    applied = true;
                    Some(Arc::clone(&incoming))
                }
                Some(_) => current.clone(),
            }
        });

        if applied {
            if primary_changed {
                self.failovers.fetch_add(1, Ordering::Relaxed);
            }
            info!(
                primary = %incoming.primary,
                replicas = incoming.replicas.len(),
                epoch = incoming.epoch,
                primary_changed,
                "topology updated"
            );
            self.publish();
        }
        applied
    }

    fn publish(&self) {
        // Always publish whatever is current, so concurrent updaters cannot
        // leave an older snapshot as the last value on the channel
        self.changes.send_replace(self.current.load_full());
    }

    /// Sentinels to try: configured seeds first, then any learned from discovery
    fn candidates(&self) -> Vec<NodeAddr> {
        let mut candidates = self.seeds.clone();
        if let Some(topology) = self.current.load().as_ref() {
            for node in &topology.quorum_nodes {
                if !candidates.contains(node) {
                    candidates.push(node.clone());
                }
            }
        }
        candidates
    }

    async fn discover_from(&self, sentinel: &NodeAddr) -> CacheResult<Topology> {
        match timeout(
            self.settings.discovery_timeout,
            self.source.discover(sentinel, &self.settings.master_name),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(format!("discovery via {}", sentinel))),
        }
    }

    /// Ask every seed in parallel and adopt the answer with the highest
    /// epoch. Fails with `TopologyUnresolved` when no seed answers.
    pub async fn resolve_initial(&self) -> CacheResult<Arc<Topology>> {
        let seeds = self.candidates();
        let results = join_all(seeds.iter().map(|seed| self.discover_from(seed))).await;

        let mut best: Option<Topology> = None;
        for (seed, result) in seeds.iter().zip(results) {
            match result {
                Ok(topology) => {
                    if best.as_ref().map_or(true, |b| topology.epoch > b.epoch) {
                        best = Some(topology);
                    }
                }
                Err(e) => warn!(sentinel = %seed, error = %e, "seed discovery failed"),
            }
        }

        match best {
            Some(topology) => {
                self.apply_snapshot(topology);
                self.snapshot()
                    .ok_or_else(|| CacheError::topology_unresolved("snapshot vanished after apply"))
            }
            None => Err(CacheError::topology_unresolved(format!(
                "none of {} sentinels resolved master {}",
                seeds.len(),
                self.settings.master_name
            ))),
        }
    }

    /// Background task: follow failover notifications until `shutdown`.
    /// When the channel drops, the last topology keeps being served and the
    /// subscription is retried against the next sentinel with backoff.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.settings.reconnect_base, self.settings.reconnect_cap);
        let mut next_candidate = 0usize;

        loop {
            let candidates = self.candidates();
            match candidates.get(next_candidate % candidates.len().max(1)) {
                // Quorum nodes learned from a later snapshot may fill this in
                None => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!("no sentinels to follow, serving last known topology");
                    }
                }
                Some(sentinel) => match self.follow(sentinel, &mut backoff, &shutdown).await {
                    Ok(()) => return,
                    Err(e) => {
                        if !self.degraded.swap(true, Ordering::Relaxed) {
                            warn!(sentinel = %sentinel, error = %e, "notification channel lost, serving last known topology");
                        }
                        next_candidate = next_candidate.wrapping_add(1);
                    }
                },
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "reconnecting to sentinel");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Subscribe on one sentinel and process its events. Returns `Ok` only
    /// on shutdown.
    async fn follow(
        &self,
        sentinel: &NodeAddr,
        backoff: &mut Backoff,
        shutdown: &CancellationToken,
    ) -> CacheResult<()> {
        let mut stream = match timeout(
            self.settings.discovery_timeout,
            self.source.subscribe(sentinel, &self.settings.master_name),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CacheError::timeout(format!("subscribe via {}", sentinel))),
        };

        // Events may have been missed while unsubscribed
        let topology = self.discover_from(sentinel).await?;
        self.apply_snapshot(topology);

        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(sentinel = %sentinel, "notification channel restored");
        }
        backoff.reset();

        let mut refresh = tokio::time::interval(self.settings.refresh_interval);
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = stream.next_event() => match event? {
                    Some(event) => self.handle_event(sentinel, event).await,
                    None => return Err(CacheError::backend(format!("notification channel on {} closed", sentinel))),
                },
                _ = refresh.tick() => match self.discover_from(sentinel).await {
                    Ok(topology) => {
                        self.apply_snapshot(topology);
                    }
                    Err(e) => warn!(sentinel = %sentinel, error = %e, "periodic topology refresh failed"),
                },
            }
        }
    }

    async fn handle_event(&self, sentinel: &NodeAddr, event: FailoverEvent) {
        match event.epoch {
            Some(epoch) => {
                self.on_topology_change(&event.old_primary, &event.new_primary, epoch);
            }
            // No epoch on the wire: read it back from the sentinel that announced the switch
            None => match self.discover_from(sentinel).await {
                Ok(topology) => {
                    if topology.primary != event.new_primary {
                        warn!(
                            announced = %event.new_primary,
                            discovered = %topology.primary,
                            "sentinel reports a different primary than announced"
                        );
                    }
                    if !self.apply_snapshot(topology) {
                        debug!(new_primary = %event.new_primary, "switch-master already applied");
                    }
                }
                Err(e) => warn!(sentinel = %sentinel, error = %e, "failed to confirm failover"),
            },
        }
    }
}
