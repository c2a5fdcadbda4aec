/// Centinela - resilient session cache in front of a Sentinel-managed Redis deployment
///
/// Session lookups are served cache-aside: reads go to replicas behind a read
/// circuit breaker, write-backs and invalidations go to the current primary
/// behind a write circuit breaker, and every failure on the read path falls
/// through to the session store of record.
pub mod breaker;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod topology;

#[cfg(test)]
mod testing;

use crate::breaker::CircuitBreaker;
use crate::cache::{SessionCache, SessionStore};
use crate::config::{Config, ConfigError};
use crate::core::{Clock, Connector, NodeAddr, PoolRole, RespConnector, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::health::{CircuitStates, HealthReport};
use crate::metrics::CacheMetrics;
use crate::pool::ConnectionPoolManager;
use crate::router::ReadWriteRouter;
use crate::topology::sentinel::{RespSentinelSource, SentinelSource};
use crate::topology::{Topology, TopologyWatcher, WatcherSettings};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Components {
    topology: Arc<TopologyWatcher>,
    pools: Arc<ConnectionPoolManager>,
    router: Arc<ReadWriteRouter>,
}

/// One cache instance per process: owns the topology watcher, both pools,
/// both circuits and the session cache, and their background tasks
pub struct Centinela {
    config: Config,
    metrics: Arc<CacheMetrics>,
    cache: Arc<SessionCache>,
    components: Option<Components>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Centinela {
    /// Build against real sentinels and nodes. Must be called from within a
    /// tokio runtime.
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> CacheResult<Self> {
        let connector: Arc<dyn Connector> = Arc::new(RespConnector::new());
        let source = Arc::new(RespSentinelSource::new(
            Arc::clone(&connector),
            config.sentinel.discovery_timeout(),
            config.sentinel.quorum,
        ));
        Self::with_parts(config, store, connector, source, Arc::new(SystemClock))
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        config: Config,
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn Connector>,
        sentinel_source: Arc<dyn SentinelSource>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        let metrics = Arc::new(CacheMetrics::new());
        let shutdown = CancellationToken::new();

        if !config.cache.enabled {
            info!("session cache disabled, passing every call through to the store");
            let cache = SessionCache::passthrough(config.cache.clone(), store, Arc::clone(&metrics), clock);
            return Ok(Self {
                config,
                metrics,
                cache: Arc::new(cache),
                components: None,
                shutdown,
                tasks: Vec::new(),
            });
        }

        let seeds = config
            .sentinel
            .seeds
            .iter()
            .map(|seed| NodeAddr::parse(seed))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CacheError::Config(ConfigError::ValidationError(e.to_string())))?;

        let topology = Arc::new(TopologyWatcher::new(
            seeds,
            WatcherSettings::from(&config.sentinel),
            sentinel_source,
        ));
        let pools = Arc::new(ConnectionPoolManager::new(
            config.pool.read.clone(),
            config.pool.write.clone(),
            connector,
            Arc::clone(&clock),
        ));
        let router = Arc::new(ReadWriteRouter::new(
            Arc::clone(&pools),
            Arc::clone(&topology),
            Arc::new(CircuitBreaker::new(PoolRole::Read, config.breaker.clone(), Arc::clone(&clock))),
            Arc::new(CircuitBreaker::new(PoolRole::Write, config.breaker.clone(), Arc::clone(&clock))),
        ));
        let (cache, writeback) = SessionCache::new(
            config.cache.clone(),
            Arc::clone(&router),
            store,
            Arc::clone(&metrics),
            clock,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            metrics,
            cache: Arc::new(cache),
            components: Some(Components {
                topology,
                pools,
                router,
            }),
            shutdown,
            tasks: vec![writeback],
        })
    }

    /// Resolve the initial topology and start the background tasks. An
    /// unresolved topology is not fatal: the cache stays unavailable and
    /// lookups go to the store until a sentinel answers.
    pub async fn start(&mut self) -> CacheResult<()> {
        let Some(components) = &self.components else {
            return Ok(());
        };

        match components.topology.resolve_initial().await {
            Ok(topology) => {
                components.pools.apply_topology(&topology);
                info!(
                    primary = %topology.primary,
                    replicas = topology.replicas.len(),
                    epoch = topology.epoch,
                    "session cache ready"
                );
            }
            Err(e) => warn!(error = %e, "session cache unavailable, serving from the store"),
        }

        self.tasks.push(tokio::spawn(
            Arc::clone(&components.topology).run(self.shutdown.clone()),
        ));
        self.tasks.push(spawn_topology_follower(
            components.topology.subscribe(),
            Arc::clone(&components.pools),
            Arc::clone(&self.cache),
            self.config.cache.flush_on_failover,
            self.shutdown.clone(),
        ));
        self.tasks
            .extend(components.pools.spawn_health_checks(self.shutdown.clone()));
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Whether the cache can serve lookups (disabled counts as not ready)
    pub fn is_ready(&self) -> bool {
        self.components
            .as_ref()
            .map_or(false, |c| c.topology.is_ready())
    }

    pub fn health(&self) -> HealthReport {
        let Some(components) = &self.components else {
            return HealthReport::disabled(self.metrics.snapshot());
        };

        let snapshot = components.topology.snapshot();
        let circuits = CircuitStates {
            read: components.router.breaker(PoolRole::Read).state(),
            write: components.router.breaker(PoolRole::Write).state(),
        };
        let pool_stats = components.pools.stats();
        let status = HealthReport::evaluate(
            snapshot.is_some(),
            components.topology.is_degraded(),
            circuits,
            &pool_stats,
        );

        HealthReport {
            status,
            primary: snapshot.as_ref().map(|t| t.primary.clone()),
            replicas: snapshot.as_ref().map(|t| t.replicas.clone()).unwrap_or_default(),
            epoch: snapshot.as_ref().map_or(0, |t| t.epoch),
            circuit_states: Some(circuits),
            pool_stats: Some(pool_stats),
            cache_metrics: self.metrics.snapshot(),
        }
    }

    /// Drain pending write-backs, stop background tasks and close the pools
    pub async fn shutdown(mut self) {
        if !self.cache.flush_writebacks().await {
            warn!("write-back queue already stopped");
        }
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        if let Some(components) = &self.components {
            components.pools.close();
        }
        info!("session cache stopped");
    }
}

/// Keep the pools bound to the published topology; after a primary change,
/// optionally sweep the session namespace on the new primary since
/// invalidations sent to the old one may have been lost
fn spawn_topology_follower(
    mut changes: watch::Receiver<Option<Arc<Topology>>>,
    pools: Arc<ConnectionPoolManager>,
    cache: Arc<SessionCache>,
    flush_on_failover: bool,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut primary: Option<NodeAddr> = changes.borrow().as_ref().map(|t| t.primary.clone());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = changes.changed() => if changed.is_err() { return },
            }

            let Some(topology) = changes.borrow_and_update().clone() else {
                continue;
            };
            pools.apply_topology(&topology);

            let failed_over = primary.as_ref().map_or(false, |p| p != &topology.primary);
            primary = Some(topology.primary.clone());
            if failed_over && flush_on_failover {
                if let Err(e) = cache.flush_namespace().await {
                    warn!(error = %e, primary = %topology.primary, "namespace flush after failover failed");
                }
            }
        }
    })
}
