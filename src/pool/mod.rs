/// Tiered connection pools
///
/// Each role owns one pool. The write pool is bound to the current primary,
/// the read pool to the healthy replicas (round-robin). Checked-out
/// connections are bounded by a semaphore of `max_size` permits; waiting
/// for a permit longer than `acquire_timeout` yields `PoolExhausted`.
///
/// Targets carry a generation. When a target leaves the pool (failover,
/// replica removed) its drain token is cancelled so in-flight operations
/// fail fast, its idle connections are dropped, and busy ones are destroyed
/// on release instead of being returned.
use crate::config::PoolSettings;
use crate::core::{BackendConnection, Clock, Connector, NodeAddr, PoolRole};
use crate::error::{CacheError, CacheResult};
use crate::health::{probe_connection, HealthStatus};
use crate::protocol::{reply_to_role, Command, RespValue};
use crate::topology::Topology;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failures (connects or probes) after which a node or a
/// connection is treated as unhealthy
pub const UNHEALTHY_AFTER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Unhealthy,
}

/// A live connection owned by exactly one pool
pub struct PooledConnection {
    pub id: u64,
    pub target: NodeAddr,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    generation: u64,
    failed_probes: u32,
    conn: Box<dyn BackendConnection>,
}

struct TargetState {
    addr: NodeAddr,
    generation: u64,
    consecutive_failures: u32,
    drained: CancellationToken,
}

impl TargetState {
    fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_AFTER
    }
}

#[derive(Default)]
struct PoolState {
    targets: Vec<TargetState>,
    cursor: usize,
    idle: VecDeque<PooledConnection>,
    /// Checked out, being connected, or being probed
    busy: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy
    }

    fn target(&self, addr: &NodeAddr) -> Option<&TargetState> {
        self.targets.iter().find(|t| &t.addr == addr)
    }

    fn target_mut(&mut self, addr: &NodeAddr) -> Option<&mut TargetState> {
        self.targets.iter_mut().find(|t| &t.addr == addr)
    }

    fn is_current(&self, conn: &PooledConnection) -> bool {
        self.target(&conn.target)
            .map_or(false, |t| t.generation == conn.generation)
    }

    /// Round-robin over healthy targets
    fn next_target(&mut self) -> Option<(NodeAddr, u64, CancellationToken)> {
        let n = self.targets.len();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            let target = &self.targets[index];
            if target.is_healthy() {
                self.cursor = (index + 1) % n;
                return Some((target.addr.clone(), target.generation, target.drained.clone()));
            }
        }
        None
    }
}

/// Pool statistics for the health report
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    pub total: usize,
    pub max_size: usize,
    pub targets: Vec<NodeAddr>,
    pub healthy_targets: usize,
    pub connects_attempted: u64,
}

pub struct ConnectionPool {
    role: PoolRole,
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    connects_attempted: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        role: PoolRole,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            role,
            permits: Arc::new(Semaphore::new(settings.max_size)),
            settings,
            connector,
            clock,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            connects_attempted: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Number of connection attempts made, successful or not
    pub fn connects_attempted(&self) -> u64 {
        self.connects_attempted.load(Ordering::Relaxed)
    }

    /// Replace the set of nodes this pool connects to. Targets that stay keep
    /// their connections; removed targets are drained. Returns whether the
    /// set changed.
    pub fn retarget(&self, addrs: &[NodeAddr]) -> bool {
        let mut dropped = Vec::new();
        {
            let mut state = self.state.lock();
            let unchanged = state.targets.len() == addrs.len()
                && state.targets.iter().all(|t| addrs.contains(&t.addr));
            if unchanged {
                return false;
            }

            let mut kept = Vec::with_capacity(addrs.len());
            for old in std::mem::take(&mut state.targets) {
                if addrs.contains(&old.addr) {
                    kept.push(old);
                } else {
                    info!(role = %self.role, node = %old.addr, "draining pool target");
                    old.drained.cancel();
                }
            }
            for addr in addrs {
                if !kept.iter().any(|t| &t.addr == addr) {
                    kept.push(TargetState {
                        addr: addr.clone(),
                        generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                        consecutive_failures: 0,
                        drained: CancellationToken::new(),
                    });
                }
            }
            state.targets = kept;
            state.cursor = 0;

            let idle = std::mem::take(&mut state.idle);
            for conn in idle {
                if state.is_current(&conn) {
                    state.idle.push_back(conn);
                } else {
                    dropped.push(conn);
                }
            }
        }

        if !dropped.is_empty() {
            debug!(role = %self.role, count = dropped.len(), "closed idle connections to drained targets");
        }
        true
    }

    /// Check out a connection. Waits up to `acquire_timeout` for capacity.
    pub async fn acquire(self: &Arc<Self>) -> CacheResult<PoolGuard> {
        let acquire_timeout = self.settings.acquire_timeout();
        let started = tokio::time::Instant::now();

        let permit = match timeout(acquire_timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CacheError::backend(format!("{} pool is shut down", self.role))),
            Err(_) => {
                return Err(CacheError::PoolExhausted {
                    role: self.role,
                    waited_ms: acquire_timeout.as_millis() as u64,
                })
            }
        };

        let now = self.clock.now();
        let (target, generation, drained, reused, evicted) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CacheError::backend(format!("{} pool is shut down", self.role)));
            }
            let (target, generation, drained) = state
                .next_target()
                .ok_or(CacheError::NoHealthyNode { role: self.role })?;

            // Most recently used idle connection to that target, skipping
            // ones that outlived the idle timeout
            let mut reused = None;
            let mut evicted = Vec::new();
            loop {
                let Some(pos) = state.idle.iter().rposition(|c| c.target == target) else {
                    break;
                };
                let Some(conn) = state.idle.remove(pos) else {
                    break;
                };
                if now.saturating_duration_since(conn.last_used_at) > self.settings.idle_timeout() {
                    evicted.push(conn);
                    continue;
                }
                reused = Some(conn);
                break;
            }

            if reused.is_none() && state.total() >= self.settings.max_size {
                // At capacity with a permit in hand means someone is idle
                if let Some(oldest) = state.idle.pop_front() {
                    evicted.push(oldest);
                }
            }
            state.busy += 1;
            (target, generation, drained, reused, evicted)
        };
        drop(evicted);

        let mut conn = match reused {
            Some(conn) => conn,
            None => {
                let remaining = acquire_timeout.saturating_sub(started.elapsed());
                let connect_timeout = self.settings.connect_timeout().min(remaining.max(Duration::from_millis(1)));
                match self.open(&target, generation, connect_timeout).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.state.lock().busy -= 1;
                        return Err(e);
                    }
                }
            }
        };

        conn.state = ConnectionState::InUse;
        conn.last_used_at = self.clock.now();
        Ok(PoolGuard {
            pool: Arc::clone(self),
            conn: Some(conn),
            drained,
            in_flight: false,
            broken: false,
            _permit: permit,
        })
    }

    /// Open and vet a new connection to `target`
    async fn open(&self, target: &NodeAddr, generation: u64, connect_timeout: Duration) -> CacheResult<PooledConnection> {
        self.connects_attempted.fetch_add(1, Ordering::Relaxed);

        let result = async {
            let mut conn = self.connector.connect(target, connect_timeout).await?;
            if self.role == PoolRole::Write {
                // Never hand out a write connection to a node that is not the primary
                let role = timeout(connect_timeout, conn.execute(&Command::role()))
                    .await
                    .map_err(|_| CacheError::timeout(format!("ROLE on {}", target)))??;
                let role = reply_to_role(role)?;
                if role != "master" {
                    return Err(CacheError::backend(format!(
                        "{} reports role {}, refusing writes",
                        target, role
                    )));
                }
            }
            Ok(conn)
        }
        .await;

        let mut state = self.state.lock();
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                if let Some(t) = state.target_mut(target) {
                    t.consecutive_failures += 1;
                    if t.consecutive_failures == UNHEALTHY_AFTER {
                        warn!(role = %self.role, node = %target, error = %e, "node marked unhealthy");
                    }
                }
                return Err(e);
            }
        };

        match state.target_mut(target) {
            Some(t) if t.generation == generation => t.consecutive_failures = 0,
            _ => {
                return Err(CacheError::backend(format!(
                    "{} was drained while connecting",
                    target
                )))
            }
        }

        let now = self.clock.now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(role = %self.role, node = %target, id, "opened connection");
        Ok(PooledConnection {
            id,
            target: target.clone(),
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            generation,
            failed_probes: 0,
            conn,
        })
    }

    fn release(&self, mut conn: PooledConnection, discard: bool) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);

        if discard || state.closed || !state.is_current(&conn) {
            debug!(role = %self.role, node = %conn.target, id = conn.id, discard, "destroying connection on release");
            drop(state);
            return;
        }

        conn.state = ConnectionState::Idle;
        conn.last_used_at = self.clock.now();
        state.idle.push_back(conn);
    }

    /// One health-check round: evict idle-expired connections above
    /// `min_size`, probe the rest, revive unhealthy nodes, top up to `min_size`.
    ///
    /// Every connection under probe holds a checkout permit, so probing
    /// never lets the pool grow past `max_size`. Idle connections that find
    /// no free permit are left for the next round.
    pub async fn health_pass(&self) {
        let probe_timeout = self.settings.connect_timeout();
        let idle_timeout = self.settings.idle_timeout();
        let min_size = self.settings.min_size;

        let (candidates, permits, keep_floor) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut candidates = Vec::with_capacity(state.idle.len());
            let mut permits = Vec::with_capacity(state.idle.len());
            while !state.idle.is_empty() {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    break;
                };
                let Some(conn) = state.idle.pop_front() else {
                    break;
                };
                candidates.push(conn);
                permits.push(permit);
            }
            let floor = min_size.saturating_sub(state.total());
            state.busy += candidates.len();
            (candidates, permits, floor)
        };

        let now = self.clock.now();
        let mut survivors = Vec::with_capacity(candidates.len());
        let mut unhealthy_nodes = Vec::new();
        let count = candidates.len();
        for mut conn in candidates {
            if now.saturating_duration_since(conn.last_used_at) > idle_timeout && survivors.len() >= keep_floor {
                debug!(role = %self.role, id = conn.id, "evicting idle connection");
                continue;
            }

            match probe_connection(conn.conn.as_mut(), probe_timeout).await {
                HealthStatus::Healthy => {
                    conn.failed_probes = 0;
                    survivors.push(conn);
                }
                status => {
                    conn.failed_probes += 1;
                    if conn.failed_probes >= UNHEALTHY_AFTER {
                        conn.state = ConnectionState::Unhealthy;
                        warn!(role = %self.role, node = %conn.target, id = conn.id, %status, "evicting unhealthy connection");
                        unhealthy_nodes.push(conn.target.clone());
                    } else {
                        survivors.push(conn);
                    }
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.busy -= count;
            for node in &unhealthy_nodes {
                if let Some(t) = state.target_mut(node) {
                    t.consecutive_failures = t.consecutive_failures.max(UNHEALTHY_AFTER);
                }
            }
            for conn in survivors {
                if state.is_current(&conn) && !state.closed {
                    state.idle.push_back(conn);
                }
            }
        }
        drop(permits);

        self.revive_unhealthy_targets().await;
        self.top_up().await;
    }

    async fn revive_unhealthy_targets(&self) {
        let unhealthy: Vec<(NodeAddr, u64)> = {
            let state = self.state.lock();
            state
                .targets
                .iter()
                .filter(|t| !t.is_healthy())
                .map(|t| (t.addr.clone(), t.generation))
                .collect()
        };

        for (addr, generation) in unhealthy {
            let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return;
            };
            self.state.lock().busy += 1;
            let revived = match self.connector.connect(&addr, self.settings.connect_timeout()).await {
                Ok(mut conn) => probe_connection(conn.as_mut(), self.settings.connect_timeout()).await.is_healthy(),
                Err(_) => false,
            };
            let mut state = self.state.lock();
            state.busy -= 1;
            if revived {
                if let Some(t) = state.target_mut(&addr) {
                    if t.generation == generation {
                        info!(role = %self.role, node = %addr, "node healthy again");
                        t.consecutive_failures = 0;
                    }
                }
            }
        }
    }

    async fn top_up(&self) {
        loop {
            let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return;
            };
            let next = {
                let mut state = self.state.lock();
                if state.closed || state.total() >= self.settings.min_size {
                    return;
                }
                match state.next_target() {
                    Some((target, generation, _)) => {
                        state.busy += 1;
                        (target, generation)
                    }
                    None => return,
                }
            };

            let (target, generation) = next;
            let result = self.open(&target, generation, self.settings.connect_timeout()).await;
            match result {
                Ok(conn) => self.release(conn, false),
                Err(e) => {
                    self.state.lock().busy -= 1;
                    debug!(role = %self.role, node = %target, error = %e, "warm-up connect failed");
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            in_use: self.settings.max_size - self.permits.available_permits().min(self.settings.max_size),
            idle: state.idle.len(),
            total: state.total(),
            max_size: self.settings.max_size,
            targets: state.targets.iter().map(|t| t.addr.clone()).collect(),
            healthy_targets: state.targets.iter().filter(|t| t.is_healthy()).count(),
            connects_attempted: self.connects_attempted(),
        }
    }

    /// Close the pool: drain all targets, drop idle connections and wake
    /// every waiter with an error
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            for target in state.targets.drain(..) {
                target.drained.cancel();
            }
            std::mem::take(&mut state.idle)
        };
        self.permits.close();
        drop(idle);
    }
}

/// A checked-out connection. Dropping it releases the connection back to
/// its pool, or destroys it when a command may still be in flight.
pub struct PoolGuard {
    pool: Arc<ConnectionPool>,
    conn: Option<PooledConnection>,
    drained: CancellationToken,
    in_flight: bool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    fn conn_mut(&mut self) -> CacheResult<&mut PooledConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| CacheError::backend("connection already released"))
    }

    pub fn target(&self) -> Option<&NodeAddr> {
        self.conn.as_ref().map(|c| &c.target)
    }

    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id)
    }

    /// Cancelled when the target of this connection is drained
    pub fn drained(&self) -> &CancellationToken {
        &self.drained
    }

    /// Destroy the connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub async fn execute(&mut self, command: &Command) -> CacheResult<RespValue> {
        self.in_flight = true;
        let result = self.conn_mut()?.conn.execute(command).await;
        self.in_flight = false;
        if matches!(result, Err(ref e) if e.counts_as_backend_failure()) {
            self.broken = true;
        }
        result
    }

    pub async fn pipeline(&mut self, commands: &[Command]) -> CacheResult<Vec<RespValue>> {
        self.in_flight = true;
        let result = self.conn_mut()?.conn.pipeline(commands).await;
        self.in_flight = false;
        if matches!(result, Err(ref e) if e.counts_as_backend_failure()) {
            self.broken = true;
        }
        result
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.in_flight {
                debug!(node = %conn.target, id = conn.id, "released with a command possibly in flight");
            }
            self.pool.release(conn, self.in_flight || self.broken);
        }
    }
}

/// Stats of both pools, as reported by the health document
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolManagerStats {
    pub read: PoolStats,
    pub write: PoolStats,
}

/// Owner of the read and write pools
pub struct ConnectionPoolManager {
    read: Arc<ConnectionPool>,
    write: Arc<ConnectionPool>,
}

impl ConnectionPoolManager {
    pub fn new(
        read: PoolSettings,
        write: PoolSettings,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            read: Arc::new(ConnectionPool::new(PoolRole::Read, read, Arc::clone(&connector), Arc::clone(&clock))),
            write: Arc::new(ConnectionPool::new(PoolRole::Write, write, connector, clock)),
        }
    }

    pub fn pool(&self, role: PoolRole) -> &Arc<ConnectionPool> {
        match role {
            PoolRole::Read => &self.read,
            PoolRole::Write => &self.write,
        }
    }

    pub async fn acquire(&self, role: PoolRole) -> CacheResult<PoolGuard> {
        self.pool(role).acquire().await
    }

    /// Bind the write pool to the primary and the read pool to the replicas
    pub fn apply_topology(&self, topology: &Topology) {
        if self.write.retarget(std::slice::from_ref(&topology.primary)) {
            info!(primary = %topology.primary, epoch = topology.epoch, "write pool bound to new primary");
        }
        if self.read.retarget(&topology.replicas) {
            debug!(replicas = topology.replicas.len(), epoch = topology.epoch, "read pool targets updated");
        }
    }

    /// Background health checking for both pools
    pub fn spawn_health_checks(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        [Arc::clone(&self.read), Arc::clone(&self.write)]
            .into_iter()
            .map(|pool| {
                let shutdown = shutdown.clone();
                tokio::spawn(crate::health::run_pool_health_checks(pool, shutdown))
            })
            .collect()
    }

    pub fn stats(&self) -> PoolManagerStats {
        PoolManagerStats {
            read: self.read.stats(),
            write: self.write.stats(),
        }
    }

    pub fn close(&self) {
        self.read.close();
        self.write.close();
    }
}
