//! In-memory stand-ins for the cache backend, the sentinels and the session
//! store, plus a harness wiring a full `SessionCache` on top of them.

use crate::breaker::CircuitBreaker;
use crate::cache::{fingerprint, Session, SessionCache, SessionStore};
use crate::config::{BreakerConfig, CacheConfig, PoolSettings};
use crate::core::{BackendConnection, Clock, Connector, ManualClock, NodeAddr, PoolRole};
use crate::error::{CacheError, CacheResult};
use crate::metrics::CacheMetrics;
use crate::pool::ConnectionPoolManager;
use crate::protocol::{Command, RespValue};
use crate::router::ReadWriteRouter;
use crate::topology::sentinel::{FailoverEvent, FailoverStream, SentinelSource};
use crate::topology::{Topology, TopologyWatcher, WatcherSettings};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Backend

enum Value {
    Hash(HashMap<String, Bytes>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

struct NodeState {
    is_primary: bool,
    reachable: bool,
    failing: bool,
    connects: u64,
    writes: u64,
}

impl NodeState {
    fn new(is_primary: bool) -> Self {
        Self {
            is_primary,
            reachable: true,
            failing: false,
            connects: 0,
            writes: 0,
        }
    }
}

#[derive(Default)]
struct ClusterState {
    nodes: HashMap<NodeAddr, NodeState>,
    /// One keyspace; replication is instantaneous
    keys: HashMap<String, Entry>,
    latency: Duration,
}

impl ClusterState {
    fn purge(&mut self, key: &str, now: Instant) {
        let expired = self
            .keys
            .get(key)
            .map_or(false, |e| e.expires_at.map_or(false, |at| at <= now));
        if expired {
            self.keys.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge(key, now);
        self.keys.get_mut(key)
    }

    fn live_or_insert(&mut self, key: String, now: Instant, empty: fn() -> Value) -> &mut Entry {
        self.purge(&key, now);
        self.keys.entry(key).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        })
    }
}

/// A primary with replicas sharing one keyspace, reachable through the
/// `Connector` seam. TTLs follow a manual clock.
pub struct MockCluster {
    clock: Arc<ManualClock>,
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn with_primary_and_replicas(replicas: usize) -> Arc<Self> {
        let mut state = ClusterState::default();
        state.nodes.insert(NodeAddr::new("10.0.1.1", 6379), NodeState::new(true));
        for i in 0..replicas {
            state
                .nodes
                .insert(NodeAddr::new(format!("10.0.1.{}", i + 2), 6379), NodeState::new(false));
        }
        Arc::new(Self {
            clock: Arc::new(ManualClock::new(1_700_000_000)),
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock) as Arc<dyn Clock>
    }

    pub fn manual_clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    pub fn primary(&self) -> NodeAddr {
        let state = self.state.lock();
        let mut primaries: Vec<NodeAddr> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.is_primary)
            .map(|(a, _)| a.clone())
            .collect();
        primaries.sort();
        primaries.remove(0)
    }

    pub fn replicas(&self) -> Vec<NodeAddr> {
        let state = self.state.lock();
        let mut replicas: Vec<NodeAddr> = state
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_primary)
            .map(|(a, _)| a.clone())
            .collect();
        replicas.sort();
        replicas
    }

    /// Make `addr` the primary and demote every other node
    pub fn promote(&self, addr: &NodeAddr) -> NodeAddr {
        let mut state = self.state.lock();
        for (node, n) in state.nodes.iter_mut() {
            n.is_primary = node == addr;
        }
        addr.clone()
    }

    /// Unreachable nodes refuse connections and reset existing ones
    pub fn set_reachable(&self, addr: &NodeAddr, reachable: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(addr) {
            node.reachable = reachable;
        }
    }

    /// Failing nodes accept connections but error on every command
    pub fn fail_commands(&self, addr: &NodeAddr, failing: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(addr) {
            node.failing = failing;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn connects(&self, addr: &NodeAddr) -> u64 {
        self.state.lock().nodes.get(addr).map_or(0, |n| n.connects)
    }

    /// Mutating commands applied by `addr`
    pub fn writes_to(&self, addr: &NodeAddr) -> u64 {
        self.state.lock().nodes.get(addr).map_or(0, |n| n.writes)
    }

    /// Whether `key` exists and will expire on its own
    pub fn has_ttl(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .live(key, now)
            .map_or(false, |e| e.expires_at.is_some())
    }

    pub fn key_exists(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state.lock().live(key, now).is_some()
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.live(key, now) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => fields
                .get(field)
                .map(|v| String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }

    /// Write a hash field directly, bypassing every client-side check
    pub fn set_hash_field(&self, key: &str, field: &str, value: &str) {
        let mut state = self.state.lock();
        let entry = state.keys.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Value::Hash(fields) = &mut entry.value {
            fields.insert(field.to_string(), Bytes::copy_from_slice(value.as_bytes()));
        }
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, addr: &NodeAddr, _connect_timeout: Duration) -> CacheResult<Box<dyn BackendConnection>> {
        {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get_mut(addr)
                .ok_or_else(|| CacheError::backend(format!("connect to {} failed: no route", addr)))?;
            node.connects += 1;
            if !node.reachable {
                return Err(CacheError::backend(format!("connect to {} failed: refused", addr)));
            }
        }
        Ok(Box::new(MockConnection {
            addr: addr.clone(),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            transaction: None,
        }))
    }
}

struct MockConnection {
    addr: NodeAddr,
    clock: Arc<ManualClock>,
    state: Arc<Mutex<ClusterState>>,
    /// Commands queued since MULTI; lost if the connection is dropped
    transaction: Option<Transaction>,
}

#[derive(Default)]
struct Transaction {
    queued: Vec<Command>,
    aborted: bool,
}

fn is_write(name: &str) -> bool {
    matches!(name, "HSET" | "EXPIRE" | "DEL" | "SADD")
}

fn text(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

impl MockConnection {
    fn apply(&self, command: &Command) -> CacheResult<RespValue> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.apply_locked(&mut state, now, command)
    }

    /// Queue a command inside MULTI. Writes on a replica are refused at
    /// queue time and poison the transaction, as the server does.
    fn queue(&mut self, command: &Command) -> CacheResult<RespValue> {
        {
            let state = self.state.lock();
            let node = state
                .nodes
                .get(&self.addr)
                .ok_or_else(|| CacheError::backend("node removed"))?;
            if !node.reachable || node.failing {
                return Err(CacheError::backend(format!("connection to {} failed", self.addr)));
            }
            if is_write(&command.name()) && !node.is_primary {
                if let Some(tx) = self.transaction.as_mut() {
                    tx.aborted = true;
                }
                return Ok(RespValue::Error(
                    "READONLY You can't write against a read only replica.".to_string(),
                ));
            }
        }
        if let Some(tx) = self.transaction.as_mut() {
            tx.queued.push(command.clone());
        }
        Ok(RespValue::SimpleString("QUEUED".to_string()))
    }

    /// Apply every queued command under one lock
    fn exec(&mut self) -> CacheResult<RespValue> {
        let Some(tx) = self.transaction.take() else {
            return Ok(RespValue::Error("ERR EXEC without MULTI".to_string()));
        };
        if tx.aborted {
            return Ok(RespValue::Error(
                "EXECABORT Transaction discarded because of previous errors.".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        let replies = tx
            .queued
            .iter()
            .map(|command| self.apply_locked(&mut state, now, command))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(RespValue::Array(Some(replies)))
    }

    fn apply_locked(&self, state: &mut ClusterState, now: Instant, command: &Command) -> CacheResult<RespValue> {
        let name = command.name();
        let args = &command.args()[1..];

        let node = state
            .nodes
            .get_mut(&self.addr)
            .ok_or_else(|| CacheError::backend("node removed"))?;
        if !node.reachable {
            return Err(CacheError::backend(format!("connection to {} reset", self.addr)));
        }
        if node.failing {
            return Err(CacheError::backend(format!("connection to {} failed", self.addr)));
        }
        if is_write(&name) {
            if !node.is_primary {
                return Ok(RespValue::Error(
                    "READONLY You can't write against a read only replica.".to_string(),
                ));
            }
            node.writes += 1;
        }
        let is_primary = node.is_primary;

        let reply = match name.as_str() {
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "ROLE" => RespValue::Array(Some(vec![
                RespValue::bulk(if is_primary { "master" } else { "slave" }),
                RespValue::Integer(0),
                RespValue::Array(Some(vec![])),
            ])),
            "HSET" => {
                let entry = state.live_or_insert(text(&args[0]), now, || Value::Hash(HashMap::new()));
                let Value::Hash(fields) = &mut entry.value else {
                    return Ok(RespValue::Error("WRONGTYPE".to_string()));
                };
                let mut added = 0;
                for pair in args[1..].chunks(2) {
                    if fields.insert(text(&pair[0]), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                RespValue::Integer(added)
            }
            "HGETALL" => match state.live(&text(&args[0]), now) {
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => RespValue::Array(Some(
                    fields
                        .iter()
                        .flat_map(|(k, v)| [RespValue::bulk(k.clone()), RespValue::BulkString(Some(v.clone()))])
                        .collect(),
                )),
                Some(_) => RespValue::Error("WRONGTYPE".to_string()),
                None => RespValue::Array(Some(vec![])),
            },
            "EXPIRE" => {
                let seconds: u64 = text(&args[1]).parse().unwrap_or(0);
                match state.live(&text(&args[0]), now) {
                    Some(entry) => {
                        entry.expires_at = Some(now + Duration::from_secs(seconds));
                        RespValue::Integer(1)
                    }
                    None => RespValue::Integer(0),
                }
            }
            "DEL" => {
                let mut removed = 0;
                for key in args {
                    let key = text(key);
                    if state.live(&key, now).is_some() {
                        state.keys.remove(&key);
                        removed += 1;
                    }
                }
                RespValue::Integer(removed)
            }
            "SADD" => {
                let entry = state.live_or_insert(text(&args[0]), now, || Value::Set(BTreeSet::new()));
                let Value::Set(members) = &mut entry.value else {
                    return Ok(RespValue::Error("WRONGTYPE".to_string()));
                };
                let added = args[1..].iter().filter(|m| members.insert(text(m))).count();
                RespValue::Integer(added as i64)
            }
            "SMEMBERS" => match state.live(&text(&args[0]), now) {
                Some(Entry {
                    value: Value::Set(members),
                    ..
                }) => RespValue::Array(Some(members.iter().map(|m| RespValue::bulk(m.clone())).collect())),
                Some(_) => RespValue::Error("WRONGTYPE".to_string()),
                None => RespValue::Array(Some(vec![])),
            },
            "SCAN" => {
                // Single batch; only `prefix*` patterns
                let pattern = text(&args[2]);
                let prefix = pattern.trim_end_matches('*').to_string();
                let candidates: Vec<String> = state.keys.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
                let keys: Vec<RespValue> = candidates
                    .into_iter()
                    .filter(|k| state.live(k, now).is_some())
                    .map(RespValue::bulk)
                    .collect();
                RespValue::Array(Some(vec![RespValue::bulk("0"), RespValue::Array(Some(keys))]))
            }
            other => RespValue::Error(format!("ERR unknown command '{}'", other)),
        };
        Ok(reply)
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn execute(&mut self, command: &Command) -> CacheResult<RespValue> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match command.name().as_str() {
            "MULTI" if self.transaction.is_some() => {
                Ok(RespValue::Error("ERR MULTI calls can not be nested".to_string()))
            }
            "MULTI" => {
                self.transaction = Some(Transaction::default());
                Ok(RespValue::SimpleString("OK".to_string()))
            }
            "EXEC" => self.exec(),
            _ if self.transaction.is_some() => self.queue(command),
            _ => self.apply(command),
        }
    }

    async fn next_frame(&mut self) -> CacheResult<RespValue> {
        futures::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Sentinels

#[derive(Default)]
struct SentinelState {
    default: Option<Topology>,
    per_node: HashMap<NodeAddr, Topology>,
    unreachable: HashSet<NodeAddr>,
    subscribers: Vec<mpsc::UnboundedSender<FailoverEvent>>,
}

/// Scripted sentinel set
#[derive(Default)]
pub struct MockSentinel {
    state: Mutex<SentinelState>,
    subscribed: Notify,
}

impl MockSentinel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topology reported by every sentinel without its own
    pub fn set_topology(&self, topology: Topology) {
        self.state.lock().default = Some(topology);
    }

    pub fn set_topology_for(&self, sentinel: NodeAddr, topology: Topology) {
        self.state.lock().per_node.insert(sentinel, topology);
    }

    pub fn set_unreachable(&self, sentinel: NodeAddr) {
        self.state.lock().unreachable.insert(sentinel);
    }

    /// Deliver an event to every open stream
    pub fn push_event(&self, event: FailoverEvent) {
        self.state
            .lock()
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End every open stream, as if the notification channel dropped
    pub fn close_streams(&self) {
        self.state.lock().subscribers.clear();
    }

    pub async fn wait_for_subscriber(&self) {
        loop {
            let notified = self.subscribed.notified();
            if !self.state.lock().subscribers.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl SentinelSource for MockSentinel {
    async fn discover(&self, sentinel: &NodeAddr, _master_name: &str) -> CacheResult<Topology> {
        let state = self.state.lock();
        if state.unreachable.contains(sentinel) {
            return Err(CacheError::backend(format!("sentinel {} unreachable", sentinel)));
        }
        state
            .per_node
            .get(sentinel)
            .or(state.default.as_ref())
            .cloned()
            .ok_or_else(|| CacheError::backend("no such master"))
    }

    async fn subscribe(&self, sentinel: &NodeAddr, _master_name: &str) -> CacheResult<Box<dyn FailoverStream>> {
        let rx = {
            let mut state = self.state.lock();
            if state.unreachable.contains(sentinel) {
                return Err(CacheError::backend(format!("sentinel {} unreachable", sentinel)));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.push(tx);
            rx
        };
        self.subscribed.notify_waiters();
        Ok(Box::new(MockFailoverStream { rx }))
    }
}

struct MockFailoverStream {
    rx: mpsc::UnboundedReceiver<FailoverEvent>,
}

#[async_trait]
impl FailoverStream for MockFailoverStream {
    async fn next_event(&mut self) -> CacheResult<Option<FailoverEvent>> {
        Ok(self.rx.recv().await)
    }
}

// ---------------------------------------------------------------------------
// Session store

pub fn session(session_id: &str, user_id: &str, expires_at: u64) -> Session {
    Session {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        expires_at,
        last_activity_at: 1_700_000_000,
        attributes: [("tenant".to_string(), "acme".to_string())].into_iter().collect(),
    }
}

/// Session store of record held in memory
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    lookups: AtomicU64,
    failing: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, session: Session) {
        self.sessions.lock().insert(token.to_string(), session);
    }

    pub fn remove(&self, token: &str) {
        self.sessions.lock().remove(token);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::session_store("database unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn validate_session_from_source(&self, token: &str) -> CacheResult<Option<Session>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.sessions.lock().get(token).cloned())
    }

    async fn revoke_session(&self, session_id: &str) -> CacheResult<bool> {
        self.check()?;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.session_id != session_id);
        Ok(sessions.len() < before)
    }

    async fn revoke_all_user_sessions(&self, user_id: &str) -> CacheResult<u64> {
        self.check()?;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Harness

/// A `SessionCache` wired over a `MockCluster` whose topology is already
/// resolved
pub struct Harness {
    pub cluster: Arc<MockCluster>,
    pub store: Arc<MemorySessionStore>,
    pub topology: Arc<TopologyWatcher>,
    pub pools: Arc<ConnectionPoolManager>,
    pub router: Arc<ReadWriteRouter>,
    pub metrics: Arc<CacheMetrics>,
    pub cache: SessionCache,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn cache_settings() -> CacheConfig {
        CacheConfig {
            key_prefix: "test:".to_string(),
            operation_timeout_ms: 500,
            ..CacheConfig::default()
        }
    }

    pub fn pool_settings() -> PoolSettings {
        PoolSettings {
            min_size: 0,
            max_size: 4,
            idle_timeout_sec: 600,
            acquire_timeout_ms: 100,
            connect_timeout_ms: 100,
            health_check_interval_ms: 1000,
        }
    }

    pub fn new(replicas: usize) -> Self {
        Self::with_settings(replicas, Self::cache_settings(), BreakerConfig::default())
    }

    pub fn with_settings(replicas: usize, settings: CacheConfig, breaker: BreakerConfig) -> Self {
        let cluster = MockCluster::with_primary_and_replicas(replicas);
        let clock = cluster.clock();

        let topology = Arc::new(TopologyWatcher::new(
            vec![],
            WatcherSettings::default(),
            Arc::new(MockSentinel::new()),
        ));
        topology.apply_snapshot(Topology {
            primary: cluster.primary(),
            replicas: cluster.replicas(),
            quorum_nodes: vec![],
            quorum_size: 2,
            epoch: 1,
        });

        let pools = Arc::new(ConnectionPoolManager::new(
            Self::pool_settings(),
            Self::pool_settings(),
            Arc::clone(&cluster) as Arc<dyn Connector>,
            Arc::clone(&clock),
        ));
        if let Some(snapshot) = topology.snapshot() {
            pools.apply_topology(&snapshot);
        }

        let router = Arc::new(ReadWriteRouter::new(
            Arc::clone(&pools),
            Arc::clone(&topology),
            Arc::new(CircuitBreaker::new(PoolRole::Read, breaker.clone(), Arc::clone(&clock))),
            Arc::new(CircuitBreaker::new(PoolRole::Write, breaker, Arc::clone(&clock))),
        ));

        let store = Arc::new(MemorySessionStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let shutdown = CancellationToken::new();
        let (cache, _worker) = SessionCache::new(
            settings,
            Arc::clone(&router),
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::clone(&metrics),
            clock,
            shutdown.clone(),
        );

        Self {
            cluster,
            store,
            topology,
            pools,
            router,
            metrics,
            cache,
            shutdown,
        }
    }

    pub fn session_key(&self, token: &str) -> String {
        format!("test:session:{}", fingerprint(token))
    }

    /// An expiry a day past the harness clock
    pub fn far_future(&self) -> u64 {
        self.cluster.manual_clock().unix_time() + 86_400
    }

    /// Promote the first replica and publish the new topology
    pub fn failover(&self) -> NodeAddr {
        let old_primary = self.cluster.primary();
        let new_primary = self.cluster.promote(&self.cluster.replicas()[0]);
        let epoch = self.topology.epoch().unwrap_or(0) + 1;
        self.topology.on_topology_change(&old_primary, &new_primary, epoch);
        if let Some(snapshot) = self.topology.snapshot() {
            self.pools.apply_topology(&snapshot);
        }
        new_primary
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
