/// Read/write routing
///
/// Reads go to the replica pool behind the read circuit and degrade to a
/// miss on any failure. Writes, deletes and reads that need read-your-write
/// visibility go to the primary behind the write circuit and surface their
/// errors. Every call is bounded by a caller-supplied timeout; when it fires
/// the in-flight connection is destroyed rather than reused.
use crate::breaker::CircuitBreaker;
use crate::core::PoolRole;
use crate::error::{CacheError, CacheResult};
use crate::pool::ConnectionPoolManager;
use crate::protocol::{reply_to_exec, reply_to_hash, reply_to_scan, Command, RespValue};
use crate::topology::TopologyWatcher;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 500;

#[derive(Debug)]
pub enum ReadOutcome {
    Hit(HashMap<String, Bytes>),
    Miss,
    /// The cache could not answer; callers treat this as a miss
    Unavailable(CacheError),
}

impl ReadOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, ReadOutcome::Hit(_))
    }
}

pub struct ReadWriteRouter {
    pools: Arc<ConnectionPoolManager>,
    topology: Arc<TopologyWatcher>,
    read_breaker: Arc<CircuitBreaker>,
    write_breaker: Arc<CircuitBreaker>,
}

impl ReadWriteRouter {
    pub fn new(
        pools: Arc<ConnectionPoolManager>,
        topology: Arc<TopologyWatcher>,
        read_breaker: Arc<CircuitBreaker>,
        write_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            pools,
            topology,
            read_breaker,
            write_breaker,
        }
    }

    pub fn breaker(&self, role: PoolRole) -> &Arc<CircuitBreaker> {
        match role {
            PoolRole::Read => &self.read_breaker,
            PoolRole::Write => &self.write_breaker,
        }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    /// Whether a primary has been resolved
    pub fn is_ready(&self) -> bool {
        self.topology.is_ready()
    }

    /// Fetch a hash from a replica
    pub async fn read(&self, key: &str, deadline: Duration) -> ReadOutcome {
        let result = self
            .dispatch(PoolRole::Read, "HGETALL", &[Command::hgetall(key)], deadline)
            .await
            .and_then(|mut replies| reply_to_hash(replies.remove(0)));

        match result {
            Ok(Some(fields)) => ReadOutcome::Hit(fields),
            Ok(None) => ReadOutcome::Miss,
            Err(e) => {
                debug!(error = %e, "read degraded to miss");
                ReadOutcome::Unavailable(e)
            }
        }
    }

    /// Overwrite a hash on the primary and set its TTL
    pub async fn write(
        &self,
        key: &str,
        fields: &[(&str, &[u8])],
        ttl: Duration,
        deadline: Duration,
    ) -> CacheResult<()> {
        let commands = [
            Command::del(&[key]),
            Command::hset(key, fields.iter().copied()),
            Command::expire(key, ttl.as_secs()),
        ];
        self.write_batch(&commands, deadline).await.map(|_| ())
    }

    /// Run commands on the primary inside MULTI/EXEC. A batch cut short by
    /// the deadline dies with its connection before EXEC, so it is applied
    /// entirely or not at all. Returns the replies of `commands`.
    pub async fn write_batch(&self, commands: &[Command], deadline: Duration) -> CacheResult<Vec<RespValue>> {
        let mut transaction = Vec::with_capacity(commands.len() + 2);
        transaction.push(Command::multi());
        transaction.extend_from_slice(commands);
        transaction.push(Command::exec());

        let mut replies = self
            .dispatch(PoolRole::Write, "write", &transaction, deadline)
            .await?;
        let exec = replies
            .pop()
            .ok_or_else(|| CacheError::protocol("missing EXEC reply"))?;
        reply_to_exec(exec)
    }

    /// Delete keys on the primary, returning how many existed
    pub async fn delete<S: AsRef<str>>(&self, keys: &[S], deadline: Duration) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut replies = self
            .dispatch(PoolRole::Write, "DEL", &[Command::del(keys)], deadline)
            .await?;
        replies
            .remove(0)
            .as_integer()
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| CacheError::protocol("DEL reply is not an integer"))
    }

    /// Run a read on the primary
    pub async fn read_primary(&self, command: Command, deadline: Duration) -> CacheResult<RespValue> {
        let name = command.name();
        let mut replies = self
            .dispatch(PoolRole::Write, &name, std::slice::from_ref(&command), deadline)
            .await?;
        Ok(replies.remove(0))
    }

    /// Collect every key on the primary matching `pattern`. The deadline
    /// applies to each round trip.
    pub async fn scan_keys(&self, pattern: &str, deadline: Duration) -> CacheResult<Vec<String>> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let reply = self
                .read_primary(Command::scan(cursor, pattern, SCAN_BATCH), deadline)
                .await?;
            let (next, batch) = reply_to_scan(reply)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn dispatch(
        &self,
        role: PoolRole,
        operation: &str,
        commands: &[Command],
        deadline: Duration,
    ) -> CacheResult<Vec<RespValue>> {
        // Open circuit: fail before touching a pool
        let permit = self.breaker(role).try_acquire()?;

        if role == PoolRole::Write && !self.topology.is_ready() {
            return Err(CacheError::topology_unresolved("no primary resolved yet"));
        }

        let started = Instant::now();
        let result = match timeout(deadline, self.attempt(role, operation, commands)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(format!("{} on {} pool", operation, role))),
        };
        permit.record(&result, started.elapsed());
        result
    }

    async fn attempt(&self, role: PoolRole, operation: &str, commands: &[Command]) -> CacheResult<Vec<RespValue>> {
        let mut guard = self.pools.acquire(role).await?;
        let drained = guard.drained().clone();

        let replies = tokio::select! {
            replies = guard.pipeline(commands) => replies?,
            _ = drained.cancelled() => {
                return Err(CacheError::backend(format!("{} interrupted: node left the {} pool", operation, role)));
            }
        };

        if let Some(message) = first_error(&replies) {
            if message.starts_with("READONLY") {
                // The node was demoted under us
                guard.mark_broken();
            }
            return Err(CacheError::backend(format!("{}: {}", operation, message)));
        }
        Ok(replies)
    }
}

/// First error reply, including errors raised by commands inside an EXEC
fn first_error(replies: &[RespValue]) -> Option<String> {
    let error = |reply: &RespValue| match reply {
        RespValue::Error(message) => Some(message.clone()),
        _ => None,
    };
    replies.iter().find_map(|reply| match reply {
        RespValue::Array(Some(items)) => items.iter().find_map(error),
        other => error(other),
    })
}
