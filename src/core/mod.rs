/// Core abstractions shared by the topology, pool, router and cache layers
pub mod backoff;
pub mod connection;

pub use backoff::Backoff;
pub use connection::{BackendConnection, Connector, RespConnector};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Address of a cache or sentinel node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. Hostnames are accepted, not only IP literals,
    /// because sentinels may announce either.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrError(format!("missing port in {}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddrError(format!("missing host in {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrError(format!("invalid port in {}", s)))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeAddr::parse(s)
    }
}

impl Serialize for NodeAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node address: {0}")]
pub struct AddrError(String);

/// Operation class; selects both the pool and the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    /// Replica-bound, stale-tolerant reads
    Read,
    /// Primary-bound writes and deletes
    Write,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Read => write!(f, "read"),
            PoolRole::Write => write!(f, "write"),
        }
    }
}

/// Time source. Everything that makes a decision based on elapsed time
/// reads it through this trait so tests can drive time by hand.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time for durations
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch, for session expiry
    fn unix_time(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_unix: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base_unix: u64) -> Self {
        Self {
            base: Instant::now(),
            base_unix,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn unix_time(&self) -> u64 {
        self.base_unix + self.offset.lock().as_secs()
    }
}
