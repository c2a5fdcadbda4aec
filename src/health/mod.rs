/// Health checking: connection probes for the pools and the operator-facing
/// health document
use crate::breaker::CircuitState;
use crate::core::{BackendConnection, NodeAddr};
use crate::metrics::MetricsSnapshot;
use crate::pool::{ConnectionPool, PoolManagerStats};
use crate::protocol::{Command, RespValue};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// PING a connection and expect `+PONG`
pub async fn probe_connection(conn: &mut dyn BackendConnection, probe_timeout: Duration) -> HealthStatus {
    match timeout(probe_timeout, conn.execute(&Command::ping())).await {
        Ok(Ok(RespValue::SimpleString(ref s))) if s == "PONG" => HealthStatus::Healthy,
        Ok(Ok(other)) => HealthStatus::Unhealthy {
            reason: format!("unexpected PING reply: {:?}", other),
        },
        Ok(Err(e)) => HealthStatus::Unhealthy { reason: e.to_string() },
        Err(_) => HealthStatus::Timeout,
    }
}

/// Run health passes for one pool every `health_check_interval` until shutdown
pub async fn run_pool_health_checks(pool: Arc<ConnectionPool>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(pool.settings().health_check_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        pool.health_pass().await;

        let stats = pool.stats();
        tracing::debug!(
            role = %pool.role(),
            in_use = stats.in_use,
            total = stats.total,
            healthy_targets = stats.healthy_targets,
            "pool health pass complete"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Primary known, both circuits closed, replicas available
    Ok,
    /// Serving, but a circuit is not closed, a pool has no healthy node or
    /// the notification channel is down
    Degraded,
    /// No primary resolved yet
    Unavailable,
    /// Caching switched off, every call goes to the session store
    Disabled,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverallStatus::Ok => "ok",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unavailable => "unavailable",
            OverallStatus::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitStates {
    pub read: CircuitState,
    pub write: CircuitState,
}

/// Health document exposed to operators
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: OverallStatus,
    pub primary: Option<NodeAddr>,
    pub replicas: Vec<NodeAddr>,
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_states: Option<CircuitStates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_stats: Option<PoolManagerStats>,
    pub cache_metrics: MetricsSnapshot,
}

impl HealthReport {
    pub fn disabled(cache_metrics: MetricsSnapshot) -> Self {
        Self {
            status: OverallStatus::Disabled,
            primary: None,
            replicas: Vec::new(),
            epoch: 0,
            circuit_states: None,
            pool_stats: None,
            cache_metrics,
        }
    }

    /// Derive the overall status from the component states
    pub fn evaluate(
        primary_known: bool,
        topology_degraded: bool,
        circuits: CircuitStates,
        pools: &PoolManagerStats,
    ) -> OverallStatus {
        if !primary_known {
            return OverallStatus::Unavailable;
        }
        if topology_degraded
            || circuits.read != CircuitState::Closed
            || circuits.write != CircuitState::Closed
            || pools.read.healthy_targets == 0
            || pools.write.healthy_targets == 0
        {
            return OverallStatus::Degraded;
        }
        OverallStatus::Ok
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
