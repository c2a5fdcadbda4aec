/// Sentinel discovery and failover notifications
///
/// Discovery asks one sentinel for the master address, its replicas, the
/// other sentinels and the master's config epoch. Notifications come from a
/// `+switch-master` subscription on a dedicated connection.
use super::Topology;
use crate::core::{Connector, NodeAddr};
use crate::error::{CacheError, CacheResult};
use crate::protocol::{check_reply, Command, RespValue};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// A primary change announced by a sentinel
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverEvent {
    pub old_primary: NodeAddr,
    pub new_primary: NodeAddr,
    /// Failover generation, when the notification carries one
    pub epoch: Option<u64>,
}

/// Where topology snapshots and failover events come from
#[async_trait]
pub trait SentinelSource: Send + Sync {
    /// Resolve the full topology of `master_name` from one sentinel
    async fn discover(&self, sentinel: &NodeAddr, master_name: &str) -> CacheResult<Topology>;

    /// Open a failover notification stream on one sentinel
    async fn subscribe(
        &self,
        sentinel: &NodeAddr,
        master_name: &str,
    ) -> CacheResult<Box<dyn FailoverStream>>;
}

/// Stream of failover events for a single master
#[async_trait]
pub trait FailoverStream: Send {
    /// Next event, or `None` once the channel has been closed
    async fn next_event(&mut self) -> CacheResult<Option<FailoverEvent>>;
}

/// Sentinel source speaking RESP through a `Connector`
pub struct RespSentinelSource {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    default_quorum: usize,
}

impl RespSentinelSource {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration, default_quorum: usize) -> Self {
        Self {
            connector,
            connect_timeout,
            default_quorum,
        }
    }
}

#[async_trait]
impl SentinelSource for RespSentinelSource {
    async fn discover(&self, sentinel: &NodeAddr, master_name: &str) -> CacheResult<Topology> {
        let mut conn = self.connector.connect(sentinel, self.connect_timeout).await?;

        let replies = conn
            .pipeline(&[
                Command::sentinel("get-master-addr-by-name", master_name),
                Command::sentinel("master", master_name),
                Command::sentinel("replicas", master_name),
                Command::sentinel("sentinels", master_name),
            ])
            .await?;

        let mut replies = replies.into_iter();
        let mut next = |what: &str| {
            replies
                .next()
                .ok_or_else(|| CacheError::protocol(format!("missing reply to SENTINEL {}", what)))
                .and_then(|reply| check_reply("SENTINEL", reply))
        };

        let primary = parse_master_addr(next("get-master-addr-by-name")?)?;
        let master_info = next("master")?
            .into_field_map()
            .ok_or_else(|| CacheError::protocol("SENTINEL master reply is not a field map"))?;
        let replicas = parse_node_list(next("replicas")?, true)?;
        let mut quorum_nodes = parse_node_list(next("sentinels")?, false)?;
        quorum_nodes.push(sentinel.clone());
        quorum_nodes.sort();
        quorum_nodes.dedup();

        let quorum_size = field_u64(&master_info, "quorum")
            .map(|q| q as usize)
            .unwrap_or(self.default_quorum);
        let epoch = field_u64(&master_info, "config-epoch").unwrap_or(0);

        debug!(sentinel = %sentinel, primary = %primary, replicas = replicas.len(), epoch, "discovered topology");

        Ok(Topology {
            primary,
            replicas,
            quorum_nodes,
            quorum_size,
            epoch,
        })
    }

    async fn subscribe(
        &self,
        sentinel: &NodeAddr,
        master_name: &str,
    ) -> CacheResult<Box<dyn FailoverStream>> {
        let mut conn = self.connector.connect(sentinel, self.connect_timeout).await?;
        let reply = check_reply("SUBSCRIBE", conn.execute(&Command::subscribe(SWITCH_MASTER_CHANNEL)).await?)?;
        expect_subscribe_ack(reply)?;

        Ok(Box::new(RespFailoverStream {
            conn,
            master_name: master_name.to_string(),
        }))
    }
}

struct RespFailoverStream {
    conn: Box<dyn crate::core::BackendConnection>,
    master_name: String,
}

#[async_trait]
impl FailoverStream for RespFailoverStream {
    async fn next_event(&mut self) -> CacheResult<Option<FailoverEvent>> {
        loop {
            let frame = match self.conn.next_frame().await {
                Ok(frame) => frame,
                Err(CacheError::Backend { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };

            if let Some(event) = parse_switch_master(frame, &self.master_name)? {
                return Ok(Some(event));
            }
        }
    }
}

fn expect_subscribe_ack(reply: RespValue) -> CacheResult<()> {
    let kind = reply
        .into_array()
        .and_then(|items| items.into_iter().next())
        .and_then(|first| first.as_str().map(str::to_ascii_lowercase));
    match kind.as_deref() {
        Some("subscribe") => Ok(()),
        _ => Err(CacheError::protocol("unexpected reply to SUBSCRIBE")),
    }
}

fn parse_master_addr(reply: RespValue) -> CacheResult<NodeAddr> {
    if reply.is_null() {
        return Err(CacheError::topology_unresolved("sentinel does not know this master"));
    }
    let parts = reply
        .into_array()
        .ok_or_else(|| CacheError::protocol("master address reply is not an array"))?;
    match parts.as_slice() {
        [host, port] => {
            let host = host
                .as_str()
                .ok_or_else(|| CacheError::protocol("master host is not a string"))?;
            let port = port
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| CacheError::protocol("master port is not a valid port"))?;
            Ok(NodeAddr::new(host, port))
        }
        _ => Err(CacheError::protocol("master address reply must have two elements")),
    }
}

/// Parse the array of field maps returned by `SENTINEL replicas|sentinels`.
/// With `skip_down`, nodes flagged down or disconnected are left out.
fn parse_node_list(reply: RespValue, skip_down: bool) -> CacheResult<Vec<NodeAddr>> {
    let entries = reply
        .into_array()
        .ok_or_else(|| CacheError::protocol("node list reply is not an array"))?;

    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .into_field_map()
            .ok_or_else(|| CacheError::protocol("node entry is not a field map"))?;

        if skip_down {
            let flags = field_str(&fields, "flags").unwrap_or_default();
            if flags
                .split(',')
                .any(|flag| matches!(flag, "s_down" | "o_down" | "disconnected"))
            {
                continue;
            }
        }

        let host = field_str(&fields, "ip")
            .ok_or_else(|| CacheError::protocol("node entry missing ip"))?;
        let port = field_u64(&fields, "port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| CacheError::protocol("node entry missing port"))?;
        nodes.push(NodeAddr::new(host, port));
    }
    Ok(nodes)
}

/// Decode a pub/sub frame. Returns `None` for frames that are not a
/// `+switch-master` message for our master.
fn parse_switch_master(frame: RespValue, master_name: &str) -> CacheResult<Option<FailoverEvent>> {
    let Some(parts) = frame.into_array() else {
        return Ok(None);
    };
    let [kind, _channel, payload] = parts.as_slice() else {
        return Ok(None);
    };
    if kind.as_str() != Some("message") {
        return Ok(None);
    }

    let payload = payload
        .as_str()
        .ok_or_else(|| CacheError::protocol("switch-master payload is not text"))?;
    let fields: Vec<&str> = payload.split_whitespace().collect();
    let [name, old_host, old_port, new_host, new_port] = fields.as_slice() else {
        return Err(CacheError::protocol(format!(
            "malformed switch-master payload: {}",
            payload
        )));
    };
    if *name != master_name {
        return Ok(None);
    }

    let port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| CacheError::protocol(format!("invalid port in switch-master: {}", p)))
    };

    Ok(Some(FailoverEvent {
        old_primary: NodeAddr::new(*old_host, port(*old_port)?),
        new_primary: NodeAddr::new(*new_host, port(*new_port)?),
        epoch: None,
    }))
}

fn field_str(fields: &HashMap<String, Bytes>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(|v| std::str::from_utf8(v).ok())
        .map(str::to_string)
}

fn field_u64(fields: &HashMap<String, Bytes>, name: &str) -> Option<u64> {
    fields.get(name).and_then(|v| btoi::btou(v).ok())
}
