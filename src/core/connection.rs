/// Backend connections
///
/// The pool, the sentinel client and the health prober only ever talk to
/// `BackendConnection` trait objects produced by a `Connector`. The
/// production connector speaks RESP over a plain TCP stream.
use crate::core::NodeAddr;
use crate::error::{CacheError, CacheResult};
use crate::protocol::{Command, RespParser, RespValue};
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A single established connection to a node
#[async_trait]
pub trait BackendConnection: Send {
    /// Node this connection is bound to
    fn addr(&self) -> &NodeAddr;

    /// Send one command and wait for its reply
    async fn execute(&mut self, command: &Command) -> CacheResult<RespValue>;

    /// Send several commands in one write and collect their replies in order
    async fn pipeline(&mut self, commands: &[Command]) -> CacheResult<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            replies.push(self.execute(command).await?);
        }
        Ok(replies)
    }

    /// Wait for the next frame pushed by the server (pub/sub messages)
    async fn next_frame(&mut self) -> CacheResult<RespValue>;
}

/// Factory for backend connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        addr: &NodeAddr,
        connect_timeout: Duration,
    ) -> CacheResult<Box<dyn BackendConnection>>;
}

/// Connector that opens RESP-over-TCP connections
#[derive(Debug, Clone)]
pub struct RespConnector {
    keepalive: Duration,
    read_buffer_size: usize,
}

impl RespConnector {
    pub fn new() -> Self {
        Self {
            keepalive: Duration::from_secs(60),
            read_buffer_size: 8192, // 8KB buffer by default
        }
    }

    /// Configure stream for low latency and dead-peer detection
    fn configure_stream(&self, stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }
}

impl Default for RespConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RespConnector {
    async fn connect(
        &self,
        addr: &NodeAddr,
        connect_timeout: Duration,
    ) -> CacheResult<Box<dyn BackendConnection>> {
        debug!(node = %addr, "connecting");

        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(node = %addr, error = %e, "connect failed");
                return Err(CacheError::backend(format!("connect to {} failed: {}", addr, e)));
            }
            Err(_) => {
                debug!(node = %addr, "connect timed out");
                return Err(CacheError::timeout(format!("connect to {}", addr)));
            }
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!(node = %addr, error = %e, "failed to configure stream");
        }

        Ok(Box::new(RespConnection {
            addr: addr.clone(),
            stream,
            read_buf: BytesMut::with_capacity(self.read_buffer_size),
        }))
    }
}

/// RESP connection over TCP
pub struct RespConnection {
    addr: NodeAddr,
    stream: TcpStream,
    read_buf: BytesMut,
}

impl RespConnection {
    async fn read_frame(&mut self) -> CacheResult<RespValue> {
        loop {
            if let Some(value) = RespParser::parse(&mut self.read_buf)
                .map_err(|e| CacheError::protocol(e.to_string()))?
            {
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(CacheError::backend(format!(
                    "connection to {} closed by peer",
                    self.addr
                )));
            }
        }
    }
}

#[async_trait]
impl BackendConnection for RespConnection {
    fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn execute(&mut self, command: &Command) -> CacheResult<RespValue> {
        let mut out = BytesMut::new();
        command.encode_into(&mut out);
        self.stream.write_all(&out).await?;
        self.read_frame().await
    }

    async fn pipeline(&mut self, commands: &[Command]) -> CacheResult<Vec<RespValue>> {
        let mut out = BytesMut::new();
        for command in commands {
            command.encode_into(&mut out);
        }
        self.stream.write_all(&out).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_frame().await?);
        }
        Ok(replies)
    }

    async fn next_frame(&mut self) -> CacheResult<RespValue> {
        self.read_frame().await
    }
}
